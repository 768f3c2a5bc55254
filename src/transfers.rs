use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{BrowserError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferKind {
    Upload,
    Download,
}

impl TransferKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: String,
    pub kind: TransferKind,
    pub file_name: String,
    pub file_size: Option<u64>,
    pub progress: u8,
    pub status: TransferStatus,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferEvent {
    Progress {
        id: String,
        progress: u8,
        file_size: Option<u64>,
    },
    Completed {
        id: String,
    },
    Failed {
        id: String,
        error: String,
    },
}

pub fn calculate_percentage(transferred: u64, total: u64) -> u8 {
    if total == 0 {
        0
    } else {
        (((transferred as f64) / (total as f64)) * 100.0).round().min(100.0) as u8
    }
}

#[derive(Clone, Debug)]
pub struct ProgressSender {
    tx: UnboundedSender<TransferEvent>,
}

impl ProgressSender {
    pub fn send(&self, event: TransferEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("transfer tracker is gone, dropping progress event");
        }
    }

    pub fn reporter(&self, id: impl Into<String>) -> TransferReporter {
        TransferReporter {
            id: id.into(),
            sender: self.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TransferReporter {
    id: String,
    sender: ProgressSender,
}

impl TransferReporter {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn progress(&self, progress: u8) {
        self.sender.send(TransferEvent::Progress {
            id: self.id.clone(),
            progress,
            file_size: None,
        });
    }

    /// In-flight byte progress. Stops at 99 so that only
    /// [`complete`](Self::complete) finishes the transfer.
    pub fn bytes(&self, transferred: u64, total: u64) {
        self.sender.send(TransferEvent::Progress {
            id: self.id.clone(),
            progress: calculate_percentage(transferred, total).min(99),
            file_size: (total > 0).then_some(total),
        });
    }

    pub fn complete(&self) {
        self.sender.send(TransferEvent::Completed {
            id: self.id.clone(),
        });
    }

    pub fn complete_with_size(&self, file_size: u64) {
        self.sender.send(TransferEvent::Progress {
            id: self.id.clone(),
            progress: 100,
            file_size: Some(file_size),
        });
    }

    pub fn fail(&self, error: impl ToString) {
        self.sender.send(TransferEvent::Failed {
            id: self.id.clone(),
            error: error.to_string(),
        });
    }
}

#[derive(Default)]
struct TrackerState {
    order: Vec<String>,
    records: HashMap<String, TransferRecord>,
    inbox: Option<UnboundedReceiver<TransferEvent>>,
}

impl TrackerState {
    fn drain_inbox(&mut self) {
        let Some(mut inbox) = self.inbox.take() else {
            return;
        };
        while let Ok(event) = inbox.try_recv() {
            self.apply(event);
        }
        self.inbox = Some(inbox);
    }

    fn apply(&mut self, event: TransferEvent) -> bool {
        match event {
            TransferEvent::Progress {
                id,
                progress,
                file_size,
            } => self.update(&id, progress, file_size),
            TransferEvent::Completed { id } => self.finish(&id, TransferStatus::Completed, None),
            TransferEvent::Failed { id, error } => {
                self.finish(&id, TransferStatus::Failed, Some(error))
            }
        }
    }

    fn live_record(&mut self, id: &str) -> Option<&mut TransferRecord> {
        match self.records.get_mut(id) {
            Some(record) if !record.status.is_terminal() => Some(record),
            Some(_) => None,
            None => {
                tracing::debug!(id, "event for unknown transfer");
                None
            }
        }
    }

    fn update(&mut self, id: &str, progress: u8, file_size: Option<u64>) -> bool {
        let Some(record) = self.live_record(id) else {
            return false;
        };
        record.progress = progress.min(100);
        if file_size.is_some() {
            record.file_size = file_size;
        }
        record.status = if record.progress == 100 {
            TransferStatus::Completed
        } else {
            TransferStatus::Active
        };
        true
    }

    fn finish(&mut self, id: &str, status: TransferStatus, error: Option<String>) -> bool {
        let Some(record) = self.live_record(id) else {
            return false;
        };
        if status == TransferStatus::Completed {
            record.progress = 100;
        } else {
            tracing::warn!(id, file = %record.file_name, error = ?error, "transfer failed");
        }
        record.status = status;
        record.error = error;
        true
    }
}

/// Transfers in insertion order. Clones share state.
#[derive(Clone, Default)]
pub struct TransferTracker {
    inner: Arc<Mutex<TrackerState>>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress_channel() -> (Self, ProgressSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = Self::new();
        tracker.lock().inbox = Some(rx);
        (tracker, ProgressSender { tx })
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin(&self, kind: TransferKind, file_name: &str, file_size: Option<u64>) -> String {
        let id = format!("{}-{}", kind.as_str(), Uuid::new_v4());
        self.insert(id.clone(), kind, file_name, file_size);
        id
    }

    pub fn begin_with_id(
        &self,
        id: &str,
        kind: TransferKind,
        file_name: &str,
        file_size: Option<u64>,
    ) -> Result<String> {
        if self.lock().records.contains_key(id) {
            return Err(BrowserError::invalid(format!("Transfer id already in use: {id}")));
        }
        self.insert(id.to_string(), kind, file_name, file_size);
        Ok(id.to_string())
    }

    fn insert(&self, id: String, kind: TransferKind, file_name: &str, file_size: Option<u64>) {
        let record = TransferRecord {
            id: id.clone(),
            kind,
            file_name: file_name.to_string(),
            file_size,
            progress: 0,
            status: TransferStatus::Pending,
            error: None,
            start_time: Utc::now(),
        };
        let mut state = self.lock();
        state.order.push(id.clone());
        state.records.insert(id, record);
    }

    /// Records `progress` percent. Ignored once the transfer is terminal.
    pub fn update(&self, id: &str, progress: u8) -> bool {
        self.lock().update(id, progress, None)
    }

    pub fn set_file_size(&self, id: &str, file_size: u64) -> bool {
        match self.lock().live_record(id) {
            Some(record) => {
                record.file_size = Some(file_size);
                true
            }
            None => false,
        }
    }

    pub fn complete(&self, id: &str) -> bool {
        self.lock().finish(id, TransferStatus::Completed, None)
    }

    pub fn fail(&self, id: &str, error: impl ToString) -> bool {
        self.lock()
            .finish(id, TransferStatus::Failed, Some(error.to_string()))
    }

    pub fn apply(&self, event: TransferEvent) -> bool {
        self.lock().apply(event)
    }

    pub fn get(&self, id: &str) -> Option<TransferRecord> {
        let mut state = self.lock();
        state.drain_inbox();
        state.records.get(id).cloned()
    }

    pub fn list(&self) -> Vec<TransferRecord> {
        let mut state = self.lock();
        state.drain_inbox();
        state
            .order
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect()
    }

    pub fn clear(&self, mut predicate: impl FnMut(&TransferRecord) -> bool) -> usize {
        let mut state = self.lock();
        state.drain_inbox();
        let removable: Vec<String> = state
            .records
            .values()
            .filter(|record| predicate(record))
            .map(|record| record.id.clone())
            .collect();
        for id in &removable {
            state.records.remove(id);
        }
        state.order.retain(|id| !removable.contains(id));
        removable.len()
    }

    pub fn clear_completed(&self) -> usize {
        self.clear(|record| record.status == TransferStatus::Completed)
    }

    pub fn remove(&self, id: &str) -> bool {
        self.clear(|record| record.id == id) > 0
    }

    /// Applies events as they arrive instead of on the next read.
    pub fn spawn_listener(&self) -> Option<JoinHandle<()>> {
        let mut inbox = self.lock().inbox.take()?;
        let tracker = self.clone();
        Some(tokio::spawn(async move {
            while let Some(event) = inbox.recv().await {
                tracker.apply(event);
            }
        }))
    }
}
