use serde::Serialize;

use crate::error::{BrowserError, Result};
use crate::model::{normalize_prefix, parent_prefix};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breadcrumb {
    pub label: String,
    pub prefix: String,
}

/// Folder the browsing session is scoped to. Empty at the bucket root,
/// otherwise always ends with `/`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PathState {
    current: String,
}

impl PathState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn is_root(&self) -> bool {
        self.current.is_empty()
    }

    pub fn navigate(&mut self, prefix: &str) {
        self.current = normalize_prefix(prefix.trim_start_matches('/'));
    }

    pub fn go_up(&mut self) {
        self.current = parent_prefix(&self.current).to_string();
    }

    pub fn reset(&mut self) {
        self.current.clear();
    }

    /// Full key for `name` inside the current folder.
    pub fn resolve(&self, name: &str) -> Result<String> {
        Ok(format!("{}{}", self.current, validate_name(name)?))
    }

    pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
        let mut crumbs = vec![Breadcrumb {
            label: "Root".to_string(),
            prefix: String::new(),
        }];
        let mut prefix = String::new();
        for part in self.current.split('/').filter(|part| !part.is_empty()) {
            prefix.push_str(part);
            prefix.push('/');
            crumbs.push(Breadcrumb {
                label: part.to_string(),
                prefix: prefix.clone(),
            });
        }
        crumbs
    }
}

/// A single path segment typed by the user.
pub fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(BrowserError::invalid("Name cannot be empty"));
    }
    if name.contains('/') {
        return Err(BrowserError::invalid(format!("Name cannot contain '/': {name}")));
    }
    if name == "." || name == ".." {
        return Err(BrowserError::invalid(format!("Reserved name: {name}")));
    }
    Ok(name)
}
