//! Paths this agent serves
//!
//! One table is shared by the [`Agent`](crate::Agent), which fills it as the
//! relay accepts registrations, and by the fetcher, which resolves each scrape
//! request against it.

use std::collections::HashMap;
use std::sync::RwLock;

/// Path (without leading '/') -> url of the endpoint it is fetched from
#[derive(Debug, Default)]
pub struct PathTable {
    entries: RwLock<HashMap<String, String>>,
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches('/')
}

impl PathTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace `path`, returning the url it had before
    pub fn insert(&self, path: &str, url: &str) -> Option<String> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(normalize(path).to_string(), url.to_string())
    }

    pub fn remove(&self, path: &str) -> Option<String> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(normalize(path))
    }

    /// Url registered for `path`
    pub fn url(&self, path: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(normalize(path))
            .cloned()
    }

    /// All entries, sorted by path
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(path, url)| (path.clone(), url.clone()))
            .collect();
        entries.sort();
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
