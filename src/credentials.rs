//! Proxy credential store
//!
//! The active set is swapped wholesale; readers load a snapshot without
//! taking a lock. An empty set means every client is accepted.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Concurrently readable username/password set
#[derive(Debug)]
pub struct CredentialStore {
    entries: ArcSwap<HashMap<String, String>>,
}

impl CredentialStore {
    /// Create an empty (accept-all) store
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Create a store preloaded with `entries`
    pub fn with_entries<I, U, P>(entries: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        let store = Self::new();
        store.update(entries);
        store
    }

    /// Replace the whole credential set
    pub fn update<I, U, P>(&self, entries: I)
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        let map: HashMap<String, String> = entries
            .into_iter()
            .map(|(u, p)| (u.into(), p.into()))
            .collect();
        info!("Credential set replaced ({} entries)", map.len());
        self.entries.store(Arc::new(map));
    }

    /// Exact match against the current set
    pub fn validate(&self, username: &str, password: &str) -> bool {
        self.entries
            .load()
            .get(username)
            .is_some_and(|expected| expected == password)
    }

    /// Whether enforcement applies at all
    pub fn has_credentials(&self) -> bool {
        !self.entries.load().is_empty()
    }

    /// Accept when the store is empty, otherwise require a match
    pub fn permits(&self, offered: Option<(&str, &str)>) -> bool {
        let entries = self.entries.load();
        if entries.is_empty() {
            return true;
        }
        match offered {
            Some((user, pass)) => entries.get(user).is_some_and(|p| p == pass),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}
