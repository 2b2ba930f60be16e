//! RAII guards that keep the same work from running twice at once.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// Identity of one annotation being processed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InFlightKey {
    pub path: String,
    pub start_line: usize,
    pub anchor: Option<String>,
    pub uuid: Option<String>,
}

/// Set of keys currently held.
pub struct GuardSet<K> {
    active: Arc<Mutex<HashSet<K>>>,
}

impl<K> Default for GuardSet<K> {
    fn default() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> GuardSet<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a key. `None` while another guard holds it.
    pub fn try_acquire(&self, key: K) -> Option<Guard<K>> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(key.clone()) {
            return None;
        }
        Some(Guard {
            active: Arc::clone(&self.active),
            key,
        })
    }

    pub fn is_held(&self, key: &K) -> bool {
        self.active
            .lock()
            .map(|a| a.contains(key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its key on drop.
pub struct Guard<K: Eq + Hash> {
    active: Arc<Mutex<HashSet<K>>>,
    key: K,
}

impl<K: Eq + Hash> Drop for Guard<K> {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.key);
    }
}
