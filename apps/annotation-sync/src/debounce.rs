//! Per-document trailing-edge debounce.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

/// What to run once a document's timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassMode {
    /// Detect, then reconcile with the card store.
    Sync,
    /// Detect and register identities only.
    DetectOnly,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    deadline: DateTime<Utc>,
    mode: PassMode,
    /// Set by a creation. Pins the pass to `DetectOnly` until it fires.
    first_pass: bool,
}

/// Deadlines keyed by document path. Time comes from the caller.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    pending: HashMap<String, Pending>,
}

impl Debouncer {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::milliseconds(delay_ms as i64),
            pending: HashMap::new(),
        }
    }

    pub fn set_delay(&mut self, delay_ms: u64) {
        self.delay = Duration::milliseconds(delay_ms as i64);
    }

    /// Start or restart the timer for a path.
    ///
    /// A pending `Sync` is never downgraded to `DetectOnly`, and a pending
    /// first pass is never upgraded to `Sync`.
    pub fn schedule(&mut self, path: &str, mode: PassMode, now: DateTime<Utc>) {
        let deadline = now + self.delay;
        let (mode, first_pass) = match self.pending.get(path) {
            Some(existing) if existing.first_pass => (PassMode::DetectOnly, true),
            Some(existing) if existing.mode == PassMode::Sync => (PassMode::Sync, false),
            _ => (mode, false),
        };
        self.pending.insert(
            path.to_string(),
            Pending {
                deadline,
                mode,
                first_pass,
            },
        );
    }

    /// Start the timer for a newly created path. Later edits inside the same
    /// window restart the timer but keep the pass detect-only.
    pub fn schedule_first_pass(&mut self, path: &str, now: DateTime<Utc>) {
        self.pending.insert(
            path.to_string(),
            Pending {
                deadline: now + self.delay,
                mode: PassMode::DetectOnly,
                first_pass: true,
            },
        );
    }

    /// Drop a pending timer. Returns true if one existed.
    pub fn cancel(&mut self, path: &str) -> bool {
        self.pending.remove(path).is_some()
    }

    /// Move a pending timer to a new path, keeping its deadline.
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        match self.pending.remove(from) {
            Some(pending) => {
                self.pending.insert(to.to_string(), pending);
                true
            }
            None => false,
        }
    }

    /// Remove and return every timer whose deadline has passed, oldest first.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<(String, PassMode)> {
        let mut due: Vec<(String, Pending)> = Vec::new();
        self.pending.retain(|path, pending| {
            if pending.deadline <= now {
                due.push((path.clone(), *pending));
                false
            } else {
                true
            }
        });
        due.sort_by(|a, b| a.1.deadline.cmp(&b.1.deadline).then_with(|| a.0.cmp(&b.0)));
        due.into_iter().map(|(path, p)| (path, p.mode)).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, path: &str) -> bool {
        self.pending.contains_key(path)
    }

    pub fn mode_of(&self, path: &str) -> Option<PassMode> {
        self.pending.get(path).map(|p| p.mode)
    }
}
