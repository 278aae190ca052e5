//! Producer-side file cache.
//!
//! A bounded deque of `"<topic>/<uid>"` strings, newest first. `info`
//! requests read it by subject prefix; `ack`/`push` use it implicitly
//! through the origin-pattern gate.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const PRODUCER_CACHE_SIZE: usize = 61_000;

#[derive(Clone)]
pub struct FileCache {
    inner: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl FileCache {
    pub fn new() -> Self {
        Self::with_capacity(PRODUCER_CACHE_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        FileCache {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    /// Record a freshly announced file, evicting the oldest entry when full.
    pub fn push(&self, topic: &str, uid: &str) {
        let mut cache = self.inner.lock().unwrap();
        if cache.len() == self.capacity {
            cache.pop_back();
        }
        cache.push_front(format!("{topic}/{uid}"));
    }

    /// Entries whose prefix equals `subject`, newest first, capped at
    /// `max_count`.
    pub fn matching(&self, subject: &str, max_count: usize) -> Vec<String> {
        let cache = self.inner.lock().unwrap();
        cache
            .iter()
            .filter(|entry| entry.starts_with(subject))
            .take(max_count)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FileCache {
    fn default() -> Self {
        Self::new()
    }
}
