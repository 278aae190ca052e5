//! Consumer-side announcement dedupe.
//!
//! A bounded deque of uids. The first provider to announce a file wins the
//! `push`; later announcements of the same uid only earn an `ack`. Overflow
//! evicts the oldest uids, which are then treated as first-seen again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const CONSUMER_CACHE_SIZE: usize = 11_000;

#[derive(Clone)]
pub struct UidCache {
    inner: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl UidCache {
    pub fn new() -> Self {
        Self::with_capacity(CONSUMER_CACHE_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        UidCache {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
        }
    }

    /// True when every uid has been seen before.
    pub fn already_received(&self, uids: &[String]) -> bool {
        if uids.is_empty() {
            return false;
        }
        let cache = self.inner.lock().unwrap();
        uids.iter().all(|uid| cache.contains(uid))
    }

    pub fn record(&self, uids: &[String]) {
        let mut cache = self.inner.lock().unwrap();
        for uid in uids {
            if cache.len() == self.capacity {
                cache.pop_front();
            }
            cache.push_back(uid.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for UidCache {
    fn default() -> Self {
        Self::new()
    }
}
