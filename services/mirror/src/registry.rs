//! The mirror's memory of upstream announcements.
//!
//! Maps every seen uid to the announcements that offered it, in arrival
//! order. The first announcement wins the re-publish; the rest are kept as
//! fallback sources for downstream fetches. Entries are pruned when the
//! mirrored copy is deleted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ferry_protocol::Message;

#[derive(Clone, Default)]
pub struct FileRegistry {
    inner: Arc<Mutex<HashMap<String, Vec<Message>>>>,
}

impl FileRegistry {
    pub fn new() -> FileRegistry {
        FileRegistry::default()
    }

    /// Record an announcement. Returns true when this uid is new, in which case the
    /// caller should re-publish exactly then.
    pub fn record(&self, uid: &str, msg: Message) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(uid) {
            Some(sources) => {
                sources.push(msg);
                false
            }
            None => {
                inner.insert(uid.to_owned(), vec![msg]);
                true
            }
        }
    }

    /// The known sources for a uid, first announcement first.
    pub fn sources(&self, uid: &str) -> Vec<Message> {
        self.inner
            .lock()
            .unwrap()
            .get(uid)
            .cloned()
            .unwrap_or_default()
    }

    pub fn prune(&self, uid: &str) {
        self.inner.lock().unwrap().remove(uid);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_protocol::MessageType;
    use serde_json::json;

    fn announcement(from: &str) -> Message {
        Message::new(
            "/t",
            MessageType::File,
            json!({"uid": "F", "uri": "/in/F", "request_address": from}),
        )
    }

    #[test]
    fn first_recording_wins_later_ones_append() {
        let registry = FileRegistry::new();
        assert!(registry.record("F", announcement("one:9094")));
        assert!(!registry.record("F", announcement("two:9094")));

        let sources = registry.sources("F");
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].data["request_address"], "one:9094");
    }

    #[test]
    fn prune_forgets_the_uid() {
        let registry = FileRegistry::new();
        registry.record("F", announcement("one:9094"));
        registry.prune("F");
        assert!(registry.sources("F").is_empty());
        assert!(registry.is_empty());
    }
}
