//! Duplicate inbound event detection.
//!
//! The conversation record already remembers the newest event ids, but a
//! terminated conversation is archived together with that window. The
//! [`Deduplicator`] hook lets the transport side keep ids across archives.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use parley_types::ConversationKey;

#[async_trait]
pub trait Deduplicator: Send + Sync {
    async fn seen(&self, key: &ConversationKey, event_id: &str) -> bool;

    /// Called once the turn for `event_id` has been persisted.
    async fn record(&self, key: &ConversationKey, event_id: &str);
}

/// Relies on the window stored in the conversation record alone.
pub struct NoDedup;

#[async_trait]
impl Deduplicator for NoDedup {
    async fn seen(&self, _key: &ConversationKey, _event_id: &str) -> bool {
        false
    }

    async fn record(&self, _key: &ConversationKey, _event_id: &str) {}
}

/// Keeps the newest `window` event ids per conversation in memory.
pub struct RecentEvents {
    window: usize,
    ids: Mutex<HashMap<ConversationKey, VecDeque<String>>>,
}

impl RecentEvents {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            ids: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Deduplicator for RecentEvents {
    async fn seen(&self, key: &ConversationKey, event_id: &str) -> bool {
        self.ids
            .lock()
            .get(key)
            .is_some_and(|ids| ids.iter().any(|id| id == event_id))
    }

    async fn record(&self, key: &ConversationKey, event_id: &str) {
        let mut all = self.ids.lock();
        let ids = all.entry(key.clone()).or_default();
        if ids.iter().any(|id| id == event_id) {
            return;
        }
        ids.push_back(event_id.to_string());
        while ids.len() > self.window {
            ids.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remembers_recorded_ids_per_key() {
        let dedup = RecentEvents::new(8);
        let a = ConversationKey::new("acme", "u1");
        let b = ConversationKey::new("acme", "u2");
        dedup.record(&a, "e1").await;
        assert!(dedup.seen(&a, "e1").await);
        assert!(!dedup.seen(&b, "e1").await);
        assert!(!dedup.seen(&a, "e2").await);
    }

    #[tokio::test]
    async fn forgets_beyond_window() {
        let dedup = RecentEvents::new(2);
        let key = ConversationKey::new("acme", "u1");
        for id in ["e1", "e2", "e3"] {
            dedup.record(&key, id).await;
        }
        assert!(!dedup.seen(&key, "e1").await);
        assert!(dedup.seen(&key, "e2").await);
        assert!(dedup.seen(&key, "e3").await);
    }

    #[tokio::test]
    async fn no_dedup_never_reports_seen() {
        let key = ConversationKey::new("acme", "u1");
        NoDedup.record(&key, "e1").await;
        assert!(!NoDedup.seen(&key, "e1").await);
    }
}
