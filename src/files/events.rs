//! Directory-subscription fanout (spec.md §4.G / §4.M).
//!
//! The original relies on an OS-level filesystem-watch API; nothing in this
//! workspace's dependency stack provides that, so subscriptions are driven
//! entirely by the tree-mutation call sites in [`super::tree`] notifying
//! this registry directly once a durable write completes (spec.md §5: "tree
//! mutation completes on disk before the broadcast is issued").

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

/// Maps a subscribed virtual directory path to the session ids watching it.
/// A path may be subscribed by more than one session; unsubscribing a
/// session that is not the last subscriber leaves the others untouched.
pub struct DirectoryEvents {
    subscribers: RwLock<HashMap<String, HashSet<u32>>>,
}

impl DirectoryEvents {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self, path: &str, session_id: u32) {
        let mut table = self.subscribers.write().await;
        table.entry(path.to_string()).or_default().insert(session_id);
    }

    /// Returns true if `session_id` was actually subscribed to `path`.
    pub async fn unsubscribe(&self, path: &str, session_id: u32) -> bool {
        let mut table = self.subscribers.write().await;
        let Some(set) = table.get_mut(path) else {
            return false;
        };
        let removed = set.remove(&session_id);
        if set.is_empty() {
            table.remove(path);
        }
        removed
    }

    /// Drops every subscription held by `session_id`, across all paths
    /// (called from connection teardown).
    pub async fn unsubscribe_all(&self, session_id: u32) {
        let mut table = self.subscribers.write().await;
        table.retain(|_, set| {
            set.remove(&session_id);
            !set.is_empty()
        });
    }

    /// Session ids to notify that `path` changed.
    pub async fn subscribers_of(&self, path: &str) -> Vec<u32> {
        let table = self.subscribers.read().await;
        table
            .get(path)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn is_subscribed(&self, path: &str, session_id: u32) -> bool {
        let table = self.subscribers.read().await;
        table
            .get(path)
            .map(|set| set.contains(&session_id))
            .unwrap_or(false)
    }
}

impl Default for DirectoryEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multiple_subscribers_share_a_path() {
        let events = DirectoryEvents::new();
        events.subscribe("docs", 1).await;
        events.subscribe("docs", 2).await;
        let mut subs = events.subscribers_of("docs").await;
        subs.sort();
        assert_eq!(subs, vec![1, 2]);
    }

    #[tokio::test]
    async fn unsubscribe_leaves_other_subscribers_intact() {
        let events = DirectoryEvents::new();
        events.subscribe("docs", 1).await;
        events.subscribe("docs", 2).await;
        assert!(events.unsubscribe("docs", 1).await);
        assert_eq!(events.subscribers_of("docs").await, vec![2]);
    }

    #[tokio::test]
    async fn unsubscribe_all_clears_every_path_for_that_session() {
        let events = DirectoryEvents::new();
        events.subscribe("docs", 1).await;
        events.subscribe("images", 1).await;
        events.subscribe("images", 2).await;
        events.unsubscribe_all(1).await;
        assert!(events.subscribers_of("docs").await.is_empty());
        assert_eq!(events.subscribers_of("images").await, vec![2]);
    }

    #[tokio::test]
    async fn unsubscribe_of_unknown_session_returns_false() {
        let events = DirectoryEvents::new();
        events.subscribe("docs", 1).await;
        assert!(!events.unsubscribe("docs", 99).await);
    }
}
