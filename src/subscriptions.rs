//! Per-session subscription registry (spec.md §4.M).
//!
//! Four singleton feeds (log, accounts, boards, events) are plain booleans.
//! File-tree subscriptions are a set of virtual paths; the same path may be
//! subscribed by several sessions, so the registry that owns the
//! filesystem watch keeps its own refcount and `unsubscribe_all` simply
//! reports which paths this session no longer cares about.

use std::collections::HashSet;

/// One session's subscription state. Lives inside the session alongside its
/// other mutable fields; `unsubscribe_all` is called from
/// `users::registry::UserRegistry::remove_and_cleanup` on logout.
#[derive(Debug, Clone, Default)]
pub struct Subscriptions {
    pub log: bool,
    pub accounts: bool,
    pub boards: bool,
    pub events: bool,
    pub directories: HashSet<String>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_directory(&mut self, path: impl Into<String>) -> bool {
        self.directories.insert(path.into())
    }

    pub fn unsubscribe_directory(&mut self, path: &str) -> bool {
        self.directories.remove(path)
    }

    /// Clears every subscription and returns the directory paths that were
    /// active, so the caller can decrement the shared filesystem-watch
    /// refcounts for each.
    pub fn unsubscribe_all(&mut self) -> Vec<String> {
        self.log = false;
        self.accounts = false;
        self.boards = false;
        self.events = false;
        self.directories.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsubscribe_all_clears_every_feed_and_returns_directories() {
        let mut subs = Subscriptions::new();
        subs.log = true;
        subs.boards = true;
        subs.subscribe_directory("/incoming");
        subs.subscribe_directory("/uploads");

        let mut drained = subs.unsubscribe_all();
        drained.sort();
        assert_eq!(drained, vec!["/incoming".to_string(), "/uploads".to_string()]);
        assert!(!subs.log);
        assert!(!subs.boards);
        assert!(subs.directories.is_empty());
    }

    #[test]
    fn subscribing_twice_to_the_same_path_is_idempotent() {
        let mut subs = Subscriptions::new();
        assert!(subs.subscribe_directory("/a"));
        assert!(!subs.subscribe_directory("/a"));
    }
}
