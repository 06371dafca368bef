//! Event log (spec.md §4.I): an in-memory ring of recent events, flushed
//! periodically to disk and rotated to timestamped archives once full.

use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

const RING_CAPACITY: usize = 5000;
const FLUSH_EVERY: usize = 100;

/// Kinds that get deduplicated when repeated back-to-back by the same actor
/// (spec.md §4.I: "noisy" kinds).
const NOISY_KINDS: &[&str] = &["got_users", "got_info"];

/// Events deduplicate against at most this many of the most recent entries
/// from the same actor.
const DEDUP_WINDOW: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub kind: String,
    pub actor: String,
    pub params: Vec<String>,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: impl Into<String>, actor: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            kind: kind.into(),
            actor: actor.into(),
            params,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct EventsFile {
    events: Vec<Event>,
}

pub struct EventLog {
    dir: PathBuf,
    ring: RwLock<VecDeque<Event>>,
    since_flush: RwLock<usize>,
}

impl EventLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ring: RwLock::new(VecDeque::with_capacity(RING_CAPACITY)),
            since_flush: RwLock::new(0),
        }
    }

    /// Adds an event, applying noisy-kind dedup, and returns it unless it
    /// was suppressed as a duplicate (callers fan out the returned event to
    /// event-feed subscribers; a `None` means nothing should be broadcast).
    pub async fn add_event(
        &self,
        kind: impl Into<String>,
        actor: impl Into<String>,
        params: Vec<String>,
    ) -> crate::error::WiredResult<Option<Event>> {
        let kind = kind.into();
        let actor = actor.into();
        let event = Event::new(kind.clone(), actor.clone(), params);

        let mut ring = self.ring.write().await;
        if NOISY_KINDS.contains(&kind.as_str()) {
            let duplicate = ring
                .iter()
                .rev()
                .take(DEDUP_WINDOW)
                .any(|e| e.actor == actor && e.kind == kind);
            if duplicate {
                return Ok(None);
            }
        }

        if ring.len() >= RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(event.clone());
        drop(ring);

        let mut since_flush = self.since_flush.write().await;
        *since_flush += 1;
        if *since_flush >= FLUSH_EVERY {
            *since_flush = 0;
            drop(since_flush);
            self.flush().await?;
        }

        if self.ring_len().await >= RING_CAPACITY {
            self.rotate().await?;
        }

        Ok(Some(event))
    }

    async fn ring_len(&self) -> usize {
        self.ring.read().await.len()
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join("current.log")
    }

    /// Writes the full ring to the current on-disk file (write-to-tempfile
    /// then atomic rename, per spec.md §7's durability requirement).
    pub async fn flush(&self) -> crate::error::WiredResult<()> {
        use crate::error::WiredError;
        std::fs::create_dir_all(&self.dir).map_err(|e| WiredError::io(e, &self.dir))?;
        let ring = self.ring.read().await;
        let file = EventsFile {
            events: ring.iter().cloned().collect(),
        };
        let text = toml::to_string_pretty(&file)
            .map_err(|e| WiredError::Internal(format!("serializing event log: {}", e)))?;
        let path = self.current_path();
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, text.as_bytes()).map_err(|e| WiredError::io(e, &tmp))?;
        std::fs::rename(&tmp, &path).map_err(|e| WiredError::io(e, &path))
    }

    /// Renames the current file to an RFC3339-timestamped archive and
    /// starts a fresh ring (spec.md §4.I: "when the cap is reached the
    /// current file is renamed to `<rfc3339-timestamp>`").
    async fn rotate(&self) -> crate::error::WiredResult<()> {
        use crate::error::WiredError;
        self.flush().await?;
        let archive_name = Utc::now().to_rfc3339().replace(':', "-");
        let archive_path = self.dir.join(&archive_name);
        let current = self.current_path();
        if current.exists() {
            std::fs::rename(&current, &archive_path).map_err(|e| WiredError::io(e, &current))?;
        }
        self.ring.write().await.clear();
        Ok(())
    }

    /// Enumerates archive filenames, oldest first.
    pub fn reply_archives(&self) -> crate::error::WiredResult<Vec<String>> {
        use crate::error::WiredError;
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = std::fs::read_dir(&self.dir)
            .map_err(|e| WiredError::io(e, &self.dir))?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name != "current.log" && !name.ends_with(".tmp"))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Streams one archive by name, or the live ring when `archive` is
    /// `None`.
    pub async fn reply_events(
        &self,
        archive: Option<&str>,
    ) -> crate::error::WiredResult<Vec<Event>> {
        use crate::error::WiredError;
        match archive {
            None => Ok(self.ring.read().await.iter().cloned().collect()),
            Some(name) => {
                let path = self.archive_path(name)?;
                let text = std::fs::read_to_string(&path).map_err(|e| WiredError::io(e, &path))?;
                let file: EventsFile = toml::from_str(&text)
                    .map_err(|e| WiredError::Internal(format!("parsing archive: {}", e)))?;
                Ok(file.events)
            }
        }
    }

    fn archive_path(&self, name: &str) -> crate::error::WiredResult<PathBuf> {
        if name.contains('/') || name.contains("..") {
            return Err(crate::error::WiredError::FileNotFound(name.to_string()));
        }
        Ok(self.dir.join(name))
    }
}

pub fn is_noisy(kind: &str) -> bool {
    NOISY_KINDS.contains(&kind)
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").field("dir", &self.dir).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noisy_duplicates_within_window_are_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());
        let first = log.add_event("got_users", "alice", vec![]).await.unwrap();
        let second = log.add_event("got_users", "alice", vec![]).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn non_noisy_kinds_are_never_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());
        log.add_event("login", "alice", vec![]).await.unwrap();
        let second = log.add_event("login", "alice", vec![]).await.unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn dedup_window_expires_after_five_other_events() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());
        log.add_event("got_users", "alice", vec![]).await.unwrap();
        for i in 0..5 {
            log.add_event("login", format!("user{i}"), vec![]).await.unwrap();
        }
        let later = log.add_event("got_users", "alice", vec![]).await.unwrap();
        assert!(later.is_some());
    }

    #[tokio::test]
    async fn flush_writes_current_log_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());
        log.add_event("login", "alice", vec![]).await.unwrap();
        log.flush().await.unwrap();
        assert!(dir.path().join("current.log").exists());
    }

    #[tokio::test]
    async fn archive_listing_excludes_current_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());
        log.add_event("login", "alice", vec![]).await.unwrap();
        log.flush().await.unwrap();
        std::fs::write(dir.path().join("2020-01-01T00-00-00Z"), "{}").unwrap();
        let archives = log.reply_archives().unwrap();
        assert_eq!(archives, vec!["2020-01-01T00-00-00Z".to_string()]);
    }
}
