//! Transfer records and the global queue (spec.md §4.H).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Download,
    Upload,
}

/// `Queued -> Waiting -> Running -> Stopped`, plus `Stop` as a cross-thread
/// cancellation request the streaming loop observes cooperatively (spec.md
/// §4.H: "`Stop` as a cancel request from another thread that Running
/// checks each loop iteration").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    Waiting,
    Running,
    Stop,
    Stopped,
}

/// The `login+ip` grouping key concurrency caps are evaluated against
/// (spec.md §4.H step 1 / GLOSSARY "Transfer key").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub login: String,
    pub ip: std::net::IpAddr,
}

/// An in-flight or queued file movement. Mutable progress fields are
/// guarded by an internal `RwLock`; `Stop` is a plain `AtomicBool` so the
/// scheduler can request cancellation without taking the lock (spec.md §3:
/// "modeled as an `AtomicBool` checked cooperatively by the streaming
/// loop").
pub struct Transfer {
    pub id: Uuid,
    pub session_id: u32,
    pub key: TransferKey,
    pub kind: TransferKind,
    pub virtual_path: String,
    pub data_path: PathBuf,
    pub resource_path: Option<PathBuf>,
    pub data_size: u64,
    pub resource_size: u64,
    pub executable: bool,
    pub finder_info: Option<Vec<u8>>,

    pub state: RwLock<TransferState>,
    pub queue_position: AtomicU64,
    pub data_offset: AtomicU64,
    pub resource_offset: AtomicU64,
    pub bytes_transferred: AtomicU64,
    pub queued_at: DateTime<Utc>,
    pub waiting_at: RwLock<Option<DateTime<Utc>>>,
    pub stop_requested: AtomicBool,
}

impl Transfer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: u32,
        key: TransferKey,
        kind: TransferKind,
        virtual_path: String,
        data_path: PathBuf,
        resource_path: Option<PathBuf>,
        data_size: u64,
        resource_size: u64,
        data_offset: u64,
        resource_offset: u64,
        executable: bool,
        finder_info: Option<Vec<u8>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            session_id,
            key,
            kind,
            virtual_path,
            data_path,
            resource_path,
            data_size,
            resource_size,
            executable,
            finder_info,
            state: RwLock::new(TransferState::Queued),
            queue_position: AtomicU64::new(0),
            data_offset: AtomicU64::new(data_offset),
            resource_offset: AtomicU64::new(resource_offset),
            bytes_transferred: AtomicU64::new(0),
            queued_at: Utc::now(),
            waiting_at: RwLock::new(None),
            stop_requested: AtomicBool::new(false),
        })
    }

    pub async fn state(&self) -> TransferState {
        *self.state.read().await
    }

    pub async fn set_state(&self, state: TransferState) {
        *self.state.write().await = state;
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

/// The global ordered list of transfers plus the active-transfer counters
/// the scheduler consults (spec.md §5: "one rwlock on the global list; one
/// mutex on global counters").
pub struct TransferQueue {
    transfers: RwLock<Vec<Arc<Transfer>>>,
    active_downloads: AtomicU64,
    active_uploads: AtomicU64,
    active_by_key: RwLock<HashMap<TransferKey, (u64, u64)>>,
}

impl TransferQueue {
    pub fn new() -> Self {
        Self {
            transfers: RwLock::new(Vec::new()),
            active_downloads: AtomicU64::new(0),
            active_uploads: AtomicU64::new(0),
            active_by_key: RwLock::new(HashMap::new()),
        }
    }

    pub async fn enqueue(&self, transfer: Arc<Transfer>) {
        self.transfers.write().await.push(transfer);
    }

    pub async fn remove(&self, id: Uuid) -> Option<Arc<Transfer>> {
        let mut transfers = self.transfers.write().await;
        let idx = transfers.iter().position(|t| t.id == id)?;
        Some(transfers.remove(idx))
    }

    pub async fn all(&self) -> Vec<Arc<Transfer>> {
        self.transfers.read().await.clone()
    }

    pub async fn by_session(&self, session_id: u32) -> Option<Arc<Transfer>> {
        self.transfers
            .read()
            .await
            .iter()
            .find(|t| t.session_id == session_id)
            .cloned()
    }

    pub async fn by_id(&self, id: Uuid) -> Option<Arc<Transfer>> {
        self.transfers.read().await.iter().find(|t| t.id == id).cloned()
    }

    pub fn active_count(&self, kind: TransferKind) -> u64 {
        match kind {
            TransferKind::Download => self.active_downloads.load(Ordering::SeqCst),
            TransferKind::Upload => self.active_uploads.load(Ordering::SeqCst),
        }
    }

    pub async fn active_count_for_key(&self, key: &TransferKey, kind: TransferKind) -> u64 {
        let table = self.active_by_key.read().await;
        let (downloads, uploads) = table.get(key).copied().unwrap_or((0, 0));
        match kind {
            TransferKind::Download => downloads,
            TransferKind::Upload => uploads,
        }
    }

    pub async fn mark_started(&self, key: &TransferKey, kind: TransferKind) {
        match kind {
            TransferKind::Download => self.active_downloads.fetch_add(1, Ordering::SeqCst),
            TransferKind::Upload => self.active_uploads.fetch_add(1, Ordering::SeqCst),
        };
        let mut table = self.active_by_key.write().await;
        let entry = table.entry(key.clone()).or_insert((0, 0));
        match kind {
            TransferKind::Download => entry.0 += 1,
            TransferKind::Upload => entry.1 += 1,
        }
    }

    pub async fn mark_finished(&self, key: &TransferKey, kind: TransferKind) {
        match kind {
            TransferKind::Download => {
                self.active_downloads.fetch_sub(1, Ordering::SeqCst);
            }
            TransferKind::Upload => {
                self.active_uploads.fetch_sub(1, Ordering::SeqCst);
            }
        };
        let mut table = self.active_by_key.write().await;
        if let Some(entry) = table.get_mut(key) {
            match kind {
                TransferKind::Download => entry.0 = entry.0.saturating_sub(1),
                TransferKind::Upload => entry.1 = entry.1.saturating_sub(1),
            }
            if *entry == (0, 0) {
                table.remove(key);
            }
        }
    }
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn key() -> TransferKey {
        TransferKey {
            login: "alice".into(),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    #[tokio::test]
    async fn enqueue_and_remove_round_trip() {
        let queue = TransferQueue::new();
        let transfer = Transfer::new(
            1,
            key(),
            TransferKind::Download,
            "a.txt".into(),
            PathBuf::from("/tmp/a.txt"),
            None,
            10,
            0,
            0,
            0,
            false,
            None,
        );
        let id = transfer.id;
        queue.enqueue(transfer).await;
        assert_eq!(queue.all().await.len(), 1);
        assert!(queue.remove(id).await.is_some());
        assert!(queue.all().await.is_empty());
    }

    #[tokio::test]
    async fn active_counters_track_per_key_and_global() {
        let queue = TransferQueue::new();
        queue.mark_started(&key(), TransferKind::Download).await;
        assert_eq!(queue.active_count(TransferKind::Download), 1);
        assert_eq!(
            queue.active_count_for_key(&key(), TransferKind::Download).await,
            1
        );
        queue.mark_finished(&key(), TransferKind::Download).await;
        assert_eq!(queue.active_count(TransferKind::Download), 0);
        assert_eq!(
            queue.active_count_for_key(&key(), TransferKind::Download).await,
            0
        );
    }

    #[tokio::test]
    async fn stop_request_is_observable_without_locking_state() {
        let transfer = Transfer::new(
            1,
            key(),
            TransferKind::Upload,
            "a.txt".into(),
            PathBuf::from("/tmp/a.txt"),
            None,
            10,
            0,
            0,
            0,
            false,
            None,
        );
        assert!(!transfer.is_stop_requested());
        transfer.request_stop();
        assert!(transfer.is_stop_requested());
    }
}
