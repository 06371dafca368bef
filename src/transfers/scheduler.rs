//! The deterministic scheduling algorithm from spec.md §4.H, run whenever a
//! transfer is created, a transfer finishes, or a Waiting transfer times
//! out. Grounded in `wired/transfers.c`'s `wd_transfers_schedule` thread.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use super::queue::{Transfer, TransferKey, TransferKind, TransferQueue, TransferState};

/// One decision the scheduler makes about a single transfer.
pub enum Decision {
    /// Move to Waiting; caller opens files / sends `upload_ready` or starts
    /// streaming the download.
    Start(Arc<Transfer>),
    /// Queue position changed; caller sends `transfer.queue`.
    Requeue(Arc<Transfer>, u64),
}

/// Per-key, per-direction caps resolved from the account's overlaid
/// privileges (0 = unlimited, matching spec.md §4.H step 3).
pub struct Caps {
    pub total_downloads: u32,
    pub total_uploads: u32,
    pub per_user_downloads: u32,
    pub per_user_uploads: u32,
}

/// Runs one scheduling pass over every Queued transfer of `kind`.
///
/// `per_user_cap` resolves a key's account-specific cap (falls back to
/// `caps.per_user_*` when the account sets none); callers pass a closure
/// because the cap comes from `Privileges`, which this module does not
/// depend on directly.
pub async fn schedule(
    queue: &TransferQueue,
    kind: TransferKind,
    caps: &Caps,
    per_user_cap: impl Fn(&TransferKey) -> Option<u32>,
) -> Vec<Decision> {
    let all = queue.all().await;
    let mut by_key: HashMap<TransferKey, Vec<Arc<Transfer>>> = HashMap::new();
    for transfer in all {
        if transfer.kind != kind {
            continue;
        }
        if transfer.state().await != TransferState::Queued {
            continue;
        }
        by_key.entry(transfer.key.clone()).or_default().push(transfer);
    }

    // Sort keys by the oldest queue-time they hold (FIFO fairness).
    let mut keys: Vec<TransferKey> = by_key.keys().cloned().collect();
    keys.sort_by_key(|k| {
        by_key[k]
            .iter()
            .map(|t| t.queued_at)
            .min()
            .unwrap_or_else(Utc::now)
    });

    let global_cap = match kind {
        TransferKind::Download => caps.total_downloads,
        TransferKind::Upload => caps.total_uploads,
    };
    let default_per_user_cap = match kind {
        TransferKind::Download => caps.per_user_downloads,
        TransferKind::Upload => caps.per_user_uploads,
    };

    let mut decisions = Vec::new();
    let mut active_global = queue.active_count(kind);

    for key in keys {
        let head = by_key[&key][0].clone();
        let active_for_key = queue.active_count_for_key(&key, kind).await;
        let user_cap = per_user_cap(&key).unwrap_or(default_per_user_cap);

        let global_ok = global_cap == 0 || active_global < global_cap as u64;
        let user_ok = user_cap == 0 || active_for_key < user_cap as u64;

        if global_ok && user_ok {
            active_global += 1;
            decisions.push(Decision::Start(head));
        } else {
            let queue_position = decisions
                .iter()
                .filter(|d| matches!(d, Decision::Requeue(..)))
                .count() as u64
                + 1;
            let previous = head.queue_position.load(std::sync::atomic::Ordering::SeqCst);
            if previous != queue_position {
                head.queue_position
                    .store(queue_position, std::sync::atomic::Ordering::SeqCst);
                decisions.push(Decision::Requeue(head, queue_position));
            }
        }
    }

    decisions
}

/// Drops Waiting transfers that have sat longer than `timeout_secs` without
/// entering Running, returning them to Queued so the next scheduling pass
/// reconsiders them (spec.md §4.H: "dropped and rescheduled").
pub async fn sweep_waiting_timeouts(queue: &TransferQueue, timeout_secs: i64) -> Vec<Arc<Transfer>> {
    let mut expired = Vec::new();
    for transfer in queue.all().await {
        if transfer.state().await != TransferState::Waiting {
            continue;
        }
        let waiting_since = *transfer.waiting_at.read().await;
        if let Some(since) = waiting_since {
            if Utc::now().signed_duration_since(since).num_seconds() >= timeout_secs {
                transfer.set_state(TransferState::Queued).await;
                *transfer.waiting_at.write().await = None;
                expired.push(transfer);
            }
        }
    }
    expired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfers::queue::Transfer;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::PathBuf;

    fn key(login: &str) -> TransferKey {
        TransferKey {
            login: login.into(),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    fn transfer(login: &str) -> Arc<Transfer> {
        Transfer::new(
            1,
            key(login),
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
        )
    }

    #[tokio::test]
    async fn global_cap_of_one_starts_only_the_first_key() {
        let queue = TransferQueue::new();
        queue.enqueue(transfer("alice")).await;
        queue.enqueue(transfer("bob")).await;

        let caps = Caps {
            total_downloads: 1,
            total_uploads: 0,
            per_user_downloads: 0,
            per_user_uploads: 0,
        };
        let decisions = schedule(&queue, TransferKind::Download, &caps, |_| None).await;
        let starts = decisions
            .iter()
            .filter(|d| matches!(d, Decision::Start(_)))
            .count();
        let requeues = decisions
            .iter()
            .filter(|d| matches!(d, Decision::Requeue(_, 1)))
            .count();
        assert_eq!(starts, 1);
        assert_eq!(requeues, 1);
    }

    #[tokio::test]
    async fn zero_cap_means_unlimited() {
        let queue = TransferQueue::new();
        queue.enqueue(transfer("alice")).await;
        queue.enqueue(transfer("bob")).await;
        let caps = Caps {
            total_downloads: 0,
            total_uploads: 0,
            per_user_downloads: 0,
            per_user_uploads: 0,
        };
        let decisions = schedule(&queue, TransferKind::Download, &caps, |_| None).await;
        let starts = decisions
            .iter()
            .filter(|d| matches!(d, Decision::Start(_)))
            .count();
        assert_eq!(starts, 2);
    }

    #[tokio::test]
    async fn waiting_timeout_returns_transfer_to_queued() {
        let queue = TransferQueue::new();
        let transfer = transfer("alice");
        transfer.set_state(TransferState::Waiting).await;
        *transfer.waiting_at.write().await = Some(Utc::now() - chrono::Duration::seconds(30));
        queue.enqueue(transfer.clone()).await;

        let expired = sweep_waiting_timeouts(&queue, 20).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(transfer.state().await, TransferState::Queued);
    }
}
