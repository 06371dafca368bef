//! The per-transfer streaming loop: fixed-size buffer, data-then-resource
//! fork alternation, speed throttling, and cooperative cancellation
//! (spec.md §4.H / §8 U7).

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::error::{WiredError, WiredResult};

use super::queue::{Transfer, TransferState};

const CHUNK_SIZE: usize = 16 * 1024;
const THROTTLE_SLEEP: Duration = Duration::from_millis(10);
const SPEED_EPOCH: Duration = Duration::from_secs(30);

/// Tracks bytes-since-epoch to compute instantaneous speed, resetting every
/// 30 s (spec.md §4.H: "speed = bytes / seconds-since-speed-epoch ... epoch
/// reset every 30 s").
struct SpeedMeter {
    epoch_start: Instant,
    bytes_since_epoch: u64,
}

impl SpeedMeter {
    fn new() -> Self {
        Self {
            epoch_start: Instant::now(),
            bytes_since_epoch: 0,
        }
    }

    fn record(&mut self, bytes: u64) -> f64 {
        if self.epoch_start.elapsed() >= SPEED_EPOCH {
            self.epoch_start = Instant::now();
            self.bytes_since_epoch = 0;
        }
        self.bytes_since_epoch += bytes;
        let secs = self.epoch_start.elapsed().as_secs_f64().max(0.001);
        self.bytes_since_epoch as f64 / secs
    }
}

/// Resolves the effective speed cap for one transfer: the lesser of the
/// account's own limit and its fair share of the global cap (spec.md
/// §4.H: `limit = min(global_share, account_limit)`,
/// `global_share = total_cap / current_active_transfers_of_that_direction`).
pub fn effective_speed_limit(
    global_cap_bytes_per_sec: u64,
    active_transfers_of_direction: u64,
    account_limit_bytes_per_sec: u64,
) -> Option<u64> {
    let global_share = if global_cap_bytes_per_sec == 0 {
        None
    } else {
        Some(global_cap_bytes_per_sec / active_transfers_of_direction.max(1))
    };
    let account_limit = if account_limit_bytes_per_sec == 0 {
        None
    } else {
        Some(account_limit_bytes_per_sec)
    };
    match (global_share, account_limit) {
        (None, None) => None,
        (Some(g), None) => Some(g),
        (None, Some(a)) => Some(a),
        (Some(g), Some(a)) => Some(g.min(a)),
    }
}

/// Copies `count` bytes from `reader` to `writer` in 16 KiB chunks, honoring
/// `speed_limit` (bytes/sec, throttled by sleeping in 10 ms increments) and
/// `transfer.stop_requested` (checked once per chunk; the in-flight chunk
/// always completes before unwinding).
pub async fn copy_throttled<R, W>(
    reader: &mut R,
    writer: &mut W,
    count: u64,
    transfer: &Transfer,
    speed_limit: Option<u64>,
) -> WiredResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = count;
    let mut copied = 0u64;
    let mut meter = SpeedMeter::new();

    while remaining > 0 {
        if transfer.is_stop_requested() {
            break;
        }
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let read = reader
            .read(&mut buf[..want])
            .await
            .map_err(|e| WiredError::io(e, ""))?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buf[..read])
            .await
            .map_err(|e| WiredError::io(e, ""))?;

        copied += read as u64;
        remaining -= read as u64;
        transfer
            .bytes_transferred
            .fetch_add(read as u64, Ordering::SeqCst);

        let speed = meter.record(read as u64);
        if let Some(limit) = speed_limit {
            while meter.record(0) > limit as f64 {
                tokio::time::sleep(THROTTLE_SLEEP).await;
                if transfer.is_stop_requested() {
                    break;
                }
            }
            let _ = speed;
        }
    }

    writer.flush().await.map_err(|e| WiredError::io(e, ""))?;
    Ok(copied)
}

/// Runs a whole transfer: data fork, then resource fork (spec.md §4.H:
/// "alternates between data fork and resource fork (data first, then
/// resource)"). Leaves `transfer.state` at `Stop` if cancelled mid-stream,
/// else `Stopped`.
pub async fn run_transfer<DR, DW, RR, RW>(
    transfer: &Transfer,
    data_reader: &mut DR,
    data_writer: &mut DW,
    resource: Option<(&mut RR, &mut RW, u64)>,
    speed_limit: Option<u64>,
) -> WiredResult<()>
where
    DR: AsyncRead + Unpin,
    DW: AsyncWrite + Unpin,
    RR: AsyncRead + Unpin,
    RW: AsyncWrite + Unpin,
{
    transfer.set_state(TransferState::Running).await;

    let data_remaining = transfer
        .data_size
        .saturating_sub(transfer.data_offset.load(Ordering::SeqCst));
    copy_throttled(data_reader, data_writer, data_remaining, transfer, speed_limit).await?;

    if !transfer.is_stop_requested() {
        if let Some((resource_reader, resource_writer, resource_remaining)) = resource {
            copy_throttled(
                resource_reader,
                resource_writer,
                resource_remaining,
                transfer,
                speed_limit,
            )
            .await?;
        }
    }

    let final_state = if transfer.is_stop_requested() {
        TransferState::Stop
    } else {
        TransferState::Stopped
    };
    transfer.set_state(final_state).await;
    Ok(())
}

/// Renames a completed upload's partial file into place, applies the
/// executable bit, and returns the destination path for sidecar/finder-info
/// finalization (spec.md §4.H Finalization).
pub fn finalize_upload(partial_path: &std::path::Path, executable: bool) -> WiredResult<std::path::PathBuf> {
    let final_path = partial_path
        .to_str()
        .and_then(|s| s.strip_suffix(".WiredTransfer"))
        .map(std::path::PathBuf::from)
        .ok_or_else(|| {
            WiredError::Internal(format!(
                "not a partial-transfer path: {}",
                partial_path.display()
            ))
        })?;
    std::fs::rename(partial_path, &final_path).map_err(|e| WiredError::io(e, partial_path))?;
    if executable {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&final_path)
                .map_err(|e| WiredError::io(e, &final_path))?
                .permissions();
            perms.set_mode(perms.mode() | 0o111);
            std::fs::set_permissions(&final_path, perms)
                .map_err(|e| WiredError::io(e, &final_path))?;
        }
    }
    Ok(final_path)
}

/// The partial-file path an in-progress upload is received into, and the
/// resume offset (current size, 0 if absent) per spec.md §4.H Resume.
pub fn partial_upload_path(real_path: &std::path::Path) -> std::path::PathBuf {
    let mut name = real_path.as_os_str().to_owned();
    name.push(".WiredTransfer");
    std::path::PathBuf::from(name)
}

pub fn resume_offset(partial_path: &std::path::Path) -> u64 {
    std::fs::metadata(partial_path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfers::queue::{Transfer, TransferKey, TransferKind};
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::PathBuf;

    fn make_transfer(data_size: u64) -> std::sync::Arc<Transfer> {
        Transfer::new(
            1,
            TransferKey {
                login: "alice".into(),
                ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            },
            TransferKind::Download,
            "a.txt".into(),
            PathBuf::from("/tmp/a.txt"),
            None,
            data_size,
            0,
            0,
            0,
            false,
            None,
        )
    }

    #[test]
    fn speed_limit_takes_the_lesser_of_global_share_and_account_cap() {
        assert_eq!(effective_speed_limit(1000, 2, 100), Some(100));
        assert_eq!(effective_speed_limit(1000, 2, 1000), Some(500));
        assert_eq!(effective_speed_limit(0, 2, 100), Some(100));
        assert_eq!(effective_speed_limit(1000, 2, 0), Some(500));
        assert_eq!(effective_speed_limit(0, 2, 0), None);
    }

    #[tokio::test]
    async fn copy_throttled_moves_exact_byte_count() {
        let data = vec![7u8; 40_000];
        let mut reader = std::io::Cursor::new(data.clone());
        let mut out = Vec::new();
        let transfer = make_transfer(data.len() as u64);
        let copied = copy_throttled(&mut reader, &mut out, data.len() as u64, &transfer, None)
            .await
            .unwrap();
        assert_eq!(copied, data.len() as u64);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn stop_request_halts_before_full_copy() {
        let data = vec![7u8; 1_000_000];
        let mut reader = std::io::Cursor::new(data);
        let mut out = Vec::new();
        let transfer = make_transfer(1_000_000);
        transfer.request_stop();
        let copied = copy_throttled(&mut reader, &mut out, 1_000_000, &transfer, None)
            .await
            .unwrap();
        assert_eq!(copied, 0);
    }

    #[test]
    fn partial_upload_path_round_trips_with_resume_offset() {
        let real = PathBuf::from("/tmp/uploads/movie.mp4");
        let partial = partial_upload_path(&real);
        assert_eq!(partial, PathBuf::from("/tmp/uploads/movie.mp4.WiredTransfer"));
        assert_eq!(resume_offset(&partial), 0);
    }
}
