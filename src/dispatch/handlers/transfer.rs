//! Transfer category admission (spec.md §4.H): `download_file`,
//! `upload_file`, and `upload_directory` resolve a virtual path, enqueue a
//! [`Transfer`], and run one scheduling pass. The byte-streaming loop itself
//! runs in [`crate::dispatch::router`] once this module hands back
//! [`HandlerOutcome::BeginTransfer`] — this module only ever decides *that*
//! a transfer may run, never drives its bytes.
//!
//! Resource forks have no real backing on this file tree (`files::tree`'s
//! listing always reports `resource_size_or_count == 0`), so any request
//! naming a non-zero resource offset/size is rejected with
//! `WiredError::RsrcNotSupported` rather than silently truncated.

use std::collections::HashMap;

use tokio::io::AsyncWrite;

use crate::boards::acl::Viewer;
use crate::dispatch::handlers::{
    login_of, opt_data, opt_u64, privileges_of, req_string, req_u64, require, HandlerOutcome, HandlerResult,
};
use crate::error::WiredError;
use crate::files::EntryType;
use crate::protocol::{Field, Message};
use crate::server::Server;
use crate::transfers::scheduler::{schedule, Caps, Decision};
use crate::transfers::{Transfer, TransferKey, TransferKind};
use crate::users::Session;

fn queue_message(path: &str, position: u64) -> Message {
    Message::new("wired.transfer.queue")
        .with("wired.file.path", Field::String(path.to_string()))
        .with("wired.transfer.queue_position", Field::Uint32(position as u32))
}

fn upload_ready_message(data_offset: u64, rsrc_offset: u64) -> Message {
    Message::new("wired.transfer.upload_ready")
        .with("wired.transfer.data_offset", Field::Uint64(data_offset))
        .with("wired.transfer.rsrc_offset", Field::Uint64(rsrc_offset))
}

/// Resolves each distinct login currently holding a Queued transfer of
/// `kind` to its account's per-direction limit, so the synchronous
/// `per_user_cap` closure `scheduler::schedule` requires can be backed by
/// an (async) account lookup done up front.
async fn per_user_limits<W>(server: &Server<W>, kind: TransferKind) -> HashMap<String, u32>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut limits = HashMap::new();
    for transfer in server.transfers.all().await {
        if transfer.kind != kind || limits.contains_key(&transfer.key.login) {
            continue;
        }
        if let Ok(account) = server.accounts.read_user_with_group_overlay(&transfer.key.login).await {
            let limit = match kind {
                TransferKind::Download => account.privileges.transfer_download_limit,
                TransferKind::Upload => account.privileges.transfer_upload_limit,
            };
            limits.insert(transfer.key.login.clone(), limit.unwrap_or(0));
        }
    }
    limits
}

fn caps_for<W>(server: &Server<W>) -> Caps {
    Caps {
        total_downloads: server.config.transfers.total_downloads,
        total_uploads: server.config.transfers.total_uploads,
        per_user_downloads: 0,
        per_user_uploads: 0,
    }
}

/// Sends an out-of-band notice to a transfer's owning session. Used for
/// transfers other than the one the current request is admitting, whose
/// decision this scheduling pass also happened to affect (spec.md §4.H: a
/// single pass evaluates every Queued transfer of a kind, not only the
/// newly-enqueued one).
async fn notify_bystander<W>(server: &Server<W>, transfer: &std::sync::Arc<Transfer>, decision_message: Message)
where
    W: AsyncWrite + Unpin + Send,
{
    if let Some(session) = server.users.user_with_id(transfer.session_id).await {
        let _ = session.send(&decision_message).await;
    }
}

/// Applies every decision one scheduling pass produced. `this_id`, when
/// given, names the transfer whose outcome the current request should
/// receive directly as a return value rather than as an out-of-band notice
/// to its owning session; every other decision (including all of them, when
/// `this_id` is `None`) is delivered to its transfer's owning session as a
/// bystander notice (spec.md §4.H: one pass may admit transfers across
/// several connections at once).
async fn apply_decisions<W>(
    server: &Server<W>,
    kind: TransferKind,
    decisions: Vec<Decision>,
    this_id: Option<uuid::Uuid>,
) -> Option<HandlerOutcome>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut outcome = None;
    for decision in decisions {
        match decision {
            Decision::Start(started) if Some(started.id) == this_id => {
                server.transfers.mark_started(&started.key, kind).await;
                started.set_state(crate::transfers::queue::TransferState::Waiting).await;
                outcome = Some(HandlerOutcome::BeginTransfer(started));
            }
            // A transfer belonging to some other live connection was also
            // admitted by this same scheduling pass. Its own read loop is
            // blocked on a framed read (or, for an upload, on nothing at
            // all yet), so it is woken the same way a forced disconnect
            // wakes an idle session: `current_transfer` names which
            // transfer to drive, `notify_transfer_ready` breaks it out of
            // the read to go drive it (`dispatch::router`'s select loop).
            Decision::Start(started) => {
                server.transfers.mark_started(&started.key, kind).await;
                started.set_state(crate::transfers::queue::TransferState::Waiting).await;
                if kind == TransferKind::Upload {
                    let data_offset = started.data_offset.load(std::sync::atomic::Ordering::SeqCst);
                    notify_bystander(server, &started, upload_ready_message(data_offset, 0)).await;
                }
                if let Some(session) = server.users.user_with_id(started.session_id).await {
                    session.set_current_transfer(Some(started.id)).await;
                    session.notify_transfer_ready();
                }
            }
            Decision::Requeue(requeued, position) if Some(requeued.id) == this_id => {
                outcome = Some(HandlerOutcome::Messages(vec![queue_message(&requeued.virtual_path, position)]));
            }
            Decision::Requeue(requeued, position) => {
                notify_bystander(server, &requeued, queue_message(&requeued.virtual_path, position)).await;
            }
        }
    }
    outcome
}

/// Enqueues `transfer`, runs one scheduling pass for its `kind`, and applies
/// every decision the pass produced: transfers other than `transfer` itself
/// are notified directly (queue position update, or `upload_ready` plus a
/// wakeup of their own connection's read loop); `transfer`'s own decision is
/// returned as this request's [`HandlerOutcome`].
async fn admit<W>(server: &Server<W>, transfer: std::sync::Arc<Transfer>, kind: TransferKind) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let this_id = transfer.id;
    let path = transfer.virtual_path.clone();
    server.transfers.enqueue(transfer).await;

    let limits = per_user_limits(server, kind).await;
    let caps = caps_for(server);
    let decisions = schedule(&server.transfers, kind, &caps, |key| limits.get(&key.login).copied()).await;
    let outcome = apply_decisions(server, kind, decisions, Some(this_id)).await;

    Ok(outcome.unwrap_or_else(|| HandlerOutcome::Messages(vec![queue_message(&path, 0)])))
}

/// Re-runs the scheduler for `kind` after a transfer finishes and frees
/// capacity, treating every resulting decision as a bystander notice (there
/// is no "this request" to return an outcome to — called from
/// `dispatch::router` once a streaming loop completes, not from a handler).
pub(crate) async fn rerun_schedule<W>(server: &Server<W>, kind: TransferKind)
where
    W: AsyncWrite + Unpin + Send,
{
    let limits = per_user_limits(server, kind).await;
    let caps = caps_for(server);
    let decisions = schedule(&server.transfers, kind, &caps, |key| limits.get(&key.login).copied()).await;
    apply_decisions(server, kind, decisions, None).await;
}

pub async fn download_file<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.transfer_download_files, "transfer_download_files")?;

    let rsrc_offset = opt_u64(message, "wired.transfer.rsrc_offset").unwrap_or(0);
    if rsrc_offset != 0 {
        return Err(WiredError::RsrcNotSupported);
    }

    let login = login_of(session).await?;
    let account = server.accounts.read_user_with_group_overlay(&login).await?;
    let path = req_string(message, "wired.file.path")?;
    let real = server.files.resolve(&account.files_root, &path)?;
    let ty = server.files.entry_type(&real).await?;
    if ty != EntryType::File {
        return Err(WiredError::FileNotFound(path));
    }
    let meta = std::fs::metadata(&real).map_err(|e| WiredError::io(e, &real))?;
    let data_offset = opt_u64(message, "wired.transfer.data_offset").unwrap_or(0).min(meta.len());

    let transfer = Transfer::new(
        session.id(),
        TransferKey { login, ip: session.ip },
        TransferKind::Download,
        path,
        real,
        None,
        meta.len(),
        0,
        data_offset,
        0,
        false,
        None,
    );
    admit(server, transfer, TransferKind::Download).await
}

/// Only `EntryType::Uploads`/`EntryType::Dropbox` directories (and anywhere,
/// given `transfer_upload_anywhere`) accept uploads; a dropbox additionally
/// gates on its ACL's write bit, mirroring `file::set_permissions`'s reuse
/// of `boards::acl::Viewer` for dropbox directories.
async fn check_upload_destination<W>(
    server: &Server<W>,
    session: &Session<W>,
    parent_real: &std::path::Path,
) -> crate::error::WiredResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    if privileges.transfer_upload_anywhere.unwrap_or(false) {
        return Ok(());
    }
    let ty = server.files.entry_type(parent_real).await.unwrap_or(EntryType::Directory);
    match ty {
        EntryType::Uploads => Ok(()),
        EntryType::Dropbox => {
            let login = login_of(session).await?;
            let account = server.accounts.read_user_with_group_overlay(&login).await?;
            let stop_at = server.files.resolve(&account.files_root, "")?;
            let acl = server
                .files
                .innermost_dropbox_acl(&stop_at, parent_real)
                .await?
                .unwrap_or_default();
            let viewer = Viewer {
                account_name: &login,
                group_name: account.group.as_deref(),
                extra_groups: &account.groups,
                admin_override: account.privileges.file_access_all_dropboxes.unwrap_or(false),
            };
            if acl.writable_by(&viewer) {
                Ok(())
            } else {
                Err(WiredError::PermissionDenied("board_acl_write".to_string()))
            }
        }
        _ => Err(WiredError::PermissionDenied("transfer_upload_anywhere".to_string())),
    }
}

pub async fn upload_file<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.transfer_upload_files, "transfer_upload_files")?;

    let rsrc_size = opt_u64(message, "wired.transfer.rsrc_size").unwrap_or(0);
    if rsrc_size != 0 {
        return Err(WiredError::RsrcNotSupported);
    }

    let login = login_of(session).await?;
    let account = server.accounts.read_user_with_group_overlay(&login).await?;
    let path = req_string(message, "wired.file.path")?;
    let data_size = req_u64(message, "wired.transfer.data_size")?;
    let finder_info = opt_data(message, "wired.transfer.finder_info");
    let real = server.files.resolve(&account.files_root, &path)?;

    let parent = real.parent().map(std::path::Path::to_path_buf).unwrap_or_default();
    check_upload_destination(server, session, &parent).await?;

    let partial = crate::transfers::stream::partial_upload_path(&real);
    let resume_offset = crate::transfers::stream::resume_offset(&partial);

    let transfer = Transfer::new(
        session.id(),
        TransferKey { login, ip: session.ip },
        TransferKind::Upload,
        path,
        real,
        None,
        data_size,
        0,
        resume_offset,
        0,
        false,
        finder_info,
    );
    admit(server, transfer, TransferKind::Upload).await
}

pub async fn upload_directory<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.transfer_upload_directories, "transfer_upload_directories")?;

    let login = login_of(session).await?;
    let account = server.accounts.read_user_with_group_overlay(&login).await?;
    let path = req_string(message, "wired.file.path")?;
    let real = server.files.resolve(&account.files_root, &path)?;

    let parent = real.parent().map(std::path::Path::to_path_buf).unwrap_or_default();
    check_upload_destination(server, session, &parent).await?;

    server.files.create_directory(&real).await?;
    super::file::notify_directory_changed(server, &super::file::parent_of(&path)).await;
    Ok(HandlerOutcome::Okay)
}
