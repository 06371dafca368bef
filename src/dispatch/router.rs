//! The per-connection dispatch loop (spec.md §4.J): a fixed name→handler
//! routing table, the pre-dispatch state gate, the idle-reset rule, and the
//! transfer streaming loop a `BeginTransfer` outcome (or a bystander wakeup)
//! drops into.
//!
//! `HandlerFn` can't be a `'static` item behind a process-wide table the way
//! the teacher's command dispatch is: handlers are generic over the
//! session's writer type `W`, and Rust has no generic statics. `build_routes`
//! is instead called once per connection (and once per [`dispatch_one`]
//! call) — a deliberate deviation from "build the table once at startup",
//! recorded in DESIGN.md.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite};

use crate::accounts::Privileges;
use crate::broadcast;
use crate::dispatch::handlers::{self, HandlerOutcome, HandlerResult};
use crate::error::{WiredError, WiredResult};
use crate::protocol::{self, Field, Message, WireError};
use crate::server::Server;
use crate::transfers::{Transfer, TransferKind, TransferState};
use crate::users::session::SessionState;
use crate::users::Session;

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(120);

type HandlerFn<W> =
    for<'a> fn(&'a Server<W>, &'a Session<W>, &'a Message) -> Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>>;

/// Messages that do not reset idle even though they are dispatched while
/// logged in (spec.md §4.J).
fn resets_idle(name: &str) -> bool {
    !matches!(
        name,
        "wired.send_ping" | "wired.user.set_idle" | "wired.user.get_users"
    )
}

/// The pre-dispatch state gate (spec.md §4.J). `Connected` never actually
/// reaches this loop: `server::acceptor::handshake_and_serve` consumes
/// `client_info` and advances to `GaveClientInfo` before calling
/// [`serve_connection`].
fn allowed_in_state(state: SessionState, name: &str) -> bool {
    match state {
        SessionState::Connected => name == "wired.client_info",
        SessionState::GaveClientInfo => matches!(
            name,
            "wired.send_ping"
                | "wired.send_login"
                | "wired.user.set_nick"
                | "wired.user.set_status"
                | "wired.user.set_icon"
        ),
        SessionState::LoggedIn => true,
        SessionState::Transferring | SessionState::Disconnected => false,
    }
}

macro_rules! route {
    ($routes:expr, $name:literal, $handler:expr) => {
        $routes.insert($name, (|s, sess, m| Box::pin($handler(s, sess, m))) as HandlerFn<W>);
    };
}

fn build_routes<W>() -> HashMap<&'static str, HandlerFn<W>>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut routes: HashMap<&'static str, HandlerFn<W>> = HashMap::new();

    route!(routes, "wired.send_login", handlers::connection::send_login);
    route!(routes, "wired.send_ping", handlers::connection::send_ping);

    route!(routes, "wired.user.set_nick", handlers::user::set_nick);
    route!(routes, "wired.user.set_status", handlers::user::set_status);
    route!(routes, "wired.user.set_icon", handlers::user::set_icon);
    route!(routes, "wired.user.set_idle", handlers::user::set_idle);
    route!(routes, "wired.user.get_info", handlers::user::get_info);
    route!(routes, "wired.user.get_users", handlers::user::get_users);
    route!(routes, "wired.user.disconnect_user", handlers::user::disconnect_user);
    route!(routes, "wired.user.ban_user", handlers::user::ban_user);

    route!(routes, "wired.chat.join_chat", handlers::chat::join_chat);
    route!(routes, "wired.chat.leave_chat", handlers::chat::leave_chat);
    route!(routes, "wired.chat.set_topic", handlers::chat::set_topic);
    route!(routes, "wired.chat.send_say", handlers::chat::send_say);
    route!(routes, "wired.chat.send_me", handlers::chat::send_me);
    route!(routes, "wired.chat.create_chat", handlers::chat::create_chat);
    route!(routes, "wired.chat.invite_user", handlers::chat::invite_user);
    route!(routes, "wired.chat.decline_invitation", handlers::chat::decline_invitation);
    route!(routes, "wired.chat.kick_user", handlers::chat::kick_user);

    route!(routes, "wired.message.send_message", handlers::message::send_message);
    route!(routes, "wired.message.send_broadcast", handlers::message::send_broadcast);

    route!(routes, "wired.board.get_boards", handlers::board::get_boards);
    route!(routes, "wired.board.get_posts", handlers::board::get_posts);
    route!(routes, "wired.board.add_board", handlers::board::add_board);
    route!(routes, "wired.board.rename_board", handlers::board::rename_board);
    route!(routes, "wired.board.move_board", handlers::board::move_board);
    route!(routes, "wired.board.delete_board", handlers::board::delete_board);
    route!(routes, "wired.board.set_permissions", handlers::board::set_permissions);
    route!(routes, "wired.board.add_thread", handlers::board::add_thread);
    route!(routes, "wired.board.move_thread", handlers::board::move_thread);
    route!(routes, "wired.board.delete_thread", handlers::board::delete_thread);
    route!(routes, "wired.board.add_post", handlers::board::add_post);
    route!(routes, "wired.board.edit_post", handlers::board::edit_post);
    route!(routes, "wired.board.delete_post", handlers::board::delete_post);
    route!(routes, "wired.board.subscribe_boards", handlers::board::subscribe_boards);
    route!(routes, "wired.board.unsubscribe_boards", handlers::board::unsubscribe_boards);

    route!(routes, "wired.file.list_directory", handlers::file::list_directory);
    route!(routes, "wired.file.get_info", handlers::file::get_info);
    route!(routes, "wired.file.move", handlers::file::move_file);
    route!(routes, "wired.file.link", handlers::file::create_link);
    route!(routes, "wired.file.set_type", handlers::file::set_type);
    route!(routes, "wired.file.set_comment", handlers::file::set_comment);
    route!(routes, "wired.file.set_executable", handlers::file::set_executable);
    route!(routes, "wired.file.set_permissions", handlers::file::set_permissions);
    route!(routes, "wired.file.set_label", handlers::file::set_label);
    route!(routes, "wired.file.delete", handlers::file::delete);
    route!(routes, "wired.file.create_directory", handlers::file::create_directory);
    route!(routes, "wired.file.search", handlers::file::search);
    route!(routes, "wired.file.preview_file", handlers::file::preview_file);
    route!(routes, "wired.file.subscribe_directory", handlers::file::subscribe_directory);
    route!(routes, "wired.file.unsubscribe_directory", handlers::file::unsubscribe_directory);

    route!(routes, "wired.account.change_password", handlers::account::change_password);
    route!(routes, "wired.account.list_users", handlers::account::list_users);
    route!(routes, "wired.account.list_groups", handlers::account::list_groups);
    route!(routes, "wired.account.read_user", handlers::account::read_user);
    route!(routes, "wired.account.read_group", handlers::account::read_group);
    route!(routes, "wired.account.create_user", handlers::account::create_user);
    route!(routes, "wired.account.create_group", handlers::account::create_group);
    route!(routes, "wired.account.edit_user", handlers::account::edit_user);
    route!(routes, "wired.account.edit_group", handlers::account::edit_group);
    route!(routes, "wired.account.delete_user", handlers::account::delete_user);
    route!(routes, "wired.account.delete_group", handlers::account::delete_group);
    route!(routes, "wired.account.subscribe_accounts", handlers::account::subscribe_accounts);
    route!(routes, "wired.account.unsubscribe_accounts", handlers::account::unsubscribe_accounts);

    route!(routes, "wired.transfer.download_file", handlers::transfer::download_file);
    route!(routes, "wired.transfer.upload_file", handlers::transfer::upload_file);
    route!(routes, "wired.transfer.upload_directory", handlers::transfer::upload_directory);

    route!(routes, "wired.log.subscribe_log", handlers::log::subscribe_log);
    route!(routes, "wired.log.unsubscribe_log", handlers::log::unsubscribe_log);
    route!(routes, "wired.events.get_archives", handlers::log::get_archives);
    route!(routes, "wired.events.get_events", handlers::log::get_events);

    route!(routes, "wired.banlist.get_bans", handlers::banlist::get_bans);
    route!(routes, "wired.banlist.add_ban", handlers::banlist::add_ban);
    route!(routes, "wired.banlist.delete_ban", handlers::banlist::delete_ban);

    route!(routes, "wired.tracker.register", handlers::log::tracker_register);
    route!(routes, "wired.tracker.unregister", handlers::log::tracker_unregister);

    routes
}

async fn dispatch_message<W>(
    server: &Server<W>,
    session: &Session<W>,
    routes: &HashMap<&'static str, HandlerFn<W>>,
    message: &Message,
) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    server.schema.verify(message)?;

    let state = session.state().await;
    if !allowed_in_state(state, message.name()) {
        return Err(WiredError::MessageOutOfSequence);
    }

    let handler = routes
        .get(message.name())
        .ok_or_else(|| WiredError::UnrecognizedMessage(message.name().to_string()))?;
    handler(server, session, message).await
}

/// Dispatches a single message outside of the connection loop (used by
/// tests that don't want to drive a whole socket). Builds its own routing
/// table, since there's nowhere to cache one across calls.
pub async fn dispatch_one<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let routes = build_routes::<W>();
    dispatch_message(server, session, &routes, message).await
}

/// Runs one session's receive loop until disconnect, then cleans up the
/// state only this module owns (chat membership, an in-flight transfer).
/// The caller (`server::acceptor::handshake_and_serve`) is responsible for
/// the registry-wide cleanup: removing the session from `server.users` and
/// releasing its subscriptions.
pub async fn serve_connection<W, R>(server: Arc<Server<W>>, session: Arc<Session<W>>, mut reader: R) -> WiredResult<()>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    let routes = build_routes::<W>();

    loop {
        if session.state().await == SessionState::Disconnected {
            break;
        }

        tokio::select! {
            _ = session.disconnect_requested() => {
                break;
            }
            _ = session.transfer_ready_signal() => {
                let Some(transfer_id) = session.current_transfer().await else { continue };
                let Some(transfer) = server.transfers.by_id(transfer_id).await else { continue };
                let kind = transfer.kind;
                // A bystander upload's `upload_ready` was already sent by
                // `dispatch::handlers::transfer::admit` at the moment this
                // wakeup was scheduled; a bystander download has sent
                // nothing yet, so `drive_transfer` sends its header itself.
                let already_sent = kind == TransferKind::Upload;
                run_transfer_and_resume(&server, &session, &mut reader, transfer, already_sent).await;
            }
            received = tokio::time::timeout(RECEIVE_TIMEOUT, protocol::read_message(&mut reader)) => {
                let message = match received {
                    Ok(Ok(message)) => message,
                    Ok(Err(error)) => {
                        tracing::debug!(%error, "closing connection after a framing error");
                        break;
                    }
                    Err(_) => {
                        tracing::debug!("closing connection after 120s idle on the receive loop");
                        break;
                    }
                };

                let name = message.name().to_string();
                let outcome = dispatch_message(&server, &session, &routes, &message).await;

                if resets_idle(&name) && session.touch_activity().await {
                    handlers::user::broadcast_status(&server, &session).await;
                }

                match outcome {
                    Ok(HandlerOutcome::Okay) => {
                        let _ = session.send(&Message::okay(&message)).await;
                    }
                    Ok(HandlerOutcome::Messages(replies)) => {
                        for reply in &replies {
                            if session.send(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(HandlerOutcome::Handled) => {}
                    Ok(HandlerOutcome::BeginTransfer(transfer)) => {
                        run_transfer_and_resume(&server, &session, &mut reader, transfer, false).await;
                    }
                    Err(error) => {
                        tracing::error!(%error, message = %name, "handler failed");
                        let _ = session.send(&Message::error(&message, WireError::from(&error))).await;
                    }
                }
            }
        }
    }

    for chat_id in server.chats.chat_ids_for(session.id()).await {
        if let Ok((_, destroyed)) = server.chats.leave(chat_id, session.id()).await {
            if !destroyed {
                let _ = broadcast::broadcast_to_chat(
                    &server.users,
                    &server.chats,
                    chat_id,
                    &Message::new("wired.chat.user_leave")
                        .with("wired.chat.id", Field::Uint32(chat_id))
                        .with("wired.user.id", Field::Uint32(session.id())),
                    None,
                )
                .await;
            }
        }
    }

    if let Some(transfer) = server.transfers.by_session(session.id()).await {
        let kind = transfer.kind;
        transfer.request_stop();
        if transfer.state().await != TransferState::Queued {
            server.transfers.mark_finished(&transfer.key, kind).await;
        }
        server.transfers.remove(transfer.id).await;
        handlers::transfer::rerun_schedule(&server, kind).await;
    }

    if let Some(login) = session.account_name().await {
        handlers::log::record(&server, "logout", &login, vec![]).await;
    }

    session.mark_disconnected().await;
    Ok(())
}

/// Drives one transfer's bytes to completion (or cancellation), then
/// restores the session to `LoggedIn` and re-runs the scheduler so the next
/// Queued transfer of the same kind can take the freed capacity.
async fn run_transfer_and_resume<W, R>(
    server: &Server<W>,
    session: &Session<W>,
    reader: &mut R,
    transfer: Arc<Transfer>,
    upload_ready_already_sent: bool,
) where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    let kind = transfer.kind;
    session.set_state(SessionState::Transferring).await;

    let result = drive_transfer(server, session, reader, transfer, upload_ready_already_sent).await;

    session.set_current_transfer(None).await;
    session.set_state(SessionState::LoggedIn).await;
    handlers::transfer::rerun_schedule(server, kind).await;

    if let Err(error) = result {
        tracing::warn!(%error, "transfer stream ended with an error");
    }
}

/// Streams one transfer's data fork in full, end to end (spec.md §4.H: the
/// connection carries raw bytes instead of framed messages for the
/// duration). No resource fork: none of this tree's entries ever report a
/// nonzero resource size, so every `Transfer` here is data-only.
async fn drive_transfer<W, R>(
    server: &Server<W>,
    session: &Session<W>,
    reader: &mut R,
    transfer: Arc<Transfer>,
    upload_ready_already_sent: bool,
) -> WiredResult<()>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    transfer.set_state(TransferState::Running).await;

    let privileges = server
        .accounts
        .read_user_with_group_overlay(&transfer.key.login)
        .await
        .map(|a| a.privileges)
        .unwrap_or_default();

    let result = match transfer.kind {
        TransferKind::Download => drive_download(server, session, &transfer, &privileges).await,
        TransferKind::Upload => {
            drive_upload(server, reader, &transfer, &privileges, upload_ready_already_sent).await
        }
    };

    let final_state = if transfer.is_stop_requested() {
        TransferState::Stop
    } else {
        TransferState::Stopped
    };
    transfer.set_state(final_state).await;
    result
}

async fn drive_download<W>(
    server: &Server<W>,
    session: &Session<W>,
    transfer: &Transfer,
    privileges: &Privileges,
) -> WiredResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let data_offset = transfer.data_offset.load(Ordering::SeqCst);
    let header = Message::new("wired.transfer.download")
        .with("wired.file.path", Field::String(transfer.virtual_path.clone()))
        .with("wired.transfer.data_offset", Field::Uint64(data_offset))
        .with("wired.transfer.rsrc_offset", Field::Uint64(0))
        .with("wired.transfer.data", Field::Oob(Vec::new()));
    session.send(&header).await?;

    let mut file = tokio::fs::File::open(&transfer.data_path)
        .await
        .map_err(|e| WiredError::io(e, &transfer.data_path))?;
    file.seek(std::io::SeekFrom::Start(data_offset))
        .await
        .map_err(|e| WiredError::io(e, &transfer.data_path))?;

    let remaining = transfer.data_size.saturating_sub(data_offset);
    let speed_limit = crate::transfers::stream::effective_speed_limit(
        server.config.transfers.total_download_speed,
        server.transfers.active_count(TransferKind::Download),
        u64::from(privileges.transfer_download_speed_limit.unwrap_or(0)),
    );
    session.send_raw_stream(&mut file, remaining, transfer, speed_limit).await?;
    Ok(())
}

async fn drive_upload<W, R>(
    server: &Server<W>,
    reader: &mut R,
    transfer: &Transfer,
    privileges: &Privileges,
    upload_ready_already_sent: bool,
) -> WiredResult<()>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    let data_offset = transfer.data_offset.load(Ordering::SeqCst);
    if !upload_ready_already_sent {
        if let Some(session) = server.users.user_with_id(transfer.session_id).await {
            let ready = Message::new("wired.transfer.upload_ready")
                .with("wired.transfer.data_offset", Field::Uint64(data_offset))
                .with("wired.transfer.rsrc_offset", Field::Uint64(0));
            session.send(&ready).await?;
        }
    }

    let partial = crate::transfers::stream::partial_upload_path(&transfer.data_path);
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&partial)
        .await
        .map_err(|e| WiredError::io(e, &partial))?;
    file.seek(std::io::SeekFrom::Start(data_offset))
        .await
        .map_err(|e| WiredError::io(e, &partial))?;

    let remaining = transfer.data_size.saturating_sub(data_offset);
    let speed_limit = crate::transfers::stream::effective_speed_limit(
        server.config.transfers.total_upload_speed,
        server.transfers.active_count(TransferKind::Upload),
        u64::from(privileges.transfer_upload_speed_limit.unwrap_or(0)),
    );
    crate::transfers::stream::copy_throttled(reader, &mut file, remaining, transfer, speed_limit).await?;

    if !transfer.is_stop_requested() {
        crate::transfers::stream::finalize_upload(&partial, transfer.executable)?;
        handlers::file::notify_directory_changed(server, &handlers::file::parent_of(&transfer.virtual_path)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use crate::config::WiredConfig;

    async fn test_server() -> (Arc<Server<tokio::io::DuplexStream>>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = WiredConfig::builder(dir.path().join("files"))
            .accounts_dir(dir.path().join("accounts"))
            .boards_dir(dir.path().join("boards"))
            .banlist_path(dir.path().join("banlist"))
            .events_dir(dir.path().join("events"))
            .schema_path("assets/schema.xml")
            .build();
        let server = Server::load(config).await.unwrap();
        (Arc::new(server), dir)
    }

    fn test_session(id: u32) -> (Arc<Session<tokio::io::DuplexStream>>, tokio::io::DuplexStream) {
        let (writer, reader) = tokio::io::duplex(8192);
        let session = Arc::new(Session::new(
            id,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            "localhost".into(),
            writer,
        ));
        (session, reader)
    }

    #[tokio::test]
    async fn state_gate_rejects_login_before_client_info() {
        let (server, _dir) = test_server().await;
        let (session, _reader) = test_session(1);
        let message = Message::new("wired.user.get_users");
        let result = dispatch_one(&server, &session, &message).await;
        assert!(matches!(result, Err(WiredError::MessageOutOfSequence)));
    }

    #[tokio::test]
    async fn state_gate_allows_send_ping_before_login() {
        let (server, _dir) = test_server().await;
        let (session, _reader) = test_session(1);
        session.set_state(SessionState::GaveClientInfo).await;
        let message = Message::new("wired.send_ping");
        let result = dispatch_one(&server, &session, &message).await;
        assert!(matches!(result, Ok(HandlerOutcome::Messages(_))));
    }

    #[tokio::test]
    async fn unrecognized_but_schema_valid_message_is_reported() {
        let (server, _dir) = test_server().await;
        let (session, _reader) = test_session(1);
        session.set_state(SessionState::LoggedIn).await;
        let message = Message::new("wired.ping");
        let result = dispatch_one(&server, &session, &message).await;
        assert!(matches!(result, Err(WiredError::UnrecognizedMessage(_))));
    }
}
