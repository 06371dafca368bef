//! A single client session (spec.md §4.D).
//!
//! Mutable fields live behind one non-recursive `RwLock`; the outgoing
//! socket lives behind a separate `Mutex` so that a broadcast fan-out and a
//! direct reply never interleave bytes on the wire even though both may run
//! concurrently from different tasks. The spec's note that the original
//! implementation used a *recursive* lock around session fields does not
//! carry over (see DESIGN.md open question): recursive locks are
//! incompatible with `tokio::sync::RwLock`, so call sites are structured to
//! never re-enter the lock while already holding it.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;
use tokio::sync::{Mutex, RwLock};

use crate::error::WiredResult;
use crate::protocol::{codec, Message};
use crate::subscriptions::Subscriptions;

/// Where a session sits in the handshake/login/transfer state machine
/// (spec.md §4.J's pre-dispatch gate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    GaveClientInfo,
    LoggedIn,
    Transferring,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub application_name: String,
    pub application_version: String,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct Mutable {
    login: Option<String>,
    nick: String,
    status: String,
    icon: Vec<u8>,
    idle: bool,
    client_info: Option<ClientInfo>,
    last_activity: Option<DateTime<Utc>>,
    subscriptions: Subscriptions,
    current_transfer: Option<uuid::Uuid>,
}

/// One connected client. Generic over its outgoing writer half so unit
/// tests can use an in-memory duplex stream instead of a real
/// `tokio-rustls` connection.
pub struct Session<W> {
    id: u32,
    pub ip: IpAddr,
    pub host: String,
    state: RwLock<SessionState>,
    mutable: RwLock<Mutable>,
    writer: Mutex<W>,
    /// Signaled by `user.disconnect_user`/`chat.kick_user` to wake this
    /// session's read loop out of a blocking read (spec.md §4.D: a forced
    /// disconnect takes effect even while the victim is idle on the socket).
    disconnect: tokio::sync::Notify,
    /// Signaled by `dispatch::handlers::transfer::admit` when a scheduling
    /// pass starts a transfer belonging to this session that wasn't the
    /// subject of its own request (spec.md §4.H: one pass may admit
    /// transfers across several connections at once). Wakes this session's
    /// read loop the same way `disconnect` does, so `current_transfer` can
    /// be picked up and streamed from inside the owning connection.
    transfer_ready: tokio::sync::Notify,
}

impl<W> Session<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(id: u32, ip: IpAddr, host: String, writer: W) -> Self {
        Self {
            id,
            ip,
            host,
            state: RwLock::new(SessionState::Connected),
            mutable: RwLock::new(Mutable::default()),
            writer: Mutex::new(writer),
            disconnect: tokio::sync::Notify::new(),
            transfer_ready: tokio::sync::Notify::new(),
        }
    }

    /// Wakes this session's read loop so it can observe the disconnected
    /// state and close the connection, even if it is blocked on a read.
    pub fn request_disconnect(&self) {
        self.disconnect.notify_one();
    }

    /// Forces this session to `Disconnected` immediately, then wakes its
    /// read loop to actually unwind and run cleanup. Used by handlers that
    /// must guarantee the state transition is visible to any caller
    /// awaiting their reply (spec.md §8 U9: "every session whose login
    /// equals the deleted account transitions to Disconnected before the
    /// reply to delete is written") rather than only scheduling a
    /// best-effort wakeup.
    pub async fn force_disconnect(&self) {
        self.set_state(SessionState::Disconnected).await;
        self.disconnect.notify_one();
    }

    /// Resolves once `request_disconnect` has been called.
    pub async fn disconnect_requested(&self) {
        self.disconnect.notified().await;
    }

    /// Wakes this session's read loop to go drive `current_transfer`.
    pub fn notify_transfer_ready(&self) {
        self.transfer_ready.notify_one();
    }

    /// Resolves once `notify_transfer_ready` has been called.
    pub async fn transfer_ready_signal(&self) {
        self.transfer_ready.notified().await;
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    pub async fn mark_disconnected(&self) {
        self.set_state(SessionState::Disconnected).await;
    }

    pub async fn is_logged_in(&self) -> bool {
        matches!(
            self.state().await,
            SessionState::LoggedIn | SessionState::Transferring
        )
    }

    pub async fn account_name(&self) -> Option<String> {
        self.mutable.read().await.login.clone()
    }

    pub async fn set_account_name(&self, name: impl Into<String>) {
        self.mutable.write().await.login = Some(name.into());
    }

    pub async fn nick(&self) -> String {
        self.mutable.read().await.nick.clone()
    }

    pub async fn set_nick(&self, nick: impl Into<String>) {
        self.mutable.write().await.nick = nick.into();
    }

    pub async fn status(&self) -> String {
        self.mutable.read().await.status.clone()
    }

    pub async fn set_status(&self, status: impl Into<String>) {
        self.mutable.write().await.status = status.into();
    }

    pub async fn icon(&self) -> Vec<u8> {
        self.mutable.read().await.icon.clone()
    }

    pub async fn set_icon(&self, icon: Vec<u8>) {
        self.mutable.write().await.icon = icon;
    }

    pub async fn idle(&self) -> bool {
        self.mutable.read().await.idle
    }

    pub async fn set_idle(&self, idle: bool) {
        self.mutable.write().await.idle = idle;
    }

    pub async fn client_info(&self) -> Option<ClientInfo> {
        self.mutable.read().await.client_info.clone()
    }

    pub async fn set_client_info(&self, info: ClientInfo) {
        self.mutable.write().await.client_info = Some(info);
    }

    pub async fn current_transfer(&self) -> Option<uuid::Uuid> {
        self.mutable.read().await.current_transfer
    }

    pub async fn set_current_transfer(&self, transfer_id: Option<uuid::Uuid>) {
        self.mutable.write().await.current_transfer = transfer_id;
    }

    /// Stamps activity and reports whether the session had been idle, so
    /// the caller can unset idle and broadcast a status change (spec.md
    /// §4.J: "update idle-time; if was idle, unset idle and broadcast
    /// status").
    pub async fn touch_activity(&self) -> bool {
        let mut mutable = self.mutable.write().await;
        mutable.last_activity = Some(Utc::now());
        if mutable.idle {
            mutable.idle = false;
            true
        } else {
            false
        }
    }

    pub async fn with_subscriptions<R>(&self, f: impl FnOnce(&mut Subscriptions) -> R) -> R {
        let mut mutable = self.mutable.write().await;
        f(&mut mutable.subscriptions)
    }

    pub async fn subscriptions_snapshot(&self) -> Subscriptions {
        self.mutable.read().await.subscriptions.clone()
    }

    /// Sends one message, serializing access to the socket so concurrent
    /// senders (a handler reply and a broadcaster) never interleave bytes.
    pub async fn send(&self, message: &Message) -> WiredResult<()> {
        let mut writer = self.writer.lock().await;
        codec::write_message(&mut *writer, message).await
    }

    /// Streams `count` raw bytes from `reader` directly onto this session's
    /// socket, bypassing message framing, for the duration of a download
    /// (spec.md §4.H/§4.J: once a transfer begins, the connection carries
    /// raw file bytes rather than framed messages). Holds the same writer
    /// lock `send` does, so no reply or broadcast can interleave with the
    /// stream.
    pub async fn send_raw_stream<R>(
        &self,
        reader: &mut R,
        count: u64,
        transfer: &crate::transfers::Transfer,
        speed_limit: Option<u64>,
    ) -> WiredResult<u64>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut writer = self.writer.lock().await;
        crate::transfers::stream::copy_throttled(reader, &mut *writer, count, transfer, speed_limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    #[tokio::test]
    async fn touch_activity_unsets_idle_once() {
        let (writer, _reader) = tokio::io::duplex(1024);
        let session = Session::new(1, test_ip(), "localhost".into(), writer);
        session.set_idle(true).await;
        assert!(session.touch_activity().await);
        assert!(!session.idle().await);
        assert!(!session.touch_activity().await);
    }

    #[tokio::test]
    async fn send_writes_a_frame_the_peer_can_decode() {
        let (writer, mut reader) = tokio::io::duplex(4096);
        let session = Session::new(1, test_ip(), "localhost".into(), writer);
        let msg = Message::new("wired.ping");
        session.send(&msg).await.unwrap();
        let received = codec::read_message(&mut reader).await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn state_transitions_are_observable() {
        let (writer, _reader) = tokio::io::duplex(1024);
        let session = Session::new(1, test_ip(), "localhost".into(), writer);
        assert_eq!(session.state().await, SessionState::Connected);
        session.set_state(SessionState::LoggedIn).await;
        assert!(session.is_logged_in().await);
    }

    #[tokio::test]
    async fn subscriptions_are_mutated_in_place() {
        let (writer, _reader) = tokio::io::duplex(1024);
        let session = Session::new(1, test_ip(), "localhost".into(), writer);
        session
            .with_subscriptions(|subs| subs.subscribe_directory("/incoming"))
            .await;
        let snapshot = session.subscriptions_snapshot().await;
        assert!(snapshot.directories.contains("/incoming"));
    }

}
