//! The live-session table (spec.md §4.D): `{id -> Session}`, guarded by one
//! read/write lock shared with the id-allocation counter.
//!
//! The counter lives next to the table rather than as a free-standing
//! atomic because the reset-to-empty rule ("generator resets to zero when
//! the live set is empty", spec.md §3) needs to observe table emptiness and
//! bump the counter as one atomic step — an `AtomicU32` alone cannot do
//! that without racing a concurrent `add`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::sync::RwLock;

use crate::protocol::{Field, Message};
use crate::users::session::Session;

struct Inner<W> {
    sessions: HashMap<u32, Arc<Session<W>>>,
    next_id: u32,
}

/// Owns every live [`Session`]. Held by [`crate::server::Server`].
pub struct UserRegistry<W> {
    inner: RwLock<Inner<W>>,
}

impl<W> Default for UserRegistry<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> UserRegistry<W> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Builds a session with a freshly allocated id and registers it in one
    /// step (U1: ids are unique among live sessions).
    pub async fn add(&self, build: impl FnOnce(u32) -> Session<W>) -> Arc<Session<W>> {
        let mut inner = self.inner.write().await;
        let id = inner.next_id;
        inner.next_id += 1;
        let session = Arc::new(build(id));
        inner.sessions.insert(id, session.clone());
        session
    }

    /// Removes a session from the table. Returns it so the caller (the
    /// dispatcher's connection-close path) can tear down its chat
    /// membership, abort its transfer, and clear its subscriptions using
    /// the other subsystems it needs for that (spec.md §4.D) — this
    /// registry only owns the table itself.
    pub async fn remove(&self, id: u32) -> Option<Arc<Session<W>>> {
        let mut inner = self.inner.write().await;
        let session = inner.sessions.remove(&id);
        if inner.sessions.is_empty() {
            inner.next_id = 1;
        }
        session
    }

    pub async fn user_with_id(&self, id: u32) -> Option<Arc<Session<W>>> {
        self.inner.read().await.sessions.get(&id).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<Session<W>>> {
        self.inner.read().await.sessions.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<W> UserRegistry<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Every live session whose account login matches `name` (spec.md §4.D
    /// `users_with_login`; used to force-disconnect every session logged in
    /// as a deleted or edited account, U9).
    pub async fn users_with_login(&self, name: &str) -> Vec<Arc<Session<W>>> {
        let mut matches = Vec::new();
        for session in self.all().await {
            if session.account_name().await.as_deref() == Some(name) {
                matches.push(session);
            }
        }
        matches
    }

    /// One `wired.user.user_list` row per live user, terminated by
    /// `wired.user.user_list.done` (spec.md §4.D).
    pub async fn reply_user_list(&self) -> Vec<Message> {
        let mut rows = Vec::new();
        for session in self.all().await {
            rows.push(
                Message::new("wired.user.user_list")
                    .with("wired.user.id", Field::Uint32(session.id()))
                    .with("wired.user.nick", Field::String(session.nick().await))
                    .with("wired.user.status", Field::String(session.status().await))
                    .with("wired.user.idle", Field::Bool(session.idle().await)),
            );
        }
        rows.push(Message::new("wired.user.user_list.done"));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    async fn registry_with_duplex() -> (UserRegistry<tokio::io::DuplexStream>, Arc<Session<tokio::io::DuplexStream>>) {
        let registry: UserRegistry<tokio::io::DuplexStream> = UserRegistry::new();
        let (writer, _reader) = tokio::io::duplex(1024);
        let session = registry
            .add(|id| Session::new(id, ip(), "localhost".into(), writer))
            .await;
        (registry, session)
    }

    #[tokio::test]
    async fn ids_are_assigned_sequentially_and_unique() {
        let registry: UserRegistry<tokio::io::DuplexStream> = UserRegistry::new();
        let (w1, _) = tokio::io::duplex(1024);
        let (w2, _) = tokio::io::duplex(1024);
        let s1 = registry.add(|id| Session::new(id, ip(), "h".into(), w1)).await;
        let s2 = registry.add(|id| Session::new(id, ip(), "h".into(), w2)).await;
        assert_ne!(s1.id(), s2.id());
        assert_eq!(s1.id(), 1);
        assert_eq!(s2.id(), 2);
    }

    #[tokio::test]
    async fn id_counter_resets_when_table_becomes_empty() {
        let (registry, session) = registry_with_duplex().await;
        registry.remove(session.id()).await;
        assert!(registry.is_empty().await);
        let (w, _) = tokio::io::duplex(1024);
        let next = registry.add(|id| Session::new(id, ip(), "h".into(), w)).await;
        assert_eq!(next.id(), 1);
    }

    #[tokio::test]
    async fn counter_does_not_reset_while_other_sessions_remain_live() {
        let registry: UserRegistry<tokio::io::DuplexStream> = UserRegistry::new();
        let (w1, _) = tokio::io::duplex(1024);
        let (w2, _) = tokio::io::duplex(1024);
        let s1 = registry.add(|id| Session::new(id, ip(), "h".into(), w1)).await;
        let _s2 = registry.add(|id| Session::new(id, ip(), "h".into(), w2)).await;
        registry.remove(s1.id()).await;
        let (w3, _) = tokio::io::duplex(1024);
        let s3 = registry.add(|id| Session::new(id, ip(), "h".into(), w3)).await;
        assert_eq!(s3.id(), 3);
    }

    #[tokio::test]
    async fn users_with_login_filters_by_account_name() {
        let (registry, session) = registry_with_duplex().await;
        session.set_account_name("alice").await;
        let matches = registry.users_with_login("alice").await;
        assert_eq!(matches.len(), 1);
        assert!(registry.users_with_login("bob").await.is_empty());
    }
}
