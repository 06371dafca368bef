//! Fan-out helpers (spec.md §4.L): the three shapes every broadcasting
//! handler uses — all logged-in users, a chat's members, and a category's
//! subscribers. Each sends through [`crate::users::Session::send`], which
//! serializes access to the socket so fan-out and direct replies never
//! interleave bytes.

use tokio::io::AsyncWrite;

use crate::boards::acl::Viewer;
use crate::chat::ChatRegistry;
use crate::protocol::Message;
use crate::server::Server;
use crate::users::UserRegistry;

/// Sends `message` to every session currently logged in, skipping
/// `exclude` if given (e.g. the actor whose own action triggered the
/// broadcast already got a direct reply).
pub async fn broadcast_to_all<W>(users: &UserRegistry<W>, message: &Message, exclude: Option<u32>)
where
    W: AsyncWrite + Unpin + Send,
{
    for session in users.all().await {
        if Some(session.id()) == exclude {
            continue;
        }
        if !session.is_logged_in().await {
            continue;
        }
        let _ = session.send(message).await;
    }
}

/// Sends `message` to every member of `chat_id`.
pub async fn broadcast_to_chat<W>(
    users: &UserRegistry<W>,
    chats: &ChatRegistry,
    chat_id: u32,
    message: &Message,
    exclude: Option<u32>,
) -> crate::error::WiredResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    for member_id in chats.members(chat_id).await? {
        if Some(member_id) == exclude {
            continue;
        }
        if let Some(session) = users.user_with_id(member_id).await {
            let _ = session.send(message).await;
        }
    }
    Ok(())
}

/// Which singleton feed, directory path, or board path a subscriber
/// fan-out targets (spec.md §4.M: "log, accounts, boards, event feed,
/// concrete filesystem paths"). `Board` carries the path being mutated so
/// delivery can be gated by that board's ACL, the same way `Directory`
/// carries the changed filesystem path.
pub enum Category<'a> {
    Log,
    Accounts,
    Board(&'a str),
    Events,
    Directory(&'a str),
}

/// Sends `message` to every session subscribed to `category`.
///
/// `Category::Board` additionally requires the recipient's effective
/// board ACL to grant read access to `path` (spec.md §4.F: "a board
/// event reaches only sessions that could themselves list that board"),
/// so unlike the other categories it needs `server.accounts`/`server.boards`
/// rather than just the user registry.
pub async fn broadcast_to_subscribers<W>(server: &Server<W>, category: Category<'_>, message: &Message)
where
    W: AsyncWrite + Unpin + Send,
{
    let board_acl = match category {
        Category::Board(path) => Some((path, server.boards.read_acl(path).await.ok())),
        _ => None,
    };

    for session in server.users.all().await {
        let subs = session.subscriptions_snapshot().await;
        let subscribed = match category {
            Category::Log => subs.log,
            Category::Accounts => subs.accounts,
            Category::Board(_) => {
                if !subs.boards {
                    false
                } else {
                    match (&board_acl, session.account_name().await) {
                        (Some((_, Some(acl))), Some(login)) => {
                            let account = server.accounts.read_user_with_group_overlay(&login).await;
                            match account {
                                Ok(account) => {
                                    let viewer = Viewer {
                                        account_name: &login,
                                        group_name: account.group.as_deref(),
                                        extra_groups: &account.groups,
                                        admin_override: false,
                                    };
                                    acl.readable_by(&viewer)
                                }
                                Err(_) => false,
                            }
                        }
                        _ => false,
                    }
                }
            }
            Category::Events => subs.events,
            Category::Directory(path) => subs.directories.contains(path),
        };
        if subscribed {
            let _ = session.send(message).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::Privileges;
    use crate::boards::acl::BoardAcl;
    use crate::config::WiredConfig;
    use crate::protocol::{Field, Message};
    use crate::users::session::SessionState;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    type TestServer = Server<tokio::io::DuplexStream>;

    async fn test_server() -> (Arc<TestServer>, tempfile::TempDir) {
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

    async fn add_logged_in(server: &TestServer) -> (u32, tokio::io::DuplexStream) {
        let (writer, reader) = tokio::io::duplex(4096);
        let session = server
            .users
            .add(|id| crate::users::Session::new(id, IpAddr::V4(Ipv4Addr::LOCALHOST), "localhost".into(), writer))
            .await;
        session.set_state(SessionState::LoggedIn).await;
        (session.id(), reader)
    }

    #[tokio::test]
    async fn broadcast_to_all_skips_excluded_session() {
        let (server, _dir) = test_server().await;
        let (id_a, mut reader_a) = add_logged_in(&server).await;
        let (_id_b, mut reader_b) = add_logged_in(&server).await;

        let msg = Message::new("wired.chat.user_status");
        broadcast_to_all(&server.users, &msg, Some(id_a)).await;

        let got_b = crate::protocol::codec::read_message(&mut reader_b).await.unwrap();
        assert_eq!(got_b, msg);

        drop(reader_a);
    }

    #[tokio::test]
    async fn broadcast_to_subscribers_filters_by_category() {
        let (server, _dir) = test_server().await;
        let (writer, mut reader) = tokio::io::duplex(4096);
        let session = server
            .users
            .add(|id| crate::users::Session::new(id, IpAddr::V4(Ipv4Addr::LOCALHOST), "localhost".into(), writer))
            .await;
        session.set_state(SessionState::LoggedIn).await;
        session.with_subscriptions(|s| s.log = true).await;

        let msg = Message::new("wired.log.log");
        broadcast_to_subscribers(&server, Category::Log, &msg).await;
        let got = crate::protocol::codec::read_message(&mut reader).await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn board_category_hides_message_from_subscriber_without_read_access() {
        let (server, _dir) = test_server().await;
        server
            .accounts
            .create_user("alice", "pw", "alice".to_string(), None, Privileges::default())
            .await
            .unwrap();
        server
            .boards
            .add_board(
                "private",
                BoardAcl {
                    owner: "bob".to_string(),
                    group: String::new(),
                    mode: 0,
                },
            )
            .await
            .unwrap();

        let (writer, mut reader) = tokio::io::duplex(4096);
        let session = server
            .users
            .add(|id| crate::users::Session::new(id, IpAddr::V4(Ipv4Addr::LOCALHOST), "localhost".into(), writer))
            .await;
        session.set_state(SessionState::LoggedIn).await;
        session.set_account_name("alice".to_string()).await;
        session.with_subscriptions(|s| s.boards = true).await;

        let msg = Message::new("wired.board.post_added").with("wired.board.path", Field::String("private".into()));
        broadcast_to_subscribers(&server, Category::Board("private"), &msg).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let mut buf = [0u8; 1];
        let poll = tokio::time::timeout(std::time::Duration::from_millis(20), reader.read(&mut buf)).await;
        assert!(poll.is_err(), "alice should not have received a board event she cannot read");
    }
}
