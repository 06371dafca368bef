//! Targeted tests for the universal invariants listed in spec.md §8.

mod common;

use wired::accounts::Privileges;
use wired::dispatch::dispatch_one;
use wired::protocol::{Field, Message};
use wired::users::session::SessionState;

/// U1: session ids are unique among all live sessions.
#[tokio::test]
async fn u1_session_ids_are_unique() {
    let (server, _dir) = common::test_server().await;
    let (a, _ar) = common::add_session(&server).await;
    let (b, _br) = common::add_session(&server).await;
    let (c, _cr) = common::add_session(&server).await;
    assert_ne!(a.id(), b.id());
    assert_ne!(b.id(), c.id());
    assert_ne!(a.id(), c.id());
}

/// U6: a request's `wired.transaction` is echoed on its direct reply.
#[tokio::test]
async fn u6_transaction_is_echoed_on_send_ping() {
    let (server, _dir) = common::test_server().await;
    let (session, _reader) = common::add_session(&server).await;

    let request = Message::new("wired.send_ping").with("wired.transaction", Field::Uint32(42));
    let outcome = dispatch_one(&server, &session, &request).await.unwrap();
    let wired::dispatch::handlers::HandlerOutcome::Messages(replies) = outcome else {
        panic!("expected a direct reply");
    };
    assert_eq!(replies[0].get("wired.transaction"), Some(&Field::Uint32(42)));
}

/// U9: every session logged in as a deleted account transitions to
/// Disconnected before the `delete_user` reply is produced, not merely
/// scheduled to disconnect eventually.
#[tokio::test]
async fn u9_deleting_an_account_disconnects_its_live_sessions_synchronously() {
    let (server, _dir) = common::test_server().await;
    common::create_account(&server, "alice", "pw", Privileges::default()).await;
    common::create_account(
        &server,
        "admin",
        "pw",
        Privileges {
            account_delete_accounts: Some(true),
            ..Default::default()
        },
    )
    .await;

    let (alice, _alice_reader) = common::add_session(&server).await;
    common::login(&server, &alice, "alice", "pw").await.unwrap();

    let (admin, _admin_reader) = common::add_session(&server).await;
    common::login(&server, &admin, "admin", "pw").await.unwrap();

    let delete_request =
        Message::new("wired.account.delete_user").with("wired.account.name", Field::String("alice".into()));
    dispatch_one(&server, &admin, &delete_request).await.unwrap();

    // No `.await` on anything belonging to alice's own connection task
    // happened between the handler returning and this assertion: the state
    // flip must already be visible.
    assert_eq!(alice.state().await, SessionState::Disconnected);
}

/// U3 (partial): leaving the public chat never removes it from the chat
/// table, only private chats vanish once empty.
#[tokio::test]
async fn u3_public_chat_survives_its_last_member_leaving() {
    let (server, _dir) = common::test_server().await;
    common::create_account(&server, "alice", "pw", Privileges::default()).await;
    let (alice, _reader) = common::add_session(&server).await;
    common::login(&server, &alice, "alice", "pw").await.unwrap();

    dispatch_one(
        &server,
        &alice,
        &Message::new("wired.chat.join_chat").with("wired.chat.id", Field::Uint32(1)),
    )
    .await
    .unwrap();
    dispatch_one(
        &server,
        &alice,
        &Message::new("wired.chat.leave_chat").with("wired.chat.id", Field::Uint32(1)),
    )
    .await
    .unwrap();

    // The public chat must still be joinable (it was never torn down).
    let rejoin = dispatch_one(
        &server,
        &alice,
        &Message::new("wired.chat.join_chat").with("wired.chat.id", Field::Uint32(1)),
    )
    .await;
    assert!(rejoin.is_ok());
}
