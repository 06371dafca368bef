//! End-to-end scenarios against an in-process server (spec.md §8), driven
//! through `dispatch::dispatch_one` the way a real connection's receive
//! loop would, minus the socket itself.

mod common;

use wired::accounts::Privileges;
use wired::dispatch::dispatch_one;
use wired::dispatch::handlers::HandlerOutcome;
use wired::error::WiredError;
use wired::protocol::{Field, Message};
use wired::users::session::SessionState;

#[tokio::test]
async fn login_with_correct_password_advances_to_logged_in() {
    let (server, _dir) = common::test_server().await;
    common::create_account(&server, "alice", "hunter2", Privileges::default()).await;
    let (session, _reader) = common::add_session(&server).await;

    let outcome = common::login(&server, &session, "alice", "hunter2").await.unwrap();
    assert!(matches!(outcome, HandlerOutcome::Messages(_)));
    assert_eq!(session.state().await, SessionState::LoggedIn);
    assert_eq!(session.account_name().await.as_deref(), Some("alice"));
}

#[tokio::test]
async fn login_with_wrong_password_fails_and_leaves_session_unauthenticated() {
    let (server, _dir) = common::test_server().await;
    common::create_account(&server, "alice", "hunter2", Privileges::default()).await;
    let (session, _reader) = common::add_session(&server).await;

    let result = common::login(&server, &session, "alice", "wrong").await;
    assert!(matches!(result, Err(WiredError::LoginFailed)));
    assert_eq!(session.state().await, SessionState::GaveClientInfo);
}

#[tokio::test]
async fn joining_the_public_chat_then_saying_something_reaches_a_second_member() {
    let (server, _dir) = common::test_server().await;
    common::create_account(
        &server,
        "alice",
        "pw",
        Privileges {
            message_send_messages: Some(true),
            ..Default::default()
        },
    )
    .await;
    common::create_account(
        &server,
        "bob",
        "pw",
        Privileges {
            message_send_messages: Some(true),
            ..Default::default()
        },
    )
    .await;

    let (alice, _alice_reader) = common::add_session(&server).await;
    common::login(&server, &alice, "alice", "pw").await.unwrap();
    let (bob, mut bob_reader) = common::add_session(&server).await;
    common::login(&server, &bob, "bob", "pw").await.unwrap();

    dispatch_one(
        &server,
        &alice,
        &Message::new("wired.chat.join_chat").with("wired.chat.id", Field::Uint32(1)),
    )
    .await
    .unwrap();
    dispatch_one(
        &server,
        &bob,
        &Message::new("wired.chat.join_chat").with("wired.chat.id", Field::Uint32(1)),
    )
    .await
    .unwrap();

    // Drain bob's own join_chat reply stream before listening for alice's say.
    loop {
        let msg = wired::protocol::read_message(&mut bob_reader).await.unwrap();
        if msg.name() == "wired.chat.user_list.done" {
            break;
        }
    }

    dispatch_one(
        &server,
        &alice,
        &Message::new("wired.chat.send_say")
            .with("wired.chat.id", Field::Uint32(1))
            .with("wired.chat.say", Field::String("hello".into())),
    )
    .await
    .unwrap();

    let received = wired::protocol::read_message(&mut bob_reader).await.unwrap();
    assert_eq!(received.name(), "wired.chat.say");
    assert_eq!(
        received.get("wired.chat.say"),
        Some(&Field::String("hello".into()))
    );
}

#[tokio::test]
async fn board_add_without_privilege_is_permission_denied() {
    let (server, _dir) = common::test_server().await;
    common::create_account(&server, "alice", "pw", Privileges::default()).await;
    let (session, _reader) = common::add_session(&server).await;
    common::login(&server, &session, "alice", "pw").await.unwrap();

    let result = dispatch_one(
        &server,
        &session,
        &Message::new("wired.board.add_board")
            .with("wired.board.path", Field::String("news".into())),
    )
    .await;
    assert!(matches!(result, Err(WiredError::PermissionDenied(_))));
}

#[tokio::test]
async fn transaction_id_is_echoed_on_both_success_and_error_replies() {
    let (server, _dir) = common::test_server().await;
    common::create_account(&server, "alice", "pw", Privileges::default()).await;
    let (session, _reader) = common::add_session(&server).await;

    let login_msg = Message::new("wired.send_login")
        .with("wired.user.login", Field::String("alice".into()))
        .with("wired.user.password", Field::String("pw".into()))
        .with("wired.transaction", Field::Uint32(7));
    let outcome = dispatch_one(&server, &session, &login_msg).await.unwrap();
    let HandlerOutcome::Messages(replies) = outcome else {
        panic!("expected a direct reply");
    };
    assert_eq!(replies[0].get("wired.transaction"), Some(&Field::Uint32(7)));

    let bad_board = Message::new("wired.board.add_board")
        .with("wired.board.path", Field::String("news".into()))
        .with("wired.transaction", Field::Uint32(9));
    let error = dispatch_one(&server, &session, &bad_board).await.unwrap_err();
    let wire_error = wired::protocol::WireError::from(&error);
    let reply = Message::error(&bad_board, wire_error);
    assert_eq!(reply.get("wired.transaction"), Some(&Field::Uint32(9)));
}
