//! Chat category (spec.md §4.E): room join/leave, say/me, topic, invites,
//! and kicks. `join_chat`/`create_chat` reply with a value stream rather
//! than a plain `wired.okay`, matching U6's "every list-returning request
//! terminates with the matching `.done`/value marker."

use tokio::io::AsyncWrite;

use crate::broadcast::{self};
use crate::chat as chatmod;
use crate::dispatch::handlers::{opt_string, privileges_of, req_string, req_u32, require, HandlerOutcome, HandlerResult};
use crate::protocol::{Field, Message};
use crate::server::Server;
use crate::users::Session;

pub async fn join_chat<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let chat_id = req_u32(message, "wired.chat.id")?;
    let existing = server.chats.join(chat_id, session.id()).await?;

    broadcast::broadcast_to_chat(
        &server.users,
        &server.chats,
        chat_id,
        &Message::new("wired.chat.user_join")
            .with("wired.chat.id", Field::Uint32(chat_id))
            .with("wired.user.id", Field::Uint32(session.id())),
        Some(session.id()),
    )
    .await?;

    let mut rows: Vec<Message> = existing
        .into_iter()
        .chain(std::iter::once(session.id()))
        .map(|member_id| {
            Message::new("wired.chat.user_list")
                .with("wired.chat.id", Field::Uint32(chat_id))
                .with("wired.user.id", Field::Uint32(member_id))
                .echo_transaction(message)
        })
        .collect();
    rows.push(
        Message::new("wired.chat.user_list.done")
            .with("wired.chat.id", Field::Uint32(chat_id))
            .echo_transaction(message),
    );
    Ok(HandlerOutcome::Messages(rows))
}

pub async fn leave_chat<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let chat_id = req_u32(message, "wired.chat.id")?;
    server.chats.leave(chat_id, session.id()).await?;
    broadcast::broadcast_to_chat(
        &server.users,
        &server.chats,
        chat_id,
        &Message::new("wired.chat.user_leave")
            .with("wired.chat.id", Field::Uint32(chat_id))
            .with("wired.user.id", Field::Uint32(session.id())),
        None,
    )
    .await
    .ok();
    Ok(HandlerOutcome::Okay)
}

pub async fn set_topic<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.chat_set_topic, "chat_set_topic")?;

    let chat_id = req_u32(message, "wired.chat.id")?;
    let text = req_string(message, "wired.chat.topic.topic")?;
    let topic = server.chats.set_topic(chat_id, session.nick().await, text).await?;

    let mut notice = topic.to_message();
    notice.set("wired.chat.id", Field::Uint32(chat_id));
    broadcast::broadcast_to_chat(&server.users, &server.chats, chat_id, &notice, None).await?;
    Ok(HandlerOutcome::Okay)
}

pub async fn send_say<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.message_send_messages, "message_send_messages")?;

    let chat_id = req_u32(message, "wired.chat.id")?;
    let text = req_string(message, "wired.chat.say")?;
    for line in chatmod::split_say_lines(&text) {
        let notice = Message::new("wired.chat.say")
            .with("wired.chat.id", Field::Uint32(chat_id))
            .with("wired.user.id", Field::Uint32(session.id()))
            .with("wired.chat.say", Field::String(line));
        broadcast::broadcast_to_chat(&server.users, &server.chats, chat_id, &notice, None).await?;
    }
    Ok(HandlerOutcome::Okay)
}

pub async fn send_me<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.message_send_messages, "message_send_messages")?;

    let chat_id = req_u32(message, "wired.chat.id")?;
    let text = req_string(message, "wired.chat.me")?;
    for line in chatmod::split_say_lines(&text) {
        let notice = Message::new("wired.chat.me")
            .with("wired.chat.id", Field::Uint32(chat_id))
            .with("wired.user.id", Field::Uint32(session.id()))
            .with("wired.chat.me", Field::String(line));
        broadcast::broadcast_to_chat(&server.users, &server.chats, chat_id, &notice, None).await?;
    }
    Ok(HandlerOutcome::Okay)
}

pub async fn create_chat<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.chat_create_chats, "chat_create_chats")?;

    let chat_id = server.chats.create_private_chat().await;
    server.chats.join_as_owner(chat_id, session.id()).await?;

    let reply = Message::new("wired.chat.chat_created")
        .with("wired.chat.id", Field::Uint32(chat_id))
        .echo_transaction(message);
    Ok(HandlerOutcome::Messages(vec![reply]))
}

pub async fn invite_user<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let chat_id = req_u32(message, "wired.chat.id")?;
    let target_id = req_u32(message, "wired.user.id")?;
    server.chats.invite(chat_id, session.id(), target_id).await?;

    if let Some(target) = server.users.user_with_id(target_id).await {
        let notice = Message::new("wired.chat.invitation")
            .with("wired.chat.id", Field::Uint32(chat_id))
            .with("wired.user.id", Field::Uint32(session.id()));
        let _ = target.send(&notice).await;
    }
    Ok(HandlerOutcome::Okay)
}

pub async fn decline_invitation<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let chat_id = req_u32(message, "wired.chat.id")?;
    server.chats.decline_invitation(chat_id, session.id()).await?;
    broadcast::broadcast_to_chat(
        &server.users,
        &server.chats,
        chat_id,
        &Message::new("wired.chat.user_decline_invitation")
            .with("wired.chat.id", Field::Uint32(chat_id))
            .with("wired.user.id", Field::Uint32(session.id())),
        None,
    )
    .await
    .ok();
    Ok(HandlerOutcome::Okay)
}

pub async fn kick_user<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.user_kick_users, "user_kick_users")?;

    let chat_id = req_u32(message, "wired.chat.id")?;
    let target_id = req_u32(message, "wired.user.id")?;
    let reason = opt_string(message, "wired.user.disconnect_message");

    server.chats.kick_user(chat_id, target_id).await?;

    let mut notice = Message::new("wired.chat.user_kick")
        .with("wired.chat.id", Field::Uint32(chat_id))
        .with("wired.user.id", Field::Uint32(target_id));
    if let Some(reason) = &reason {
        notice.set("wired.user.disconnect_message", Field::String(reason.clone()));
    }

    broadcast::broadcast_to_chat(&server.users, &server.chats, chat_id, &notice, None)
        .await
        .ok();
    if let Some(target) = server.users.user_with_id(target_id).await {
        let _ = target.send(&notice).await;
    }
    Ok(HandlerOutcome::Okay)
}
