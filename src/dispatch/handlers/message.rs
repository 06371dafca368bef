//! Message category (spec.md §4.F): private messages between two logged-in
//! users and server-wide broadcasts.

use tokio::io::AsyncWrite;

use crate::broadcast;
use crate::dispatch::handlers::{privileges_of, req_string, req_u32, require, HandlerOutcome, HandlerResult};
use crate::error::WiredError;
use crate::protocol::{Field, Message};
use crate::server::Server;
use crate::users::Session;

pub async fn send_message<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.message_send_messages, "message_send_messages")?;

    let target_id = req_u32(message, "wired.user.id")?;
    let text = req_string(message, "wired.message.message")?;
    let target = server.users.user_with_id(target_id).await.ok_or(WiredError::UserNotFound(target_id))?;

    let notice = Message::new("wired.message.message")
        .with("wired.user.id", Field::Uint32(session.id()))
        .with("wired.message.message", Field::String(text))
        .with("wired.message.date", Field::Date(chrono::Utc::now()));
    target.send(&notice).await?;
    Ok(HandlerOutcome::Okay)
}

pub async fn send_broadcast<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.message_broadcast, "message_broadcast")?;

    let text = req_string(message, "wired.message.broadcast")?;
    let notice = Message::new("wired.message.broadcast")
        .with("wired.user.id", Field::Uint32(session.id()))
        .with("wired.message.broadcast", Field::String(text));
    broadcast::broadcast_to_all(&server.users, &notice, None).await;
    Ok(HandlerOutcome::Okay)
}
