//! Banlist category (spec.md §4.C): listing, adding, and removing ban
//! patterns. Gated by `user_ban_users` — there is no separate banlist-admin
//! privilege in the schema.

use tokio::io::AsyncWrite;

use crate::dispatch::handlers::{privileges_of, req_string, require, HandlerOutcome, HandlerResult};
use crate::protocol::{Field, Message};
use crate::server::Server;
use crate::users::Session;

pub async fn get_bans<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.user_ban_users, "user_ban_users")?;

    let mut out: Vec<Message> = server
        .banlist
        .list_permanent()
        .await
        .into_iter()
        .map(|pattern| {
            Message::new("wired.banlist.ban_list")
                .with("wired.banlist.pattern", Field::String(pattern))
                .echo_transaction(message)
        })
        .collect();
    out.extend(server.banlist.list_timed().await.into_iter().map(|(pattern, expiry)| {
        Message::new("wired.banlist.ban_list")
            .with("wired.banlist.pattern", Field::String(pattern))
            .with("wired.banned.expiration_date", Field::Date(expiry))
            .echo_transaction(message)
    }));
    out.push(Message::new("wired.banlist.ban_list.done").echo_transaction(message));
    Ok(HandlerOutcome::Messages(out))
}

pub async fn add_ban<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.user_ban_users, "user_ban_users")?;

    let pattern = req_string(message, "wired.banlist.pattern")?;
    let expiry = message.get("wired.banned.expiration_date").and_then(|f| {
        if let Field::Date(d) = f {
            Some(*d)
        } else {
            None
        }
    });
    server.banlist.add_ban(pattern, expiry).await?;
    Ok(HandlerOutcome::Okay)
}

pub async fn delete_ban<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.user_ban_users, "user_ban_users")?;

    let pattern = req_string(message, "wired.banlist.pattern")?;
    server.banlist.delete_ban(&pattern).await?;
    Ok(HandlerOutcome::Okay)
}
