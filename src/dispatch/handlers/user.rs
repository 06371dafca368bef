//! User category (spec.md §4.D): nick/status/icon/idle, info lookups, the
//! user list, and the two forced-removal operations (disconnect, ban).

use std::net::IpAddr;

use tokio::io::AsyncWrite;

use crate::broadcast;
use crate::dispatch::handlers::{
    log, login_of, opt_string, privileges_of, req_bool, req_data, req_string, req_u32, require,
    HandlerOutcome, HandlerResult,
};
use crate::error::WiredError;
use crate::protocol::{Field, Message};
use crate::server::Server;
use crate::users::Session;

fn status_message(id: u32, nick: String, status: String, idle: bool) -> Message {
    Message::new("wired.user.status")
        .with("wired.user.id", Field::Uint32(id))
        .with("wired.user.nick", Field::String(nick))
        .with("wired.user.status", Field::String(status))
        .with("wired.user.idle", Field::Bool(idle))
}

pub(crate) async fn broadcast_status<W>(server: &Server<W>, session: &Session<W>)
where
    W: AsyncWrite + Unpin + Send,
{
    let message = status_message(session.id(), session.nick().await, session.status().await, session.idle().await);
    broadcast::broadcast_to_all(&server.users, &message, None).await;
}

pub async fn set_nick<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let nick = req_string(message, "wired.user.nick")?;
    if session.is_logged_in().await {
        let privileges = privileges_of(server, session).await?;
        if privileges.user_cannot_set_nick.unwrap_or(false) {
            return Err(WiredError::PermissionDenied("user_cannot_set_nick".to_string()));
        }
    }
    session.set_nick(nick).await;
    broadcast_status(server, session).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn set_status<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let status = req_string(message, "wired.user.status")?;
    session.set_status(status).await;
    broadcast_status(server, session).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn set_icon<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let icon = req_data(message, "wired.user.icon")?;
    session.set_icon(icon.clone()).await;
    let notice = Message::new("wired.user.icon")
        .with("wired.user.id", Field::Uint32(session.id()))
        .with("wired.user.icon", Field::Data(icon));
    broadcast::broadcast_to_all(&server.users, &notice, None).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn set_idle<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let idle = req_bool(message, "wired.user.idle")?;
    session.set_idle(idle).await;
    broadcast_status(server, session).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn get_info<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.user_get_info, "user_get_info")?;

    let id = req_u32(message, "wired.user.id")?;
    let target = server.users.user_with_id(id).await.ok_or(WiredError::UserNotFound(id))?;

    let reply = Message::new("wired.user.info")
        .with("wired.user.id", Field::Uint32(id))
        .with(
            "wired.user.login",
            Field::String(target.account_name().await.unwrap_or_default()),
        )
        .with("wired.user.nick", Field::String(target.nick().await))
        .with("wired.user.status", Field::String(target.status().await))
        .with("wired.user.icon", Field::Data(target.icon().await))
        .with("wired.user.idle", Field::Bool(target.idle().await))
        .with("wired.user.host", Field::String(target.host.clone()))
        .with("wired.user.ip", Field::String(target.ip.to_string()))
        .echo_transaction(message);

    Ok(HandlerOutcome::Messages(vec![reply]))
}

pub async fn get_users<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.user_get_users, "user_get_users")?;

    log::record(server, "got_users", &login_of(session).await?, vec![]).await;

    let rows = server
        .users
        .reply_user_list()
        .await
        .into_iter()
        .map(|m| m.echo_transaction(message))
        .collect();
    Ok(HandlerOutcome::Messages(rows))
}

pub async fn disconnect_user<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.user_kick_users, "user_kick_users")?;

    let id = req_u32(message, "wired.user.id")?;
    let reason = opt_string(message, "wired.user.disconnect_message");
    let target = server.users.user_with_id(id).await.ok_or(WiredError::UserNotFound(id))?;

    if let Some(login) = target.account_name().await {
        let target_privileges = server.accounts.read_user_with_group_overlay(&login).await?.privileges;
        if target_privileges.user_cannot_be_disconnected.unwrap_or(false) {
            return Err(WiredError::UserCannotBeDisconnected(id));
        }
    }

    let mut params = vec![id.to_string()];
    if let Some(reason) = reason {
        params.push(reason);
    }
    log::record(server, "disconnect_user", &login_of(session).await?, params).await;
    target.force_disconnect().await;
    Ok(HandlerOutcome::Okay)
}

pub async fn ban_user<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.user_ban_users, "user_ban_users")?;

    let id = req_u32(message, "wired.user.id")?;
    let expiry = message.get("wired.banned.expiration_date").and_then(|f| {
        if let Field::Date(d) = f {
            Some(*d)
        } else {
            None
        }
    });
    let target = server.users.user_with_id(id).await.ok_or(WiredError::UserNotFound(id))?;

    if let Some(login) = target.account_name().await {
        let target_privileges = server.accounts.read_user_with_group_overlay(&login).await?.privileges;
        if target_privileges.user_cannot_be_disconnected.unwrap_or(false) {
            return Err(WiredError::UserCannotBeDisconnected(id));
        }
    }

    let pattern = ip_pattern(target.ip);
    server.banlist.add_ban(pattern, expiry).await?;
    log::record(server, "ban_user", &login_of(session).await?, vec![id.to_string()]).await;
    target.force_disconnect().await;
    Ok(HandlerOutcome::Okay)
}

fn ip_pattern(ip: IpAddr) -> String {
    ip.to_string()
}
