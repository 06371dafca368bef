//! `wired.send_login` / `wired.send_ping` (spec.md §4.A / §8 scenario 1).
//!
//! `client_info`/`server_info` are already exchanged by
//! `server::acceptor::handshake_and_serve` before the dispatch loop starts,
//! so this module only covers what is left of the Connection category.

use tokio::io::AsyncWrite;

use crate::dispatch::handlers::{req_string, HandlerOutcome, HandlerResult};
use crate::error::WiredError;
use crate::protocol::{Field, Message};
use crate::server::Server;
use crate::users::session::SessionState;
use crate::users::Session;

pub async fn send_login<W>(
    server: &Server<W>,
    session: &Session<W>,
    message: &Message,
) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let login = req_string(message, "wired.user.login")?;
    let password = req_string(message, "wired.user.password")?;

    if !server.accounts.verify_password(&login, &password).await {
        return Err(WiredError::LoginFailed);
    }

    session.set_account_name(login.clone()).await;
    session.set_state(SessionState::LoggedIn).await;
    let _ = server
        .accounts
        .edit_user(&login, &login, |account| {
            account.login_time = Some(chrono::Utc::now());
        })
        .await;

    let reply = Message::new("wired.login")
        .with("wired.user.id", Field::Uint32(session.id()))
        .echo_transaction(message);

    let account = server.accounts.read_user_with_group_overlay(&login).await?;
    let privileges = Message::new("wired.account.privileges")
        .with("wired.account.privileges", account.privileges_field());

    crate::dispatch::handlers::log::record(server, "login", &login, vec![]).await;

    Ok(HandlerOutcome::Messages(vec![reply, privileges]))
}

pub async fn send_ping<W>(_server: &Server<W>, _session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    Ok(HandlerOutcome::Messages(vec![
        Message::new("wired.ping").echo_transaction(message)
    ]))
}
