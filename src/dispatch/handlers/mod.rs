//! Shared handler plumbing (spec.md §4.J): the outcome a handler reports
//! back to the router, field-extraction helpers, and the one place a
//! session's effective privileges are computed.

pub mod account;
pub mod banlist;
pub mod board;
pub mod chat;
pub mod connection;
pub mod file;
pub mod log;
pub mod message;
pub mod transfer;
pub mod user;

use std::sync::Arc;

use tokio::io::AsyncWrite;
use uuid::Uuid;

use crate::accounts::Privileges;
use crate::error::{WiredError, WiredResult};
use crate::protocol::{Field, Message};
use crate::server::Server;
use crate::transfers::Transfer;
use crate::users::Session;

/// What a handler asks the router to do after it returns.
pub enum HandlerOutcome {
    /// Reply with a plain `wired.okay`.
    Okay,
    /// Reply with exactly these messages instead of `wired.okay` (a direct
    /// value, or a row stream already terminated with its `.done` marker).
    Messages(Vec<Message>),
    /// The handler already sent everything itself (broadcasts, or rows
    /// streamed one at a time); the router sends nothing further.
    Handled,
    /// A transfer was admitted to run immediately. The router must drop out
    /// of normal dispatch and drive the streaming loop for it.
    BeginTransfer(Arc<Transfer>),
}

pub type HandlerResult = WiredResult<HandlerOutcome>;

/// Looks up a logged-in session's account name. Handlers that require login
/// are only ever reached once the router's state gate has confirmed
/// `LoggedIn`, so a missing login here is an internal inconsistency rather
/// than a client mistake.
pub async fn login_of<W>(session: &Session<W>) -> WiredResult<String>
where
    W: AsyncWrite + Unpin + Send,
{
    session
        .account_name()
        .await
        .ok_or(WiredError::MessageOutOfSequence)
}

/// The session's effective privileges (user account overlaid onto its
/// group), per spec.md §4.B.
pub async fn privileges_of<W>(server: &Server<W>, session: &Session<W>) -> WiredResult<Privileges>
where
    W: AsyncWrite + Unpin + Send,
{
    let login = login_of(session).await?;
    let account = server.accounts.read_user_with_group_overlay(&login).await?;
    Ok(account.privileges)
}

/// Fails with `PermissionDenied` unless `flag` is explicitly set to `true`.
pub fn require(flag: Option<bool>, privilege: &str) -> WiredResult<()> {
    if flag.unwrap_or(false) {
        Ok(())
    } else {
        Err(WiredError::PermissionDenied(privilege.to_string()))
    }
}

fn missing(message: &Message, field: &str) -> WiredError {
    WiredError::InvalidMessage {
        name: message.name().to_string(),
        reason: format!("missing field {}", field),
    }
}

pub fn req_string(message: &Message, field: &str) -> WiredResult<String> {
    message
        .get(field)
        .and_then(Field::as_str)
        .map(str::to_string)
        .ok_or_else(|| missing(message, field))
}

pub fn opt_string(message: &Message, field: &str) -> Option<String> {
    message.get(field).and_then(Field::as_str).map(str::to_string)
}

pub fn req_u32(message: &Message, field: &str) -> WiredResult<u32> {
    message
        .get(field)
        .and_then(Field::as_u32)
        .ok_or_else(|| missing(message, field))
}

pub fn opt_u32(message: &Message, field: &str) -> Option<u32> {
    message.get(field).and_then(Field::as_u32)
}

pub fn req_u64(message: &Message, field: &str) -> WiredResult<u64> {
    message
        .get(field)
        .and_then(Field::as_u64)
        .ok_or_else(|| missing(message, field))
}

pub fn opt_u64(message: &Message, field: &str) -> Option<u64> {
    message.get(field).and_then(Field::as_u64)
}

pub fn req_bool(message: &Message, field: &str) -> WiredResult<bool> {
    message
        .get(field)
        .and_then(Field::as_bool)
        .ok_or_else(|| missing(message, field))
}

pub fn opt_bool(message: &Message, field: &str) -> Option<bool> {
    message.get(field).and_then(Field::as_bool)
}

pub fn req_enum(message: &Message, field: &str) -> WiredResult<i32> {
    match message.get(field) {
        Some(Field::Enum(v)) => Ok(*v),
        _ => Err(missing(message, field)),
    }
}

pub fn opt_enum(message: &Message, field: &str) -> Option<i32> {
    match message.get(field) {
        Some(Field::Enum(v)) => Some(*v),
        _ => None,
    }
}

pub fn req_uuid(message: &Message, field: &str) -> WiredResult<Uuid> {
    message
        .get(field)
        .and_then(Field::as_uuid)
        .ok_or_else(|| missing(message, field))
}

pub fn req_data(message: &Message, field: &str) -> WiredResult<Vec<u8>> {
    message
        .get(field)
        .and_then(Field::as_data)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| missing(message, field))
}

pub fn opt_data(message: &Message, field: &str) -> Option<Vec<u8>> {
    message.get(field).and_then(Field::as_data).map(<[u8]>::to_vec)
}
