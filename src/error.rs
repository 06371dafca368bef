//! Unified error handling for the Wired server.
//!
//! Every internal failure is represented as a [`WiredError`]. Handlers never
//! let these escape across the dispatch boundary: `dispatch::router` is the
//! single place a [`WiredError`] is mapped onto the closed wire-level
//! [`crate::protocol::message::WireError`] enum that clients actually see.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type WiredResult<T> = Result<T, WiredError>;

/// All internal failure modes, grouped by the subsystem that raises them.
#[derive(Error, Debug)]
pub enum WiredError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        source: io::Error,
        path: Option<PathBuf>,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message {name:?} failed schema verification: {reason}")]
    InvalidMessage { name: String, reason: String },

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("account already exists: {0}")]
    AccountExists(String),

    #[error("account {0} is in use by a live session")]
    AccountInUse(String),

    #[error("tracker registration is not enabled on this server")]
    TrackerNotEnabled,

    #[error("account {name:?} may not grant privilege {privilege:?} it does not itself hold")]
    PrivilegeEscalation { name: String, privilege: String },

    #[error("ban already exists for {0}")]
    BanExists(String),

    #[error("ban not found for {0}")]
    BanNotFound(String),

    #[error("chat {0} not found")]
    ChatNotFound(u32),

    #[error("user {0} is not a member of this chat")]
    NotOnChat(u32),

    #[error("user {0} is already a member of this chat")]
    AlreadyOnChat(u32),

    #[error("user {0} was not invited to this chat")]
    NotInvitedToChat(u32),

    #[error("board not found: {0}")]
    BoardNotFound(String),

    #[error("board already exists: {0}")]
    BoardExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file already exists: {0}")]
    FileExists(String),

    #[error("user {0} not found")]
    UserNotFound(u32),

    #[error("user {0} cannot be disconnected")]
    UserCannotBeDisconnected(u32),

    #[error("login failed")]
    LoginFailed,

    #[error("message out of sequence for current session state")]
    MessageOutOfSequence,

    #[error("not subscribed to {0}")]
    NotSubscribed(String),

    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),

    #[error("rsrc fork not supported here")]
    RsrcNotSupported,

    #[error("message {0:?} is not recognized in the current context")]
    UnrecognizedMessage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WiredError {
    pub fn io(source: io::Error, path: impl Into<PathBuf>) -> Self {
        WiredError::Io {
            source,
            path: Some(path.into()),
        }
    }
}

/// Adds `.context("...")` to any `Result<_, std::io::Error>`, turning it into
/// a [`WiredResult`] with the failing path attached where known.
pub trait ErrorContext<T> {
    fn with_context<F>(self, f: F) -> WiredResult<T>
    where
        F: FnOnce() -> String;
}

impl<T> ErrorContext<T> for Result<T, io::Error> {
    fn with_context<F>(self, f: F) -> WiredResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| WiredError::Internal(format!("{}: {}", f(), e)))
    }
}
