//! The wire-level message value and the closed error enum clients observe.
//!
//! A message is never a generated-per-name struct (per the design note in
//! spec.md §9): it is a name plus an ordered map of named, typed fields. This
//! lets `dispatch::router` route purely on `Message::name()` and lets every
//! handler build its reply the same way the original C implementation's
//! `wi_p7_message_with_name` + `wi_p7_message_set_*` calls did.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One value a message field can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Bool(bool),
    Enum(i32),
    Int32(i32),
    Int64(i64),
    Uint32(u32),
    Uint64(u64),
    String(String),
    Date(DateTime<Utc>),
    Uuid(Uuid),
    Data(Vec<u8>),
    List(Vec<Field>),
    /// Inline length-prefixed raw byte stream (file data during transfers).
    Oob(Vec<u8>),
}

impl Field {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Field::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Field::Uint32(v) => Some(*v),
            Field::Int32(v) if *v >= 0 => Some(*v as u32),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Field::Uint64(v) => Some(*v),
            Field::Uint32(v) => Some(*v as u64),
            Field::Int64(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Field::Int64(v) => Some(*v),
            Field::Int32(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Field::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Field::Uuid(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Field::Data(v) | Field::Oob(v) => Some(v),
            _ => None,
        }
    }
}

/// A typed, named protocol message: `(name, field-map)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    name: String,
    fields: BTreeMap<String, Field>,
}

impl Message {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&mut self, field: impl Into<String>, value: Field) -> &mut Self {
        self.fields.insert(field.into(), value);
        self
    }

    pub fn with(mut self, field: impl Into<String>, value: Field) -> Self {
        self.set(field, value);
        self
    }

    pub fn get(&self, field: &str) -> Option<&Field> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copies `wired.transaction` from `request` onto this reply, if present
    /// (U6: every reply and terminator for a request carrying a transaction
    /// id must echo it).
    pub fn echo_transaction(mut self, request: &Message) -> Self {
        if let Some(txn) = request.get("wired.transaction").cloned() {
            self.set("wired.transaction", txn);
        }
        self
    }

    /// Builds the standard `okay` success reply.
    pub fn okay(request: &Message) -> Self {
        Message::new("wired.okay").echo_transaction(request)
    }

    /// Builds a `wired.error` reply carrying the given closed error code.
    pub fn error(request: &Message, error: WireError) -> Self {
        Message::new("wired.error")
            .with("wired.error", Field::Enum(error as i32))
            .echo_transaction(request)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.name)?;
        for (i, (k, v)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", k, v)?;
        }
        write!(f, "}}")
    }
}

/// The closed `wired.error` enumeration from spec.md §6. Values are assigned
/// in the order the spec lists them so the discriminants are stable wire
/// constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum WireError {
    PermissionDenied = 0,
    InvalidMessage = 1,
    MessageOutOfSequence = 2,
    UnrecognizedMessage = 3,
    LoginFailed = 4,
    UserNotFound = 5,
    UserCannotBeDisconnected = 6,
    ChatNotFound = 7,
    NotOnChat = 8,
    AlreadyOnChat = 9,
    NotInvitedToChat = 10,
    BoardExists = 11,
    BoardNotFound = 12,
    FileNotFound = 13,
    FileExists = 14,
    AccountNotFound = 15,
    AccountExists = 16,
    AccountInUse = 17,
    NotSubscribed = 18,
    AlreadySubscribed = 19,
    BanExists = 20,
    BanNotFound = 21,
    TrackerNotEnabled = 22,
    InternalError = 23,
    RsrcNotSupported = 24,
}

/// Maps an internal [`crate::error::WiredError`] onto the closed wire enum.
/// This is the single seam mentioned in spec.md §7: handlers never hand a
/// `WiredError` to the client directly.
impl From<&crate::error::WiredError> for WireError {
    fn from(err: &crate::error::WiredError) -> Self {
        use crate::error::WiredError as E;
        match err {
            E::PermissionDenied(_) | E::PrivilegeEscalation { .. } => WireError::PermissionDenied,
            E::InvalidMessage { .. } | E::Protocol(_) => WireError::InvalidMessage,
            E::MessageOutOfSequence => WireError::MessageOutOfSequence,
            E::LoginFailed => WireError::LoginFailed,
            E::UserNotFound(_) => WireError::UserNotFound,
            E::UserCannotBeDisconnected(_) => WireError::UserCannotBeDisconnected,
            E::ChatNotFound(_) => WireError::ChatNotFound,
            E::NotOnChat(_) => WireError::NotOnChat,
            E::AlreadyOnChat(_) => WireError::AlreadyOnChat,
            E::NotInvitedToChat(_) => WireError::NotInvitedToChat,
            E::BoardExists(_) => WireError::BoardExists,
            E::BoardNotFound(_) => WireError::BoardNotFound,
            E::FileNotFound(_) => WireError::FileNotFound,
            E::FileExists(_) => WireError::FileExists,
            E::AccountNotFound(_) => WireError::AccountNotFound,
            E::AccountExists(_) => WireError::AccountExists,
            E::AccountInUse(_) => WireError::AccountInUse,
            E::TrackerNotEnabled => WireError::TrackerNotEnabled,
            E::NotSubscribed(_) => WireError::NotSubscribed,
            E::AlreadySubscribed(_) => WireError::AlreadySubscribed,
            E::BanExists(_) => WireError::BanExists,
            E::BanNotFound(_) => WireError::BanNotFound,
            E::RsrcNotSupported => WireError::RsrcNotSupported,
            E::UnrecognizedMessage(_) => WireError::UnrecognizedMessage,
            E::Io { .. } | E::Internal(_) => WireError::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_transaction_round_trips() {
        let mut req = Message::new("wired.chat.join_chat");
        req.set("wired.transaction", Field::Uint32(42));

        let reply = Message::okay(&req);
        assert_eq!(reply.get("wired.transaction"), Some(&Field::Uint32(42)));
    }

    #[test]
    fn missing_transaction_is_not_fabricated() {
        let req = Message::new("wired.ping");
        let reply = Message::okay(&req);
        assert!(reply.get("wired.transaction").is_none());
    }

    #[test]
    fn error_maps_internal_errors_to_closed_enum() {
        let req = Message::new("wired.board.add_board");
        let reply = Message::error(&req, WireError::PermissionDenied);
        assert_eq!(reply.name(), "wired.error");
        assert_eq!(
            reply.get("wired.error"),
            Some(&Field::Enum(WireError::PermissionDenied as i32))
        );
    }
}
