//! Wired — a multi-user server implementing a custom binary chat / file
//! sharing / discussion-board protocol.
//!
//! A client connects over a single encrypted TCP session and can:
//! participate in public and private chat rooms, exchange private and
//! broadcast messages, post to permissioned discussion boards, browse and
//! search a shared file hierarchy with per-folder access control, upload and
//! download files, and perform account and server administration.
//!
//! # Architecture
//!
//! [`server::Server`] owns every subsystem (accounts, banlist, users, chats,
//! boards, files, transfers, event log) behind explicit locks and hands an
//! `Arc` of itself to each accepted connection's [`dispatch`] loop. See
//! `DESIGN.md` for the grounding of each subsystem.

pub mod accounts;
pub mod banlist;
pub mod boards;
pub mod broadcast;
pub mod chat;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod eventlog;
pub mod files;
pub mod protocol;
pub mod server;
pub mod subscriptions;
pub mod transfers;
pub mod users;

pub use config::WiredConfig;
pub use error::{WiredError, WiredResult};
pub use server::Server;
