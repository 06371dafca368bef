//! Wire protocol: framing, the message value type, and the closed schema
//! used to verify every decoded message before dispatch sees it.

pub mod codec;
pub mod message;
pub mod schema;

pub use codec::{decode_message, encode_message, read_message, write_message};
pub use message::{Field, Message, WireError};
pub use schema::MessageSchema;
