//! Message dispatcher (spec.md §4.J): per-session receive loop, pre-dispatch
//! state gate, and the name→handler routing table.

pub mod handlers;
pub mod router;

pub use router::{dispatch_one, serve_connection};
