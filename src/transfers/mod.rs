//! Transfer engine (spec.md §4.H): queued/running file movements, the
//! scheduling algorithm that admits them, and the streaming loop that moves
//! bytes once admitted.

pub mod queue;
pub mod scheduler;
pub mod stream;

pub use queue::{Transfer, TransferKey, TransferKind, TransferQueue, TransferState};
pub use scheduler::{schedule, sweep_waiting_timeouts, Caps, Decision};
