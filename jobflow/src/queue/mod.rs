//! The channel fabric: bounded queues, select, and fan operators.
//!
//! [`Queue`] is the only ownership boundary between pool, pipeline and
//! caller. Every blocking operation takes a [`Scope`](crate::cancellation::Scope)
//! and returns as soon as that scope is done.

mod channel;
mod error;
mod fan;
mod select;

pub use channel::{Queue, QueueReceiver, QueueState};
pub use error::{RecvError, SendError, TryRecvError, TrySendError};
pub use fan::{broadcast, dispatch, merge, Broadcast, DropCounters, SlowConsumerPolicy};
pub use select::{recv_any, recv_biased, send_any, Select, Selected};

/// Capacity used when a stage or pool does not configure one.
pub const DEFAULT_QUEUE_CAPACITY: usize = 8;
