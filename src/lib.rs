//! Completion-gated command dispatch queue.
//!
//! A producer submits a [`CommandKind`] and blocks until a consumer has
//! claimed it with [`Consumer::take`] and retired it with
//! [`Consumer::finish`]. A single [`StatusRecord`] is shared alongside.

pub mod config;
pub mod consumer;
pub mod control;
pub mod error;
pub mod liveness;
pub mod logging;
pub mod queue;
pub mod sim;
pub mod status;
pub mod types;

pub use config::QueueConfig;
pub use consumer::Consumer;
pub use control::{Request, Response, Session};
pub use error::{QueueError, QueueResult};
pub use queue::{CommandQueue, Pending};
pub use types::{Claim, CommandKind, StatusRecord, Telemetry};
