//! Error taxonomy for the command queue.

use thiserror::Error;

use crate::types::{ClaimId, ConsumerId};

/// Errors returned by queue, consumer and status operations.
///
/// None of these are fatal: misuse by a caller is always reported here
/// instead of touching shared state.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("invalid command kind {0}")]
    InvalidKind(i32),
    #[error("backlog full ({capacity} commands queued)")]
    BacklogFull { capacity: usize },
    #[error("no command queued")]
    Empty,
    #[error("consumer {consumer} already holds claim {claim}")]
    ClaimHeld { consumer: ConsumerId, claim: ClaimId },
    #[error("consumer {consumer} holds no matching claim")]
    NoActiveClaim { consumer: ConsumerId },
    #[error("status record not initialized")]
    Uninitialized,
    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

pub type QueueResult<T> = Result<T, QueueError>;
