//! Handler verdicts and their acknowledgment mapping.
//!
//! Handlers classify every message into one of three verdicts; [`resolve`]
//! turns the verdict into the matching broker call. Transport code never
//! looks at business outcomes, and handlers never touch acknowledgments.

use crate::{Delivery, Result};

/// Outcome of handling one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckVerdict {
    /// Processed; remove from the queue.
    Ack,
    /// Not processed yet; make it available for redelivery.
    RequeueRetry,
    /// Never processable; dead-letter it (or drop it without a DLX).
    DiscardPermanently,
}

/// Broker acknowledgment primitive selected for a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    Ack,
    Nack { requeue: bool },
}

impl From<AckVerdict> for AckAction {
    fn from(verdict: AckVerdict) -> Self {
        // ---
        match verdict {
            AckVerdict::Ack => AckAction::Ack,
            AckVerdict::RequeueRetry => AckAction::Nack { requeue: true },
            AckVerdict::DiscardPermanently => AckAction::Nack { requeue: false },
        }
    }
}

/// Settle `delivery` according to `verdict`.
pub async fn resolve(verdict: AckVerdict, delivery: &Delivery) -> Result<()> {
    // ---
    match AckAction::from(verdict) {
        AckAction::Ack => delivery.ack().await,
        AckAction::Nack { requeue } => delivery.nack(requeue).await,
    }
}
