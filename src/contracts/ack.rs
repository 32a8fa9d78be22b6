use serde::{Deserialize, Serialize};

/// Outcome a message handler reports for a single delivery.
///
/// Every delivery ends in exactly one of these:
/// - `Ack`: processed, remove from the queue
/// - `NackRequeue`: transient failure, return to the queue for redelivery
/// - `NackDiscard`: permanent failure, drop (dead-lettered by queue policy)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AckType {
    Ack,
    NackRequeue,
    NackDiscard,
}

impl AckType {
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack)
    }

    /// Whether the broker should put the message back on the queue.
    pub fn requeue(&self) -> bool {
        matches!(self, Self::NackRequeue)
    }

    /// Metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::NackRequeue => "nack_requeue",
            Self::NackDiscard => "nack_discard",
        }
    }
}

impl std::fmt::Display for AckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
