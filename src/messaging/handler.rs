use async_trait::async_trait;

use crate::contracts::AckType;

/// Application callback invoked once per decoded message.
///
/// Plain synchronous closures `Fn(T) -> AckType` implement this trait, so
/// small handlers don't need a dedicated type.
#[async_trait]
pub trait MessageHandler<T: Send + 'static>: Send + Sync {
    async fn handle(&self, message: T) -> AckType;
}

#[async_trait]
impl<T, F> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> AckType + Send + Sync,
{
    async fn handle(&self, message: T) -> AckType {
        (self)(message)
    }
}

/// Failure classification for handlers written in `Result` style.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Transient error (will retry): {0}")]
    Transient(String),

    #[error("Permanent error (will not retry): {0}")]
    Permanent(String),
}

impl From<Result<(), HandlerError>> for AckType {
    fn from(result: Result<(), HandlerError>) -> Self {
        match result {
            Ok(()) => AckType::Ack,
            Err(HandlerError::Transient(_)) => AckType::NackRequeue,
            Err(HandlerError::Permanent(_)) => AckType::NackDiscard,
        }
    }
}
