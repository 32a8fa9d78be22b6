use lapin::{
    options::{QueueBindOptions, QueueDeclareOptions},
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable},
    Channel, Connection, Queue,
};
use tracing::{error, info};

use super::channel::{ChannelError, ChannelProvider};
use crate::config::DEFAULT_DEAD_LETTER_EXCHANGE;

const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Lifetime class of a declared queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDurability {
    /// Survives broker restarts, shared between connections.
    Durable,
    /// Exclusive to the declaring connection and deleted with it.
    Transient,
}

impl QueueDurability {
    pub fn declare_options(self) -> QueueDeclareOptions {
        match self {
            Self::Durable => QueueDeclareOptions {
                durable: true,
                auto_delete: false,
                exclusive: false,
                ..Default::default()
            },
            Self::Transient => QueueDeclareOptions {
                durable: false,
                auto_delete: true,
                exclusive: true,
                ..Default::default()
            },
        }
    }
}

/// Everything needed to make a queue exist and receive messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub exchange: String,
    pub queue_name: String,
    pub routing_key: String,
    pub durability: QueueDurability,
}

impl QueueSpec {
    pub fn new(
        exchange: impl Into<String>,
        queue_name: impl Into<String>,
        routing_key: impl Into<String>,
        durability: QueueDurability,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue_name: queue_name.into(),
            routing_key: routing_key.into(),
            durability,
        }
    }
}

/// Declares queues and their bindings. Every queue it declares dead-letters
/// into the same exchange.
#[derive(Debug, Clone)]
pub struct Topology {
    dead_letter_exchange: String,
    prefetch_count: Option<u16>,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new(DEFAULT_DEAD_LETTER_EXCHANGE)
    }
}

impl Topology {
    pub fn new(dead_letter_exchange: impl Into<String>) -> Self {
        Self {
            dead_letter_exchange: dead_letter_exchange.into(),
            prefetch_count: None,
        }
    }

    /// Prefetch limit applied to channels opened by `declare_and_bind`.
    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = Some(prefetch_count);
        self
    }

    pub fn dead_letter_exchange(&self) -> &str {
        &self.dead_letter_exchange
    }

    pub fn queue_arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            DEAD_LETTER_EXCHANGE_ARG.into(),
            AMQPValue::LongString(self.dead_letter_exchange.clone().into()),
        );
        args
    }

    /// Opens a fresh channel, declares `spec.queue_name` and binds it to
    /// `spec.exchange` under `spec.routing_key`.
    ///
    /// Re-declaring an existing queue with the same parameters is a no-op.
    /// Declaring it with a different durability class fails with
    /// [`TopologyError::DeclareFailed`] and `configuration_drift` set.
    pub async fn declare_and_bind(
        &self,
        connection: &Connection,
        spec: &QueueSpec,
    ) -> Result<(Channel, Queue), TopologyError> {
        let channel = ChannelProvider::create_channel(connection, self.prefetch_count).await?;

        let queue = channel
            .queue_declare(
                &spec.queue_name,
                spec.durability.declare_options(),
                self.queue_arguments(),
            )
            .await
            .map_err(|e| {
                let configuration_drift = is_configuration_drift(&e);
                error!(
                    error = %e,
                    queue = %spec.queue_name,
                    durability = ?spec.durability,
                    configuration_drift,
                    "Queue declaration rejected"
                );
                TopologyError::DeclareFailed {
                    queue: spec.queue_name.clone(),
                    reason: e.to_string(),
                    configuration_drift,
                }
            })?;

        channel
            .queue_bind(
                &spec.queue_name,
                &spec.exchange,
                &spec.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                error!(
                    error = %e,
                    queue = %spec.queue_name,
                    exchange = %spec.exchange,
                    routing_key = %spec.routing_key,
                    "Queue binding rejected"
                );
                TopologyError::BindFailed {
                    queue: spec.queue_name.clone(),
                    exchange: spec.exchange.clone(),
                    routing_key: spec.routing_key.clone(),
                    reason: e.to_string(),
                }
            })?;

        info!(
            queue = %spec.queue_name,
            exchange = %spec.exchange,
            routing_key = %spec.routing_key,
            durability = ?spec.durability,
            dead_letter_exchange = self.dead_letter_exchange(),
            channel_id = channel.id(),
            "Queue topology configured"
        );

        Ok((channel, queue))
    }
}

fn is_configuration_drift(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp_error) => is_drift_kind(amqp_error.kind()),
        _ => false,
    }
}

/// `PRECONDITION_FAILED` means the arguments differ. `RESOURCE_LOCKED` means
/// an exclusive queue of that name is owned by another connection.
fn is_drift_kind(kind: &AMQPErrorKind) -> bool {
    matches!(
        kind,
        AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED | AMQPSoftError::RESOURCELOCKED)
    )
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Failed to declare queue {queue}: {reason}")]
    DeclareFailed {
        queue: String,
        reason: String,
        configuration_drift: bool,
    },

    #[error("Failed to bind queue {queue} to {exchange} with key {routing_key}: {reason}")]
    BindFailed {
        queue: String,
        exchange: String,
        routing_key: String,
        reason: String,
    },
}

impl TopologyError {
    /// The queue already exists with parameters that differ from the
    /// requested ones. Callers should treat this as fatal.
    pub fn is_configuration_drift(&self) -> bool {
        matches!(
            self,
            Self::DeclareFailed {
                configuration_drift: true,
                ..
            }
        )
    }
}
