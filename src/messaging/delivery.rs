use async_trait::async_trait;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    types::{AMQPValue, FieldTable},
};

use crate::contracts::AckType;

/// Broker-maintained redelivery counter (quorum queues).
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AckError>;

    async fn nack(&self, requeue: bool) -> Result<(), AckError>;
}

#[async_trait]
impl Acknowledger for Acker {
    async fn ack(&self) -> Result<(), AckError> {
        Acker::ack(self, BasicAckOptions::default())
            .await
            .map_err(|e| AckError(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), AckError> {
        Acker::nack(
            self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map_err(|e| AckError(e.to_string()))
    }
}

/// A received message together with its single-use acknowledgment handle.
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    /// How many times the broker has handed this message out before.
    pub delivery_count: u32,
    /// Publisher-assigned id, used to count redeliveries the broker does not.
    pub message_id: Option<String>,
    pub data: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl InboundDelivery {
    pub fn new(
        delivery_tag: u64,
        routing_key: impl Into<String>,
        redelivered: bool,
        delivery_count: u32,
        data: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            routing_key: routing_key.into(),
            redelivered,
            delivery_count,
            message_id: None,
            data,
            acker,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Applies `decision` to the broker. Consumes the delivery so it cannot
    /// be settled twice.
    pub async fn settle(self, decision: AckType) -> Result<(), AckError> {
        if decision.is_ack() {
            self.acker.ack().await
        } else {
            self.acker.nack(decision.requeue()).await
        }
    }
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        let delivery_count = delivery_count(delivery.properties.headers(), delivery.redelivered);
        let message_id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_owned());
        Self {
            delivery_tag: delivery.delivery_tag,
            routing_key: delivery.routing_key.as_str().to_owned(),
            redelivered: delivery.redelivered,
            delivery_count,
            message_id,
            data: delivery.data,
            acker: Box::new(delivery.acker),
        }
    }
}

impl std::fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("delivery_count", &self.delivery_count)
            .field("message_id", &self.message_id)
            .field("payload_size", &self.data.len())
            .finish()
    }
}

/// Classic queues only expose the `redelivered` flag, which counts as one
/// prior delivery when the header is absent.
fn delivery_count(headers: &Option<FieldTable>, redelivered: bool) -> u32 {
    let from_header = headers
        .as_ref()
        .and_then(|headers| headers.inner().get(DELIVERY_COUNT_HEADER))
        .and_then(|value| match value {
            AMQPValue::LongUInt(count) => Some(*count),
            AMQPValue::LongInt(count) => u32::try_from(*count).ok(),
            AMQPValue::LongLongInt(count) => u32::try_from(*count).ok(),
            AMQPValue::ShortUInt(count) => Some(u32::from(*count)),
            AMQPValue::ShortShortUInt(count) => Some(u32::from(*count)),
            _ => None,
        });

    from_header.unwrap_or(u32::from(redelivered))
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to acknowledge delivery: {0}")]
pub struct AckError(pub String);
