use lapin::{options::BasicPublishOptions, BasicProperties, Channel};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

use super::channel::{ChannelError, ChannelProvider};
use crate::codec::{BincodeCodec, Codec, EncodeError, JsonCodec};
use crate::metrics::Metrics;

/// Encodes `value` with `codec` and publishes it to `exchange` under
/// `routing_key`.
///
/// Encoding happens before any I/O, so an encode failure never reaches the
/// broker. The publish is neither mandatory nor immediate: a message that
/// matches no binding is dropped by the broker. No retry is attempted.
pub async fn publish<T, C>(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    value: &T,
    codec: &C,
) -> Result<(), PublishError>
where
    T: Serialize + ?Sized,
    C: Codec,
{
    let payload = codec.encode(value)?;

    channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            &payload,
            properties_for(codec),
        )
        .await
        .map_err(|e| PublishError::publish(exchange, routing_key, e))?
        .await
        .map_err(|e| PublishError::publish(exchange, routing_key, e))?;

    debug!(
        exchange,
        routing_key,
        content_type = codec.content_type(),
        payload_size = payload.len(),
        "Message published"
    );

    Ok(())
}

pub async fn publish_json<T: Serialize + ?Sized>(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PublishError> {
    publish(channel, exchange, routing_key, value, &JsonCodec).await
}

pub async fn publish_binary<T: Serialize + ?Sized>(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PublishError> {
    publish(channel, exchange, routing_key, value, &BincodeCodec).await
}

/// Every message gets a fresh id so consumers can count its redeliveries.
fn properties_for<C: Codec>(codec: &C) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type(codec.content_type().into())
        .with_message_id(Uuid::new_v4().to_string().into());
    match codec.content_encoding() {
        Some(encoding) => properties.with_content_encoding(encoding.into()),
        None => properties,
    }
}

/// A publishing channel shared by several tasks. Publishes are serialized
/// through a mutex so only one write is in flight on the channel at a time.
#[derive(Clone)]
pub struct Publisher {
    channel: Arc<Mutex<Channel>>,
    metrics: Arc<Metrics>,
}

impl Publisher {
    pub fn new(channel: Channel, metrics: Arc<Metrics>) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
            metrics,
        }
    }

    pub async fn publish<T, C>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
        codec: &C,
    ) -> Result<(), PublishError>
    where
        T: Serialize + ?Sized,
        C: Codec,
    {
        let result = {
            let channel = self.channel.lock().await;
            publish(&channel, exchange, routing_key, value, codec).await
        };

        match &result {
            Ok(()) => {
                self.metrics
                    .messages_published_total
                    .with_label_values(&[exchange, codec.content_type()])
                    .inc();
            }
            Err(e) => {
                error!(error = %e, exchange, routing_key, "Publish failed");
                self.metrics
                    .publish_failures_total
                    .with_label_values(&[exchange, e.stage()])
                    .inc();
            }
        }

        result
    }

    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<(), PublishError> {
        self.publish(exchange, routing_key, value, &JsonCodec).await
    }

    pub async fn publish_binary<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<(), PublishError> {
        self.publish(exchange, routing_key, value, &BincodeCodec).await
    }

    /// Closes the channel. Fails if another clone still holds it.
    pub async fn close(self) -> Result<(), ChannelError> {
        match Arc::try_unwrap(self.channel) {
            Ok(channel) => ChannelProvider::close_channel(channel.into_inner()).await,
            Err(_) => Err(ChannelError::CloseFailed(
                "publisher channel is still shared".to_string(),
            )),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("Failed to publish to {exchange} with key {routing_key}: {reason}")]
    Publish {
        exchange: String,
        routing_key: String,
        reason: String,
    },
}

impl PublishError {
    fn publish(exchange: &str, routing_key: &str, err: lapin::Error) -> Self {
        Self::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            reason: err.to_string(),
        }
    }

    /// Metric label for where the publish failed.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Encode(_) => "encode",
            Self::Publish { .. } => "network",
        }
    }
}
