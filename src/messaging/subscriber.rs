use futures::StreamExt;
use lapin::{options::BasicConsumeOptions, types::FieldTable, Connection};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::channel::ChannelProvider;
use super::consumer::{ConsumeLoop, LoopExit, RequeuePolicy};
use super::delivery::InboundDelivery;
use super::handler::MessageHandler;
use super::topology::{QueueSpec, Topology, TopologyError};
use crate::codec::{BincodeCodec, Codec, JsonCodec};
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct SubscribeOptions {
    /// Prefix of the consumer tag; a random suffix keeps tags unique.
    pub consumer_tag: String,
    pub requeue_policy: RequeuePolicy,
    pub metrics: Arc<Metrics>,
}

impl SubscribeOptions {
    pub fn new(consumer_tag: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            consumer_tag: consumer_tag.into(),
            requeue_policy: RequeuePolicy::default(),
            metrics,
        }
    }

    pub fn with_requeue_policy(mut self, requeue_policy: RequeuePolicy) -> Self {
        self.requeue_policy = requeue_policy;
        self
    }
}

/// Handle to a running consume loop. Dropping it leaves the loop running;
/// call [`Subscription::shutdown`] to stop it and release its channel.
pub struct Subscription {
    queue_name: String,
    consumer_tag: String,
    shutdown: Arc<Notify>,
    handle: JoinHandle<LoopExit>,
}

impl Subscription {
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Asks the loop to stop after the delivery it is currently processing.
    pub fn cancel(&self) {
        self.shutdown.notify_one();
    }

    /// Waits for the loop to stop on its own.
    pub async fn join(self) -> Result<LoopExit, SubscribeError> {
        self.handle
            .await
            .map_err(|e| SubscribeError::Join(e.to_string()))
    }

    pub async fn shutdown(self) -> Result<LoopExit, SubscribeError> {
        self.cancel();
        self.join().await
    }
}

/// Declares and binds the queue described by `spec`, starts consuming it
/// and hands the delivery loop to its own task.
///
/// Returns once the broker has accepted the topology and the consumer;
/// every later failure is handled inside the loop and reported through
/// logs and metrics.
pub async fn subscribe<T, C, H>(
    connection: &Connection,
    topology: &Topology,
    spec: QueueSpec,
    handler: H,
    codec: C,
    options: SubscribeOptions,
) -> Result<Subscription, SubscribeError>
where
    T: DeserializeOwned + Send + 'static,
    C: Codec,
    H: MessageHandler<T> + 'static,
{
    let (channel, queue) = topology.declare_and_bind(connection, &spec).await?;
    let queue_name = queue.name().as_str().to_owned();
    let consumer_tag = format!("{}-{}", options.consumer_tag, Uuid::new_v4());

    let consumer = channel
        .basic_consume(
            &queue_name,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            error!(error = %e, queue = %queue_name, "Failed to start consumer");
            SubscribeError::ConsumeFailed(e.to_string())
        })?;

    info!(
        queue = %queue_name,
        consumer_tag = %consumer_tag,
        content_type = codec.content_type(),
        "Consumer started successfully"
    );

    let shutdown = Arc::new(Notify::new());
    let consume_loop = ConsumeLoop::<T, C, H>::new(
        queue_name.clone(),
        codec,
        handler,
        shutdown.clone(),
        options.metrics,
    )
    .with_requeue_policy(options.requeue_policy);

    let deliveries = Box::pin(consumer.map(|delivery| delivery.map(InboundDelivery::from)));
    let task_queue = queue_name.clone();
    let handle = tokio::spawn(async move {
        let exit = consume_loop.run(deliveries).await;
        match exit {
            LoopExit::Cancelled => {
                if let Err(e) = ChannelProvider::close_channel(channel).await {
                    warn!(error = %e, queue = %task_queue, "Channel did not close cleanly");
                }
            }
            LoopExit::StreamClosed | LoopExit::AckFailed => {
                warn!(queue = %task_queue, exit = ?exit, "Subscription terminated");
            }
        }
        exit
    });

    Ok(Subscription {
        queue_name,
        consumer_tag,
        shutdown,
        handle,
    })
}

/// [`subscribe`] with the JSON codec.
pub async fn subscribe_json<T, H>(
    connection: &Connection,
    topology: &Topology,
    spec: QueueSpec,
    handler: H,
    options: SubscribeOptions,
) -> Result<Subscription, SubscribeError>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T> + 'static,
{
    subscribe(connection, topology, spec, handler, JsonCodec, options).await
}

/// [`subscribe`] with the binary codec.
pub async fn subscribe_binary<T, H>(
    connection: &Connection,
    topology: &Topology,
    spec: QueueSpec,
    handler: H,
    options: SubscribeOptions,
) -> Result<Subscription, SubscribeError>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T> + 'static,
{
    subscribe(connection, topology, spec, handler, BincodeCodec, options).await
}

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("Failed to start consumer: {0}")]
    ConsumeFailed(String),

    #[error("Consume loop task failed: {0}")]
    Join(String),
}
