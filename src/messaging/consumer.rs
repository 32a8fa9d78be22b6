use futures::{FutureExt, Stream, StreamExt};
use std::any::Any;
use std::fmt::Display;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::delivery::{AckError, InboundDelivery};
use super::handler::MessageHandler;
use super::redelivery::RedeliveryTracker;
use crate::codec::Codec;
use crate::contracts::AckType;
use crate::metrics::Metrics;

/// How many times a message may be requeued before it is discarded instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequeuePolicy {
    /// Requeue as often as the handler asks; any limit is left to the broker.
    #[default]
    Unbounded,
    /// Discard once the message has already been delivered this many times.
    Limited(u32),
}

impl RequeuePolicy {
    pub fn resolve(self, decision: AckType, delivery_count: u32) -> AckType {
        match (self, decision) {
            (Self::Limited(limit), AckType::NackRequeue) if delivery_count >= limit => {
                AckType::NackDiscard
            }
            _ => decision,
        }
    }
}

/// Why a consume loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Cancelled,
    StreamClosed,
    AckFailed,
}

/// Drives one subscription: decode, handle, settle, one delivery at a time.
pub struct ConsumeLoop<T, C, H> {
    queue_name: String,
    codec: C,
    handler: H,
    shutdown: Arc<Notify>,
    metrics: Arc<Metrics>,
    requeue_policy: RequeuePolicy,
    redeliveries: Mutex<RedeliveryTracker>,
    _message: PhantomData<fn() -> T>,
}

impl<T, C, H> ConsumeLoop<T, C, H>
where
    T: serde::de::DeserializeOwned + Send + 'static,
    C: Codec,
    H: MessageHandler<T>,
{
    pub fn new(
        queue_name: String,
        codec: C,
        handler: H,
        shutdown: Arc<Notify>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            queue_name,
            codec,
            handler,
            shutdown,
            metrics,
            requeue_policy: RequeuePolicy::default(),
            redeliveries: Mutex::new(RedeliveryTracker::default()),
            _message: PhantomData,
        }
    }

    pub fn with_requeue_policy(mut self, requeue_policy: RequeuePolicy) -> Self {
        self.requeue_policy = requeue_policy;
        self
    }

    /// Runs until `shutdown` is notified, the stream ends, or the broker
    /// refuses an acknowledgment. Errors reported by the stream itself are
    /// logged and skipped.
    pub async fn run<S, E>(self, mut deliveries: S) -> LoopExit
    where
        S: Stream<Item = Result<InboundDelivery, E>> + Unpin,
        E: Display,
    {
        info!(queue = %self.queue_name, "Consume loop started");
        self.metrics.active_subscriptions.inc();

        let exit = loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(queue = %self.queue_name, "Shutdown signal received, stopping consume loop");
                    break LoopExit::Cancelled;
                }

                delivery = deliveries.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            if let Err(e) = self.process_delivery(delivery).await {
                                error!(
                                    queue = %self.queue_name,
                                    error = %e,
                                    "Acknowledgment failed, channel is unusable"
                                );
                                break LoopExit::AckFailed;
                            }
                        }
                        Some(Err(e)) => {
                            error!(queue = %self.queue_name, error = %e, "Error receiving message from RabbitMQ");
                        }
                        None => {
                            warn!(queue = %self.queue_name, "Delivery stream ended");
                            break LoopExit::StreamClosed;
                        }
                    }
                }
            }
        };

        self.metrics.active_subscriptions.dec();
        info!(queue = %self.queue_name, exit = ?exit, "Consume loop stopped");
        exit
    }

    async fn process_delivery(&self, delivery: InboundDelivery) -> Result<AckType, AckError> {
        let start = Instant::now();
        let delivery_tag = delivery.delivery_tag;
        let message_id = delivery.message_id.clone();

        debug!(
            queue = %self.queue_name,
            delivery_tag,
            routing_key = %delivery.routing_key,
            redelivered = delivery.redelivered,
            delivery_count = delivery.delivery_count,
            message_id = ?message_id,
            payload_size = delivery.data.len(),
            "Processing message"
        );

        let decision = self.decide(&delivery).await;

        if let Err(e) = delivery.settle(decision).await {
            self.metrics
                .ack_failures_total
                .with_label_values(&[&self.queue_name])
                .inc();
            return Err(e);
        }
        if let Some(message_id) = &message_id {
            self.track(message_id, decision);
        }

        self.metrics
            .deliveries_settled_total
            .with_label_values(&[&self.queue_name, decision.as_str()])
            .inc();
        self.metrics
            .message_processing_duration_seconds
            .with_label_values(&[&self.queue_name, decision.as_str()])
            .observe(start.elapsed().as_secs_f64());

        debug!(queue = %self.queue_name, delivery_tag, decision = %decision, "Delivery settled");
        Ok(decision)
    }

    async fn decide(&self, delivery: &InboundDelivery) -> AckType {
        let message = match self.codec.decode::<T>(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    queue = %self.queue_name,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Undecodable payload, discarding"
                );
                self.metrics
                    .decode_failures_total
                    .with_label_values(&[&self.queue_name])
                    .inc();
                return AckType::NackDiscard;
            }
        };

        let decision = match AssertUnwindSafe(self.handler.handle(message))
            .catch_unwind()
            .await
        {
            Ok(decision) => decision,
            Err(panic) => {
                error!(
                    queue = %self.queue_name,
                    delivery_tag = delivery.delivery_tag,
                    panic = panic_message(&*panic),
                    "Handler panicked, discarding message"
                );
                self.metrics
                    .handler_panics_total
                    .with_label_values(&[&self.queue_name])
                    .inc();
                return AckType::NackDiscard;
            }
        };

        let delivery_count = self.prior_deliveries(delivery);
        let resolved = self.requeue_policy.resolve(decision, delivery_count);
        if resolved != decision {
            warn!(
                queue = %self.queue_name,
                delivery_tag = delivery.delivery_tag,
                delivery_count,
                policy = ?self.requeue_policy,
                "Requeue limit reached, discarding message"
            );
            self.metrics
                .requeue_limit_exceeded_total
                .with_label_values(&[&self.queue_name])
                .inc();
        }
        resolved
    }

    /// The broker's count, raised to the requeues this loop issued itself.
    fn prior_deliveries(&self, delivery: &InboundDelivery) -> u32 {
        let tracked = match (&self.requeue_policy, &delivery.message_id) {
            (RequeuePolicy::Limited(_), Some(message_id)) => {
                self.redeliveries().requeues(message_id)
            }
            _ => 0,
        };
        delivery.delivery_count.max(tracked)
    }

    fn track(&self, message_id: &str, decision: AckType) {
        if self.requeue_policy == RequeuePolicy::Unbounded {
            return;
        }
        let mut redeliveries = self.redeliveries();
        if decision.requeue() {
            redeliveries.record_requeue(message_id);
        } else {
            redeliveries.forget(message_id);
        }
    }

    fn redeliveries(&self) -> std::sync::MutexGuard<'_, RedeliveryTracker> {
        self.redeliveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BincodeCodec, JsonCodec};
    use crate::contracts::PlayingState;
    use crate::messaging::delivery::Acknowledger;
    use async_trait::async_trait;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct AckLog {
        settled: Mutex<Vec<(u64, AckType)>>,
    }

    impl AckLog {
        fn settled(&self) -> Vec<(u64, AckType)> {
            self.settled.lock().unwrap().clone()
        }
    }

    struct RecordingAcker {
        delivery_tag: u64,
        log: Arc<AckLog>,
        fail: bool,
    }

    #[async_trait]
    impl Acknowledger for RecordingAcker {
        async fn ack(&self) -> Result<(), AckError> {
            self.record(AckType::Ack)
        }

        async fn nack(&self, requeue: bool) -> Result<(), AckError> {
            if requeue {
                self.record(AckType::NackRequeue)
            } else {
                self.record(AckType::NackDiscard)
            }
        }
    }

    impl RecordingAcker {
        fn record(&self, decision: AckType) -> Result<(), AckError> {
            if self.fail {
                return Err(AckError("channel closed".to_string()));
            }
            self.log
                .settled
                .lock()
                .unwrap()
                .push((self.delivery_tag, decision));
            Ok(())
        }
    }

    fn delivery(log: &Arc<AckLog>, delivery_tag: u64, data: Vec<u8>) -> InboundDelivery {
        delivery_with(log, delivery_tag, data, 0, false)
    }

    fn delivery_with(
        log: &Arc<AckLog>,
        delivery_tag: u64,
        data: Vec<u8>,
        delivery_count: u32,
        fail: bool,
    ) -> InboundDelivery {
        InboundDelivery::new(
            delivery_tag,
            "pause.alice",
            delivery_count > 0,
            delivery_count,
            data,
            Box::new(RecordingAcker {
                delivery_tag,
                log: log.clone(),
                fail,
            }),
        )
    }

    fn paused(is_paused: bool) -> Vec<u8> {
        serde_json::to_vec(&PlayingState { is_paused }).unwrap()
    }

    fn stream_of(
        deliveries: Vec<InboundDelivery>,
    ) -> impl Stream<Item = Result<InboundDelivery, Infallible>> + Unpin {
        futures::stream::iter(deliveries.into_iter().map(Ok))
    }

    fn pause_loop<H: MessageHandler<PlayingState>>(
        handler: H,
    ) -> (ConsumeLoop<PlayingState, JsonCodec, H>, Arc<Metrics>) {
        let metrics = Metrics::new().unwrap();
        let consume_loop = ConsumeLoop::<PlayingState, _, _>::new(
            "pause.alice".to_string(),
            JsonCodec,
            handler,
            Arc::new(Notify::new()),
            metrics.clone(),
        );
        (consume_loop, metrics)
    }

    #[tokio::test]
    async fn test_ack_applied_once() {
        let log = Arc::new(AckLog::default());
        let (consume_loop, metrics) = pause_loop(|_: PlayingState| AckType::Ack);

        let exit = consume_loop
            .run(stream_of(vec![delivery(&log, 1, paused(true))]))
            .await;

        assert_eq!(exit, LoopExit::StreamClosed);
        assert_eq!(log.settled(), vec![(1, AckType::Ack)]);
        assert_eq!(
            metrics
                .deliveries_settled_total
                .with_label_values(&["pause.alice", "ack"])
                .get(),
            1
        );
        assert_eq!(metrics.active_subscriptions.get(), 0.0);
    }

    #[tokio::test]
    async fn test_nack_requeue_applied_once() {
        let log = Arc::new(AckLog::default());
        let (consume_loop, _) = pause_loop(|_: PlayingState| AckType::NackRequeue);

        consume_loop
            .run(stream_of(vec![delivery(&log, 1, paused(false))]))
            .await;

        assert_eq!(log.settled(), vec![(1, AckType::NackRequeue)]);
    }

    #[tokio::test]
    async fn test_decoded_value_reaches_handler() {
        let log = Arc::new(AckLog::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_handler = seen.clone();
        let (consume_loop, _) = pause_loop(move |state: PlayingState| {
            seen_by_handler.lock().unwrap().push(state);
            AckType::Ack
        });

        consume_loop
            .run(stream_of(vec![
                delivery(&log, 1, br#"{"isPaused":true}"#.to_vec()),
                delivery(&log, 2, br#"{"isPaused":false}"#.to_vec()),
            ]))
            .await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                PlayingState { is_paused: true },
                PlayingState { is_paused: false }
            ]
        );
        assert_eq!(log.settled(), vec![(1, AckType::Ack), (2, AckType::Ack)]);
    }

    #[tokio::test]
    async fn test_undecodable_payload_discarded_without_handler() {
        let log = Arc::new(AckLog::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = calls.clone();
        let (consume_loop, metrics) = pause_loop(move |_: PlayingState| {
            handler_calls.fetch_add(1, Ordering::SeqCst);
            AckType::Ack
        });

        consume_loop
            .run(stream_of(vec![
                delivery(&log, 1, b"{not json".to_vec()),
                delivery(&log, 2, paused(true)),
            ]))
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            log.settled(),
            vec![(1, AckType::NackDiscard), (2, AckType::Ack)]
        );
        assert_eq!(
            metrics
                .decode_failures_total
                .with_label_values(&["pause.alice"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_binary_codec_mismatch_discarded() {
        let log = Arc::new(AckLog::default());
        let consume_loop = ConsumeLoop::<PlayingState, _, _>::new(
            "game_logs".to_string(),
            BincodeCodec,
            |_: PlayingState| AckType::Ack,
            Arc::new(Notify::new()),
            Metrics::new().unwrap(),
        );

        consume_loop
            .run(stream_of(vec![delivery(&log, 9, paused(true))]))
            .await;

        assert_eq!(log.settled(), vec![(9, AckType::NackDiscard)]);
    }

    #[tokio::test]
    async fn test_every_discard_is_settled() {
        let log = Arc::new(AckLog::default());
        let (consume_loop, _) = pause_loop(|_: PlayingState| AckType::NackDiscard);

        let deliveries = (1..=25).map(|tag| delivery(&log, tag, paused(true))).collect();
        consume_loop.run(stream_of(deliveries)).await;

        let settled = log.settled();
        assert_eq!(settled.len(), 25);
        assert!(settled.iter().all(|(_, d)| *d == AckType::NackDiscard));
        let tags: Vec<u64> = settled.iter().map(|(tag, _)| *tag).collect();
        assert_eq!(tags, (1..=25).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_handler_panic_discards_and_continues() {
        let log = Arc::new(AckLog::default());
        let (consume_loop, metrics) = pause_loop(|state: PlayingState| {
            if state.is_paused {
                panic!("pause handler exploded");
            }
            AckType::Ack
        });

        let exit = consume_loop
            .run(stream_of(vec![
                delivery(&log, 1, paused(true)),
                delivery(&log, 2, paused(false)),
            ]))
            .await;

        assert_eq!(exit, LoopExit::StreamClosed);
        assert_eq!(
            log.settled(),
            vec![(1, AckType::NackDiscard), (2, AckType::Ack)]
        );
        assert_eq!(
            metrics
                .handler_panics_total
                .with_label_values(&["pause.alice"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_ack_failure_stops_loop() {
        let log = Arc::new(AckLog::default());
        let (consume_loop, metrics) = pause_loop(|_: PlayingState| AckType::Ack);

        let exit = consume_loop
            .run(stream_of(vec![
                delivery_with(&log, 1, paused(true), 0, true),
                delivery(&log, 2, paused(true)),
            ]))
            .await;

        assert_eq!(exit, LoopExit::AckFailed);
        assert!(log.settled().is_empty());
        assert_eq!(
            metrics
                .ack_failures_total
                .with_label_values(&["pause.alice"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_stream_errors_are_skipped() {
        let log = Arc::new(AckLog::default());
        let (consume_loop, _) = pause_loop(|_: PlayingState| AckType::Ack);

        let items: Vec<Result<InboundDelivery, String>> = vec![
            Err("frame error".to_string()),
            Ok(delivery(&log, 1, paused(true))),
        ];
        let exit = consume_loop.run(futures::stream::iter(items)).await;

        assert_eq!(exit, LoopExit::StreamClosed);
        assert_eq!(log.settled(), vec![(1, AckType::Ack)]);
    }

    #[tokio::test]
    async fn test_requeue_limit_downgrades_to_discard() {
        let log = Arc::new(AckLog::default());
        let (consume_loop, metrics) = pause_loop(|_: PlayingState| AckType::NackRequeue);
        let consume_loop = consume_loop.with_requeue_policy(RequeuePolicy::Limited(3));

        consume_loop
            .run(stream_of(vec![
                delivery_with(&log, 1, paused(true), 2, false),
                delivery_with(&log, 2, paused(true), 3, false),
            ]))
            .await;

        assert_eq!(
            log.settled(),
            vec![(1, AckType::NackRequeue), (2, AckType::NackDiscard)]
        );
        assert_eq!(
            metrics
                .requeue_limit_exceeded_total
                .with_label_values(&["pause.alice"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_requeue_limit_counts_redeliveries_without_header() {
        let log = Arc::new(AckLog::default());
        let (consume_loop, metrics) = pause_loop(|_: PlayingState| AckType::NackRequeue);
        let consume_loop = consume_loop.with_requeue_policy(RequeuePolicy::Limited(3));

        // a classic queue: only the first copy lacks `redelivered`, no header ever
        let deliveries = (1..=5)
            .map(|tag| delivery_with(&log, tag, paused(true), u32::from(tag > 1), false))
            .map(|delivery| delivery.with_message_id("move-1"))
            .collect();
        consume_loop.run(stream_of(deliveries)).await;

        assert_eq!(
            log.settled(),
            vec![
                (1, AckType::NackRequeue),
                (2, AckType::NackRequeue),
                (3, AckType::NackRequeue),
                (4, AckType::NackDiscard),
                (5, AckType::NackRequeue),
            ]
        );
        assert_eq!(
            metrics
                .requeue_limit_exceeded_total
                .with_label_values(&["pause.alice"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_redeliveries_tracked_per_message() {
        let log = Arc::new(AckLog::default());
        let (consume_loop, _) = pause_loop(|_: PlayingState| AckType::NackRequeue);
        let consume_loop = consume_loop.with_requeue_policy(RequeuePolicy::Limited(1));

        consume_loop
            .run(stream_of(vec![
                delivery_with(&log, 1, paused(true), 0, false).with_message_id("a"),
                delivery_with(&log, 2, paused(true), 0, false).with_message_id("b"),
                delivery_with(&log, 3, paused(true), 1, false).with_message_id("a"),
                delivery_with(&log, 4, paused(true), 0, false),
                delivery_with(&log, 5, paused(true), 0, false),
            ]))
            .await;

        assert_eq!(
            log.settled(),
            vec![
                (1, AckType::NackRequeue),
                (2, AckType::NackRequeue),
                (3, AckType::NackDiscard),
                (4, AckType::NackRequeue),
                (5, AckType::NackRequeue),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_idle_loop() {
        let metrics = Metrics::new().unwrap();
        let shutdown = Arc::new(Notify::new());
        let consume_loop = ConsumeLoop::<PlayingState, _, _>::new(
            "pause.alice".to_string(),
            JsonCodec,
            |_: PlayingState| AckType::Ack,
            shutdown.clone(),
            metrics.clone(),
        );

        let idle = futures::stream::pending::<Result<InboundDelivery, Infallible>>();
        let handle = tokio::spawn(consume_loop.run(idle));

        shutdown.notify_one();
        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(exit, LoopExit::Cancelled);
        assert_eq!(metrics.active_subscriptions.get(), 0.0);
    }

    #[test]
    fn test_requeue_policy() {
        assert_eq!(
            RequeuePolicy::Unbounded.resolve(AckType::NackRequeue, 1_000),
            AckType::NackRequeue
        );
        assert_eq!(
            RequeuePolicy::Limited(0).resolve(AckType::NackRequeue, 0),
            AckType::NackDiscard
        );
        assert_eq!(
            RequeuePolicy::Limited(2).resolve(AckType::NackRequeue, 1),
            AckType::NackRequeue
        );
        assert_eq!(
            RequeuePolicy::Limited(2).resolve(AckType::Ack, 10),
            AckType::Ack
        );
    }
}
