use prometheus::{
    CounterVec, Gauge, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
};
use std::sync::Arc;

pub mod server;

pub struct Metrics {
    pub deliveries_settled_total: IntCounterVec,
    pub decode_failures_total: IntCounterVec,
    pub handler_panics_total: IntCounterVec,
    pub requeue_limit_exceeded_total: IntCounterVec,
    pub ack_failures_total: IntCounterVec,
    pub message_processing_duration_seconds: HistogramVec,
    pub messages_published_total: CounterVec,
    pub publish_failures_total: CounterVec,
    pub active_subscriptions: Gauge,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let deliveries_settled_total = IntCounterVec::new(
            Opts::new(
                "pubsub_deliveries_settled_total",
                "Deliveries acknowledged with the broker, by decision",
            ),
            &["queue", "decision"],
        )?;

        let decode_failures_total = IntCounterVec::new(
            Opts::new(
                "pubsub_decode_failures_total",
                "Deliveries discarded because the payload could not be decoded",
            ),
            &["queue"],
        )?;

        let handler_panics_total = IntCounterVec::new(
            Opts::new(
                "pubsub_handler_panics_total",
                "Handler panics converted into discards",
            ),
            &["queue"],
        )?;

        let requeue_limit_exceeded_total = IntCounterVec::new(
            Opts::new(
                "pubsub_requeue_limit_exceeded_total",
                "Requeue requests downgraded to discards by the requeue policy",
            ),
            &["queue"],
        )?;

        let ack_failures_total = IntCounterVec::new(
            Opts::new(
                "pubsub_ack_failures_total",
                "Acknowledgments that could not be delivered to the broker",
            ),
            &["queue"],
        )?;

        let message_processing_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pubsub_message_processing_duration_seconds",
                "Time from receipt to acknowledgment of a delivery",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["queue", "decision"],
        )?;

        let messages_published_total = CounterVec::new(
            Opts::new(
                "pubsub_messages_published_total",
                "Messages handed to the broker",
            ),
            &["exchange", "content_type"],
        )?;

        let publish_failures_total = CounterVec::new(
            Opts::new(
                "pubsub_publish_failures_total",
                "Publish attempts that failed before or during the network write",
            ),
            &["exchange", "stage"],
        )?;

        let active_subscriptions = Gauge::new(
            "pubsub_active_subscriptions",
            "Number of running consume loops",
        )?;

        registry.register(Box::new(deliveries_settled_total.clone()))?;
        registry.register(Box::new(decode_failures_total.clone()))?;
        registry.register(Box::new(handler_panics_total.clone()))?;
        registry.register(Box::new(requeue_limit_exceeded_total.clone()))?;
        registry.register(Box::new(ack_failures_total.clone()))?;
        registry.register(Box::new(message_processing_duration_seconds.clone()))?;
        registry.register(Box::new(messages_published_total.clone()))?;
        registry.register(Box::new(publish_failures_total.clone()))?;
        registry.register(Box::new(active_subscriptions.clone()))?;

        Ok(Arc::new(Self {
            deliveries_settled_total,
            decode_failures_total,
            handler_panics_total,
            requeue_limit_exceeded_total,
            ack_failures_total,
            message_processing_duration_seconds,
            messages_published_total,
            publish_failures_total,
            active_subscriptions,
            registry,
        }))
    }
}
