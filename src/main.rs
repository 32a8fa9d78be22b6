use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use peril_pubsub::config::Config;
use peril_pubsub::contracts::{routing, AckType, GameLog};
use peril_pubsub::messaging::{
    subscribe_binary, BrokerConnection, HandlerError, MessageHandler, QueueDurability, QueueSpec,
    SubscribeOptions, Topology,
};
use peril_pubsub::metrics::{server::start_metrics_server, Metrics};

/// Appends every game log it receives to a file. A failed write is retried
/// by requeueing the message.
struct GameLogWriter {
    path: PathBuf,
}

#[async_trait]
impl MessageHandler<GameLog> for GameLogWriter {
    async fn handle(&self, log: GameLog) -> AckType {
        info!(username = %log.username, "Received game log");
        self.append(&log).await.into()
    }
}

impl GameLogWriter {
    async fn append(&self, log: &GameLog) -> Result<(), HandlerError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| HandlerError::Transient(format!("open {}: {}", self.path.display(), e)))?;

        file.write_all(format!("{}\n", log).as_bytes())
            .await
            .map_err(|e| HandlerError::Transient(format!("write {}: {}", self.path.display(), e)))?;

        Ok(())
    }
}

#[tokio::main]
async fn main() {
    setup_panic_handler();
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    setup_logging(&config.rust_log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service_name = %config.service_name,
        "Peril server starting"
    );

    let broker = match BrokerConnection::connect(&config.rabbitmq_url, &config.service_name).await
    {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("Failed to connect to RabbitMQ: {}", e);
            std::process::exit(1);
        }
    };

    let metrics = match Metrics::new() {
        Ok(metrics) => metrics,
        Err(e) => {
            eprintln!("Failed to create metrics: {}", e);
            std::process::exit(1);
        }
    };

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_clone, metrics_port).await {
            error!(error = %e, "Metrics server error");
        }
    });

    let topology =
        Topology::new(config.dead_letter_exchange.clone()).with_prefetch_count(config.prefetch_count);

    let spec = QueueSpec::new(
        routing::EXCHANGE_PERIL_TOPIC,
        routing::GAME_LOG_SLUG,
        routing::any_participant(routing::GAME_LOG_SLUG),
        QueueDurability::Durable,
    );

    let options = SubscribeOptions::new(format!("{}-game-logs", config.service_name), metrics)
        .with_requeue_policy(config.requeue_policy);

    let writer = GameLogWriter {
        path: PathBuf::from(&config.game_log_path),
    };

    let subscription = match subscribe_binary::<GameLog, _>(
        broker.get_connection(),
        &topology,
        spec,
        writer,
        options,
    )
    .await
    {
        Ok(subscription) => subscription,
        Err(e) => {
            eprintln!("Failed to subscribe to game logs: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        queue = subscription.queue_name(),
        game_log_path = %config.game_log_path,
        "Ready to record game logs"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    warn!("Shutdown signal received, cleaning up...");

    match tokio::time::timeout(std::time::Duration::from_secs(5), subscription.shutdown()).await {
        Ok(Ok(exit)) => info!(exit = ?exit, "Subscription stopped"),
        Ok(Err(e)) => warn!(error = %e, "Subscription task failed"),
        Err(_) => warn!("Subscription shutdown timeout"),
    }

    if !broker.is_connected() {
        warn!("Broker connection already lost, skipping close");
    } else if let Err(e) = broker.shutdown().await {
        eprintln!("Error during shutdown: {}", e);
    }

    info!("Peril server stopped");
}

fn setup_logging(rust_log: &str) {
    let log_level = match rust_log.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        eprintln!("PANIC: {} at {}", message, location);
        eprintln!("Thread: {:?}", std::thread::current().name());
    }));
}
