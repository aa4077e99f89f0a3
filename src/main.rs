use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use courier::amqp::AmqpBroker;
use courier::circuit_breaker::CircuitBreaker;
use courier::config::{ProviderKind, Settings};
use courier::consumer::Consumer;
use courier::dlq::DlqPublisher;
use courier::handler::MessageHandler;
use courier::idempotency::IdempotencyStore;
use courier::kv::{KeyValue, RedisKv};
use courier::metrics::Metrics;
use courier::provider::{EmailProvider, HttpProvider, LogProvider};
use courier::rate_limit::RateLimiter;
use courier::sender::EmailSender;
use courier::worker_pool::WorkerPool;
use courier::{telemetry, WorkerError};

/// Upper bound on drain after the subscriptions stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_subscriber(telemetry::get_subscriber("info", std::io::stdout));

    let settings = Settings::load().context("failed to load configuration")?;
    let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);

    let kv: Arc<dyn KeyValue> = Arc::new(
        RedisKv::connect(&settings.redis_url())
            .await
            .context("failed to connect to redis")?,
    );
    kv.ping().await.context("redis did not answer ping")?;

    let broker = AmqpBroker::connect(&settings.rabbitmq_url, settings.prefetch_count)
        .await
        .context("failed to connect to broker")?;
    broker.declare_topology(&settings).await.context("failed to declare topology")?;

    let dlq = Arc::new(broker.dlq_publisher(&settings));
    dlq.declare().await.context("failed to declare dead-letter queue")?;

    let provider: Arc<dyn EmailProvider> = match settings.email_provider {
        ProviderKind::Log => Arc::new(LogProvider),
        ProviderKind::Http => {
            anyhow::ensure!(
                !settings.email_api_base_url.is_empty(),
                "EMAIL_API_BASE_URL is required for the http provider"
            );
            Arc::new(
                HttpProvider::new(
                    settings.email_api_base_url.clone(),
                    settings.email_api_token.clone(),
                )
                .context("failed to build http provider")?,
            )
        }
    };

    let sender = EmailSender::new(
        provider,
        CircuitBreaker::new(settings.breaker_config()),
        settings.email_from.clone(),
        settings.email_from_name.clone(),
    );
    tracing::info!(health = ?sender.health(), "email sender ready");

    let handler = MessageHandler::new(sender, RateLimiter::new(kv.clone()), metrics.clone());
    let shutdown = CancellationToken::new();
    let consumer = Consumer::new(
        handler,
        IdempotencyStore::new(kv),
        dlq,
        Arc::new(WorkerPool::new(settings.worker_pool_size)),
        settings.retry_config(),
        metrics,
        shutdown.clone(),
    );

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        signal_token.cancel();
    });

    tracing::info!(
        exchange = %settings.rabbitmq_exchange,
        verification_queue = %settings.rabbitmq_queue_verification,
        reset_queue = %settings.rabbitmq_queue_reset,
        pool_size = settings.worker_pool_size,
        prefetch = settings.prefetch_count,
        "consumer starting"
    );
    broker
        .run(consumer.clone(), &settings, shutdown)
        .await
        .context("consumer terminated with broker error")?;

    tracing::info!("subscriptions stopped, draining worker pool");
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, consumer.drain()).await.is_err() {
        tracing::error!(timeout = ?SHUTDOWN_TIMEOUT, "drain exceeded shutdown budget");
        return Err(WorkerError::Internal("shutdown drain timed out".into()).into());
    }
    tracing::info!("drained cleanly, goodbye");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
