//! Notification Worker
//!
//! A background worker that delivers notification jobs from a RabbitMQ queue.
//!
//! ## Architecture
//!
//! ```text
//! RabbitMQ queue (JOB_QUEUE)
//!   ↓ (prefetch JOB_PREFETCH)
//! JobConsumer<NotifyHandler, IdempotencyGuard>
//!   ↓ status / retry / lock records
//! Redis (REDIS_HOST)
//!   ↓ exhausted or unparseable jobs
//! Failed exchange (JOB_FAILED_EXCHANGE / JOB_FAILED_ROUTING_KEY)
//! ```
//!
//! ## Features
//!
//! - Each job id runs at most once per worker id, across replicas
//! - Transient failures retried through the delayed exchange, or requeued
//! - Graceful shutdown on SIGINT / SIGTERM

use async_trait::async_trait;
use core_config::amqp::AmqpConfig;
use core_config::redis::RedisConfig;
use core_config::tracing::LogSettings;
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use job_consumer::{
    AmqpBroker, ConsumerConfig, IdempotencyConfig, IdempotencyGuard, JobConsumer, JobContext,
    JobError, JobHandler, ProcessedStatus, RedisStore, metrics,
};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Delivers one notification per job
///
/// Expects `data.channel` (`"email"` or `"sms"`), `data.to` and `data.body`.
pub struct NotifyHandler;

#[async_trait]
impl JobHandler for NotifyHandler {
    fn name(&self) -> &'static str {
        "notify"
    }

    async fn run(&self, ctx: &mut JobContext<'_>) -> Result<(), JobError> {
        let data = ctx.envelope().data_fields();
        let channel = data.str(&["channel"])?.to_string();
        let to = data.str(&["to"])?.to_string();
        let body_len = data.str(&["body"])?.len();

        match channel.as_str() {
            "email" | "sms" => {}
            other => {
                return Err(JobError::permanent(format!(
                    "unsupported notification channel '{other}'"
                )));
            }
        }

        info!(
            job_id = %ctx.job_id().map(ToString::to_string).unwrap_or_default(),
            channel = %channel,
            to = %to,
            length = body_len,
            "Notification delivered"
        );

        ctx.set_response(json!({ "channel": channel, "to": to }));
        Ok(())
    }
}

/// Run the notification worker
///
/// This is the main entry point for the worker. It:
/// 1. Sets up structured logging (JSON for prod, pretty for dev, `LOG_FORMAT` overrides)
/// 2. Loads consumer, idempotency, AMQP and Redis configuration
/// 3. Connects to Redis and RabbitMQ
/// 4. Consumes until the processed limit or a shutdown signal
///
/// # Errors
///
/// Returns an error if configuration is invalid, a connection fails, or the
/// consumer hits a store or broker failure.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();

    let environment = Environment::from_env();
    let log_settings = LogSettings::from_env(&environment)
        .wrap_err("Failed to load logging configuration")?;
    core_config::tracing::init_tracing(&log_settings);

    metrics::init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting notification worker"
    );
    info!("Environment: {:?}", environment);

    let consumer_config =
        ConsumerConfig::from_env().wrap_err("Failed to load consumer configuration")?;
    let idempotency_config =
        IdempotencyConfig::from_env().wrap_err("Failed to load idempotency configuration")?;
    let amqp_config = AmqpConfig::from_env().wrap_err("Failed to load AMQP configuration")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

    info!(
        queue = %consumer_config.queue,
        consumer_id = %consumer_config.consumer_id,
        prefetch = consumer_config.prefetch,
        worker_id = %idempotency_config.worker_id,
        retry_limit = idempotency_config.retry_limit,
        "Worker configuration loaded"
    );

    info!("Connecting to Redis...");
    let store = RedisStore::connect(&redis_config.uri)
        .await
        .wrap_err("Failed to connect to Redis")?;

    info!("Connecting to RabbitMQ...");
    let broker = AmqpBroker::connect(&amqp_config)
        .await
        .wrap_err("Failed to connect to RabbitMQ")?;
    broker
        .declare_queue(&consumer_config.queue)
        .await
        .wrap_err("Failed to declare job queue")?;

    let guard = IdempotencyGuard::new(Arc::new(store), idempotency_config);
    let mut consumer = JobConsumer::new(Arc::new(broker), NotifyHandler, consumer_config)
        .with_guard(guard)
        .on_processed(|message| {
            if message.status == ProcessedStatus::Failed {
                warn!(
                    job_id = ?message.job_id,
                    processed = message.processed_count,
                    "Notification job failed"
                );
            }
        });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    consumer
        .start()
        .await
        .wrap_err("Failed to start consuming")?;

    let processed = consumer
        .run(shutdown_rx)
        .await
        .wrap_err("Job consumer failed")?;

    debug!(metrics = %metrics::render_metrics(), "Final metrics snapshot");
    info!(processed, "Notification worker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
