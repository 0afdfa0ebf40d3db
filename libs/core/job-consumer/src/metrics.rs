//! Prometheus metrics for job consumers

use metrics::counter;
use metrics::histogram;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, BuildError>(handle)
    })?;
    Ok(())
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Metric recorder labelled by queue and handler
#[derive(Debug, Clone)]
pub struct ConsumerMetrics {
    queue: String,
    handler: String,
}

impl ConsumerMetrics {
    pub fn new(queue: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            handler: handler.into(),
        }
    }

    pub fn message_received(&self) {
        counter!(
            "job_consumer_messages_received_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    /// Record a successful run and its duration
    pub fn job_succeeded(&self, duration: Duration) {
        counter!(
            "job_consumer_jobs_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone(),
            "status" => "success"
        )
        .increment(1);

        histogram!(
            "job_consumer_job_duration_seconds",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn job_failed(&self, category: &str) {
        counter!(
            "job_consumer_jobs_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone(),
            "status" => "failed"
        )
        .increment(1);

        counter!(
            "job_consumer_job_errors_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone(),
            "category" => category.to_string()
        )
        .increment(1);
    }

    pub fn job_retried(&self) {
        counter!(
            "job_consumer_jobs_retried_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    pub fn message_dead_lettered(&self) {
        counter!(
            "job_consumer_dead_lettered_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    /// Record a message that was acknowledged without running the job
    pub fn job_skipped(&self, reason: &str) {
        counter!(
            "job_consumer_jobs_skipped_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    pub fn lock_contended(&self) {
        counter!(
            "job_consumer_lock_contention_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder() {
        // No recorder installed: recording is a no-op and must not panic
        let metrics = ConsumerMetrics::new("jobs", "mailer");
        metrics.message_received();
        metrics.job_succeeded(Duration::from_millis(5));
        metrics.job_failed("transient");
        metrics.job_skipped("complete");
        assert!(render_metrics().is_empty() || PROMETHEUS_HANDLE.get().is_some());
    }
}
