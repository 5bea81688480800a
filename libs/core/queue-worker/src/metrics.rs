//! Prometheus metrics for workers and publishers

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{error, info};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder
///
/// Subsequent calls return the existing handle. Returns `None` when another
/// recorder is already installed.
pub fn init_metrics() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE
        .get_or_try_init(|| {
            let handle = PrometheusBuilder::new().install_recorder()?;
            info!("Prometheus metrics initialized");
            Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
        })
        .map_err(|e| error!(error = %e, "Failed to install Prometheus recorder"))
        .ok()
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Worker metrics helper
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    worker: String,
    destination: String,
}

impl WorkerMetrics {
    pub fn new(worker: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            destination: destination.into(),
        }
    }

    pub fn message_received(&self) {
        counter!(
            "queue_worker_messages_received_total",
            "worker" => self.worker.clone(),
            "destination" => self.destination.clone()
        )
        .increment(1);
    }

    pub fn message_processed(&self, duration: Duration) {
        counter!(
            "queue_worker_messages_processed_total",
            "worker" => self.worker.clone(),
            "destination" => self.destination.clone(),
            "status" => "success"
        )
        .increment(1);

        self.record_duration(duration);
    }

    pub fn message_failed(&self, kind: &str, duration: Duration) {
        counter!(
            "queue_worker_messages_processed_total",
            "worker" => self.worker.clone(),
            "destination" => self.destination.clone(),
            "status" => "failed"
        )
        .increment(1);

        counter!(
            "queue_worker_message_errors_total",
            "worker" => self.worker.clone(),
            "kind" => kind.to_string()
        )
        .increment(1);

        self.record_duration(duration);
    }

    fn record_duration(&self, duration: Duration) {
        histogram!(
            "queue_worker_message_duration_seconds",
            "worker" => self.worker.clone(),
            "destination" => self.destination.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn dead_lettered(&self) {
        counter!(
            "queue_worker_dead_lettered_total",
            "worker" => self.worker.clone()
        )
        .increment(1);
    }

    pub fn reply_sent(&self, outcome: &'static str) {
        counter!(
            "queue_worker_replies_sent_total",
            "worker" => self.worker.clone(),
            "outcome" => outcome
        )
        .increment(1);
    }

    pub fn worker_started(&self) {
        gauge!("queue_worker_running_workers", "worker" => self.worker.clone()).increment(1.0);
    }

    pub fn worker_stopped(&self) {
        gauge!("queue_worker_running_workers", "worker" => self.worker.clone()).decrement(1.0);
    }
}

/// Publisher metrics helper
#[derive(Debug, Clone)]
pub struct PublisherMetrics {
    destination: String,
}

impl PublisherMetrics {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
        }
    }

    pub fn message_published(&self, marshal: &str) {
        counter!(
            "queue_publisher_messages_published_total",
            "destination" => self.destination.clone(),
            "marshal" => marshal.to_string()
        )
        .increment(1);
    }

    /// Record how a correlated reply ended: message, exception or timeout
    pub fn response(&self, outcome: &'static str) {
        counter!(
            "queue_publisher_responses_total",
            "destination" => self.destination.clone(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = WorkerMetrics::new("Calc", "queue://Calc");
        assert_eq!(metrics.worker, "Calc");
        assert_eq!(metrics.destination, "queue://Calc");
    }

    #[test]
    fn test_render_without_recorder_is_empty() {
        if prometheus_handle().is_none() {
            assert!(render_metrics().is_empty());
        }
    }
}
