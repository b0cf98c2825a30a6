//! Alert worker - delivers security alerts off the control loop
//!
//! The orchestrator enqueues alerts with `try_send` and never waits. The
//! worker owns the network calls: each attempt is bounded by the SMS
//! timeout, and an alert is given up after `max_attempts`.

use crate::domain::error::AlertError;
use crate::domain::types::Alert;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::sms::AlertGateway;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Pause between attempts for the same alert
const DEFAULT_ATTEMPT_BACKOFF: Duration = Duration::from_secs(2);

/// Non-blocking handle used by the control loop
#[derive(Clone)]
pub struct AlertSender {
    tx: mpsc::Sender<(Alert, Instant)>,
    metrics: Arc<Metrics>,
}

impl AlertSender {
    /// Enqueue an alert. Returns false if it was dropped.
    pub fn send(&self, alert: Alert) -> bool {
        info!(
            alert_id = %alert.id,
            kind = alert.kind.as_str(),
            plate = alert.plate.as_deref().unwrap_or("unknown"),
            "alert_raised"
        );
        match self.tx.try_send((alert, Instant::now())) {
            Ok(()) => true,
            Err(e) => {
                self.metrics.record_alert_dropped();
                warn!(error = %e, "alert_dropped");
                false
            }
        }
    }
}

/// Worker that processes alerts asynchronously
pub struct AlertWorker {
    /// `None` when SMS credentials are not configured: alerts are only logged
    gateway: Option<Arc<dyn AlertGateway>>,
    rx: mpsc::Receiver<(Alert, Instant)>,
    metrics: Arc<Metrics>,
    site: String,
    attempt_timeout: Duration,
    max_attempts: u32,
    backoff: Duration,
}

impl AlertWorker {
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run the worker, processing alerts until every sender is dropped
    pub async fn run(mut self) {
        info!(sms_configured = self.gateway.is_some(), "alert_worker_started");

        while let Some((alert, enqueued_at)) = self.rx.recv().await {
            let queue_delay_ms = enqueued_at.elapsed().as_millis() as u64;

            let Some(gateway) = self.gateway.clone() else {
                info!(
                    alert_id = %alert.id,
                    kind = alert.kind.as_str(),
                    message = %alert.message(&self.site),
                    "alert_logged_only"
                );
                continue;
            };

            match self.deliver_with_retry(gateway.as_ref(), &alert).await {
                Ok(attempts) => {
                    self.metrics.record_alert_sent();
                    info!(
                        alert_id = %alert.id,
                        kind = alert.kind.as_str(),
                        attempts,
                        queue_delay_ms,
                        "alert_delivered"
                    );
                }
                Err(e) => {
                    self.metrics.record_alert_failed();
                    error!(
                        alert_id = %alert.id,
                        kind = alert.kind.as_str(),
                        attempts = self.max_attempts,
                        error = %e,
                        "alert_delivery_failed"
                    );
                }
            }
        }

        info!("alert_worker_stopped");
    }

    async fn deliver_with_retry(
        &self,
        gateway: &dyn AlertGateway,
        alert: &Alert,
    ) -> Result<u32, AlertError> {
        let mut last_error = AlertError::Timeout;
        for attempt in 1..=self.max_attempts {
            match tokio::time::timeout(self.attempt_timeout, gateway.deliver(alert)).await {
                Ok(Ok(())) => return Ok(attempt),
                Ok(Err(e)) => {
                    warn!(alert_id = %alert.id, attempt, error = %e, "alert_attempt_failed");
                    last_error = e;
                }
                Err(_) => {
                    warn!(alert_id = %alert.id, attempt, "alert_attempt_timeout");
                    last_error = AlertError::Timeout;
                }
            }
            if attempt < self.max_attempts && !self.backoff.is_zero() {
                tokio::time::sleep(self.backoff).await;
            }
        }
        Err(last_error)
    }
}

/// Create an alert channel and worker
///
/// Returns the sender (for the orchestrator) and the worker (to be spawned)
pub fn create_alert_worker(
    gateway: Option<Arc<dyn AlertGateway>>,
    config: &Config,
    metrics: Arc<Metrics>,
) -> (AlertSender, AlertWorker) {
    let (tx, rx) = mpsc::channel(config.alert_queue_size());
    let sender = AlertSender { tx, metrics: metrics.clone() };
    let worker = AlertWorker {
        gateway,
        rx,
        metrics,
        site: config.site_id().to_string(),
        attempt_timeout: config.sms_timeout(),
        max_attempts: config.sms_max_attempts().max(1),
        backoff: DEFAULT_ATTEMPT_BACKOFF,
    };
    (sender, worker)
}

/// Bare alert channel for tests that inspect raised alerts directly
#[cfg(test)]
pub(crate) fn alert_channel(
    capacity: usize,
    metrics: Arc<Metrics>,
) -> (AlertSender, mpsc::Receiver<(Alert, Instant)>) {
    let (tx, rx) = mpsc::channel(capacity);
    (AlertSender { tx, metrics }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::AlertKind;
    use crate::io::sms::RecordingGateway;

    fn worker_with(gateway: RecordingGateway, metrics: Arc<Metrics>) -> (AlertSender, AlertWorker) {
        let (sender, worker) =
            create_alert_worker(Some(Arc::new(gateway)), &Config::default(), metrics);
        (sender, worker.with_backoff(Duration::ZERO))
    }

    #[tokio::test]
    async fn test_alert_delivered() {
        let gateway = RecordingGateway::default();
        let metrics = Arc::new(Metrics::new());
        let (sender, worker) = worker_with(gateway.clone(), metrics.clone());

        assert!(sender.send(Alert::new(AlertKind::UnauthorizedVehicle, Some("ZZZ999".into()))));
        drop(sender);
        worker.run().await;

        let delivered = gateway.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].plate.as_deref(), Some("ZZZ999"));
        assert_eq!(metrics.alerts_sent_total(), 1);
    }

    #[tokio::test]
    async fn test_alert_retried_then_delivered() {
        let gateway = RecordingGateway::failing(2);
        let metrics = Arc::new(Metrics::new());
        let (sender, worker) = worker_with(gateway.clone(), metrics.clone());

        sender.send(Alert::new(AlertKind::Tailgating, None));
        drop(sender);
        worker.run().await;

        assert_eq!(gateway.delivered().len(), 1);
        assert_eq!(metrics.alerts_failed_total(), 0);
    }

    #[tokio::test]
    async fn test_alert_given_up_after_max_attempts() {
        let gateway = RecordingGateway::failing(3);
        let metrics = Arc::new(Metrics::new());
        let (sender, worker) = worker_with(gateway.clone(), metrics.clone());

        sender.send(Alert::new(AlertKind::CycleError, None));
        drop(sender);
        worker.run().await;

        assert!(gateway.delivered().is_empty());
        assert_eq!(metrics.alerts_failed_total(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let config = Config::from_toml_str("[alerts]\nqueue_size = 1\n").unwrap();
        let metrics = Arc::new(Metrics::new());
        let (sender, _worker) = create_alert_worker(None, &config, metrics.clone());

        assert!(sender.send(Alert::new(AlertKind::Tailgating, None)));
        assert!(!sender.send(Alert::new(AlertKind::Tailgating, None)));
        assert_eq!(metrics.report().alerts_dropped_total, 1);
    }

    #[tokio::test]
    async fn test_unconfigured_gateway_logs_only() {
        let metrics = Arc::new(Metrics::new());
        let (sender, worker) = create_alert_worker(None, &Config::default(), metrics.clone());
        sender.send(Alert::new(AlertKind::UnverifiedVehicle, None));
        drop(sender);
        worker.run().await;
        assert_eq!(metrics.alerts_sent_total(), 0);
        assert_eq!(metrics.alerts_failed_total(), 0);
    }
}
