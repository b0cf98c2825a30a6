//! Vision controller side of the link
//!
//! Answers CAPTURE_REQUEST with a recognition result and AUTH_QUERY with a
//! remote-store lookup, and writes ACCESS_LOG notices to the remote store's
//! audit trail (or the local log when the store is down). Network work runs in spawned tasks; results come back
//! over a bounded channel and are sent from the tick so the link stays
//! single-owner.

use crate::domain::types::{AccessRecord, AuthQuery, CaptureOutcome, CaptureRequest, RemoteLookup};
use crate::io::camera::Camera;
use crate::io::firebase::RemoteStore;
use crate::io::frame::{Frame, FrameType};
use crate::io::link::{LinkEvent, SerialLink, Transport};
use crate::io::ocr::Recognizer;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

const RESULT_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug)]
enum Reply {
    Capture(CaptureOutcome),
    Auth(RemoteLookup),
}

pub struct VisionNode<T: Transport> {
    link: SerialLink<T>,
    camera: Arc<dyn Camera>,
    recognizer: Arc<dyn Recognizer>,
    store: Arc<dyn RemoteStore>,
    remote_timeout: Duration,
    results_tx: mpsc::Sender<(Frame, Reply)>,
    results_rx: mpsc::Receiver<(Frame, Reply)>,
    in_flight: usize,
}

impl<T: Transport> VisionNode<T> {
    pub fn new(
        link: SerialLink<T>,
        camera: Arc<dyn Camera>,
        recognizer: Arc<dyn Recognizer>,
        store: Arc<dyn RemoteStore>,
        remote_timeout: Duration,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        Self { link, camera, recognizer, store, remote_timeout, results_tx, results_rx, in_flight: 0 }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Poll the link, start work for new requests, send finished replies.
    /// Must run inside a tokio runtime.
    pub fn tick(&mut self, now: Instant) {
        for event in self.link.poll(now) {
            match event {
                LinkEvent::Request(frame) => self.dispatch(frame),
                LinkEvent::Notice(frame) => self.record_access(frame),
                LinkEvent::Failed { corr, error } => {
                    warn!(corr = %corr, error = %error, "vision_reply_undelivered");
                }
                LinkEvent::Response(frame) => {
                    debug!(kind = frame.kind.as_str(), "vision_unexpected_response");
                }
            }
        }

        while let Ok((request, reply)) = self.results_rx.try_recv() {
            self.in_flight = self.in_flight.saturating_sub(1);
            let sent = match reply {
                Reply::Capture(outcome) => self.link.respond(&request, &outcome, now),
                Reply::Auth(lookup) => self.link.respond(&request, &lookup, now),
            };
            if let Err(e) = sent {
                warn!(corr = %request.corr, error = %e, "vision_reply_failed");
            }
        }
    }

    fn dispatch(&mut self, request: Frame) {
        let tx = self.results_tx.clone();
        match request.kind {
            FrameType::CaptureRequest => {
                let detail = request.json::<CaptureRequest>().ok();
                info!(
                    corr = %request.corr,
                    distance_cm = ?detail.map(|d| d.distance_cm),
                    "capture_requested"
                );
                let camera = self.camera.clone();
                let recognizer = self.recognizer.clone();
                self.in_flight += 1;
                tokio::spawn(async move {
                    let outcome = capture_plate(camera.as_ref(), recognizer.as_ref()).await;
                    let _ = tx.send((request, Reply::Capture(outcome))).await;
                });
            }
            FrameType::AuthQuery => {
                let query = match request.json::<AuthQuery>() {
                    Ok(q) => q,
                    Err(e) => {
                        warn!(corr = %request.corr, error = %e, "auth_query_malformed");
                        return;
                    }
                };
                info!(corr = %request.corr, plate = %query.plate, "auth_query_received");
                let store = self.store.clone();
                let timeout = self.remote_timeout;
                self.in_flight += 1;
                tokio::spawn(async move {
                    let lookup = tokio::time::timeout(timeout, store.lookup(&query.plate))
                        .await
                        .unwrap_or(RemoteLookup::Unavailable);
                    let _ = tx.send((request, Reply::Auth(lookup))).await;
                });
            }
            other => debug!(kind = other.as_str(), "vision_ignored_frame"),
        }
    }

    fn record_access(&self, notice: Frame) {
        let record = match notice.json::<AccessRecord>() {
            Ok(record) => record,
            Err(e) => {
                warn!(corr = %notice.corr, error = %e, "access_record_malformed");
                return;
            }
        };
        let store = self.store.clone();
        let timeout = self.remote_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, store.record_access(&record)).await {
                Ok(Ok(())) => info!(
                    plate = %record.plate,
                    category = record.category.as_str(),
                    "access_recorded"
                ),
                Ok(Err(e)) => log_access_locally(&record, &e.to_string()),
                Err(_) => log_access_locally(&record, "timeout"),
            }
        });
    }

    /// Drive the node on a fixed tick until shutdown
    pub async fn run(mut self, tick_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(tick_ms = %tick_interval.as_millis(), "vision_node_started");
        let mut ticker = interval(tick_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("vision_node_shutdown");
                        return;
                    }
                }
                _ = ticker.tick() => self.tick(Instant::now()),
            }
        }
    }
}

/// Audit trail of last resort when the remote store cannot take the entry
pub fn log_access_locally(record: &AccessRecord, reason: &str) {
    info!(
        plate = %record.plate,
        category = record.category.as_str(),
        source = record.source.as_str(),
        site_id = %record.site_id,
        recorded_at_ms = record.recorded_at_ms,
        reason,
        "access_logged_locally"
    );
}

/// Snapshot then recognize
pub async fn capture_plate(camera: &dyn Camera, recognizer: &dyn Recognizer) -> CaptureOutcome {
    let image = match camera.snapshot().await {
        Ok(image) => image,
        Err(code) => {
            warn!(code = code.as_str(), "capture_failed");
            return CaptureOutcome::Failed { code };
        }
    };
    match recognizer.recognize(&image).await {
        Ok(result) => {
            info!(plate = %result.plate_text, confidence = %result.confidence, "plate_recognized");
            CaptureOutcome::Plate(result)
        }
        Err(code) => {
            info!(code = code.as_str(), "plate_not_recognized");
            CaptureOutcome::Failed { code }
        }
    }
}
