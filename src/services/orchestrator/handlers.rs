//! Phase handlers for the AccessOrchestrator

use super::{AccessOrchestrator, Phase};
use crate::domain::types::{
    epoch_ms, AccessRecord, Alert, AlertKind, AuthCategory, AuthorizationVerdict, CaptureOutcome,
    CaptureRequest, CorrelationId, VerdictSource,
};
use crate::io::frame::FrameType;
use crate::io::hardware::{Indicators, RangeSensor, Servo, Signal};
use crate::io::link::{LinkEvent, Transport};
use crate::services::authorizer::AuthStep;
use crate::services::vision_node::log_access_locally;
use std::time::Instant;
use tracing::{debug, error, info, warn};

impl<S: RangeSensor, V: Servo, I: Indicators, T: Transport> AccessOrchestrator<S, V, I, T> {
    /// Work for the current phase. Returns the next phase, if any.
    pub(super) fn step(&mut self, events: &[LinkEvent], now: Instant) -> Option<Phase> {
        match self.phase.clone() {
            Phase::Idle | Phase::Halted { .. } => None,
            Phase::Detected => Some(self.request_capture(now)),
            Phase::Capturing { corr, until } => self.handle_capturing(events, corr, until, now),
            Phase::Authorizing => {
                let verdict = self.authorizer.poll(events, &mut self.link, now)?;
                Some(self.issue_verdict(verdict))
            }
            Phase::Granted(verdict) => {
                self.record_access(&verdict, now);
                Some(self.handle_granted(&verdict, now))
            }
            Phase::Denied(verdict) => {
                self.record_access(&verdict, now);
                self.handle_denied(&verdict);
                Some(Phase::Cooldown { until: now + self.config.cooldown() })
            }
            Phase::Open => {
                let expired = self.cycle.as_ref().is_some_and(|c| now >= c.deadline);
                if self.gate.is_fully_open() || !self.gate.is_open() || expired {
                    Some(Phase::Cooldown { until: now + self.config.cooldown() })
                } else {
                    None
                }
            }
            Phase::Cooldown { until } => {
                if now < until {
                    return None;
                }
                if let Some(cycle) = self.cycle.take() {
                    let elapsed = now.saturating_duration_since(cycle.detection.timestamp);
                    info!(cycle_id = %cycle.id, elapsed_ms = %elapsed.as_millis(), "cycle_complete");
                }
                Some(Phase::Idle)
            }
            Phase::Error { reason } => {
                self.handle_error(reason);
                Some(Phase::Cooldown { until: now + self.config.cooldown() })
            }
        }
    }

    /// Force ERROR when the cycle outlives its deadline before a verdict
    pub(super) fn check_deadline(&mut self, now: Instant) {
        let Some(ref cycle) = self.cycle else {
            return;
        };
        if now < cycle.deadline {
            return;
        }
        if matches!(self.phase, Phase::Detected | Phase::Capturing { .. } | Phase::Authorizing) {
            warn!(
                cycle_id = %cycle.id,
                state = self.phase.state().as_str(),
                "cycle_deadline_exceeded"
            );
            self.link.abandon();
            self.authorizer.cancel();
            self.enter(Phase::Error { reason: "process_timeout" });
        }
    }

    fn request_capture(&mut self, now: Instant) -> Phase {
        if !self.link.is_peer_reachable(now) {
            warn!("capture_skipped_peer_unreachable");
            return self.issue_verdict(self.authorizer.unverified());
        }

        let Some(ref cycle) = self.cycle else {
            return Phase::Idle;
        };
        let request = CaptureRequest {
            detected_at_ms: cycle.detection.epoch_ms,
            distance_cm: cycle.detection.distance_cm,
        };
        match self.link.begin_request(FrameType::CaptureRequest, &request, now) {
            Ok(corr) => {
                debug!(corr = %corr, "capture_request_sent");
                Phase::Capturing { corr, until: now + self.config.capture_timeout() }
            }
            Err(e) => {
                warn!(error = %e, "capture_request_failed");
                Phase::Error { reason: "capture_request_failed" }
            }
        }
    }

    fn handle_capturing(
        &mut self,
        events: &[LinkEvent],
        corr: CorrelationId,
        until: Instant,
        now: Instant,
    ) -> Option<Phase> {
        for event in events {
            match event {
                LinkEvent::Response(frame)
                    if frame.corr == corr && frame.kind == FrameType::CaptureResult =>
                {
                    return Some(match frame.json::<CaptureOutcome>() {
                        Ok(CaptureOutcome::Plate(result)) => {
                            let deadline = self.cycle.as_ref().map_or(now, |c| c.deadline);
                            match self.authorizer.begin(&result, &mut self.link, now, deadline) {
                                AuthStep::Verdict(verdict) => self.issue_verdict(verdict),
                                AuthStep::Pending => Phase::Authorizing,
                            }
                        }
                        Ok(CaptureOutcome::Failed { code }) => {
                            info!(code = code.as_str(), "capture_unsuccessful");
                            self.issue_verdict(self.authorizer.recognition_error(None))
                        }
                        Err(e) => {
                            warn!(error = %e, "capture_result_malformed");
                            Phase::Error { reason: "capture_result_malformed" }
                        }
                    });
                }
                LinkEvent::Failed { corr: failed, error } if *failed == corr => {
                    warn!(corr = %corr, error = %error, "capture_link_failure");
                    return Some(Phase::Error { reason: "capture_link_failure" });
                }
                _ => {}
            }
        }

        if now >= until {
            warn!(corr = %corr, "capture_timeout");
            self.link.abandon();
            return Some(Phase::Error { reason: "capture_timeout" });
        }
        None
    }

    /// Record a verdict and pick GRANTED or DENIED
    fn issue_verdict(&mut self, verdict: AuthorizationVerdict) -> Phase {
        info!(
            cycle_id = self.cycle.as_ref().map(|c| c.id.as_str()).unwrap_or("-"),
            plate = verdict.plate_or_unknown(),
            category = verdict.category.as_str(),
            source = verdict.source.as_str(),
            "verdict_issued"
        );

        if verdict.source == VerdictSource::LocalFallback {
            self.metrics.record_local_fallback();
        }
        match verdict.category {
            c if c.grants_access() => self.metrics.record_grant(),
            AuthCategory::Error => self.metrics.record_recognition_error(),
            _ => self.metrics.record_denial(),
        }

        self.last_verdict = Some(verdict.clone());
        if verdict.category.grants_access() {
            Phase::Granted(verdict)
        } else {
            Phase::Denied(verdict)
        }
    }

    /// Send a verdict with a plate to the vision node's access log
    fn record_access(&mut self, verdict: &AuthorizationVerdict, now: Instant) {
        if verdict.category == AuthCategory::Error {
            return;
        }
        let Some(ref plate) = verdict.plate else {
            return;
        };
        let record = AccessRecord {
            plate: plate.clone(),
            category: verdict.category,
            source: verdict.source,
            site_id: self.config.site_id().to_string(),
            recorded_at_ms: epoch_ms(),
        };
        match self.link.notify(FrameType::AccessLog, &record, now) {
            Ok(corr) => {
                debug!(corr = %corr, plate = %record.plate, "access_record_sent");
                self.unconfirmed_records.push((corr, record));
            }
            Err(e) => log_access_locally(&record, &e.to_string()),
        }
    }

    /// Keep records the link gave up on in the local log; forget delivered ones
    pub(super) fn settle_access_records(&mut self, events: &[LinkEvent]) {
        if self.unconfirmed_records.is_empty() {
            return;
        }
        for event in events {
            let LinkEvent::Failed { corr, error } = event else {
                continue;
            };
            if let Some(pos) = self.unconfirmed_records.iter().position(|(c, _)| c == corr) {
                let (_, record) = self.unconfirmed_records.remove(pos);
                log_access_locally(&record, &error.to_string());
            }
        }
        let link = &self.link;
        self.unconfirmed_records.retain(|(corr, _)| link.is_pending(*corr));
    }

    fn handle_granted(&mut self, verdict: &AuthorizationVerdict, now: Instant) -> Phase {
        match self.gate.open(verdict.category, now) {
            Ok(close_at) => {
                info!(
                    plate = verdict.plate_or_unknown(),
                    close_in_ms = %close_at.saturating_duration_since(now).as_millis(),
                    "access_granted"
                );
                self.indicators.signal(Signal::AccessGranted);
                self.access_led = true;
                Phase::Open
            }
            Err(e) => {
                warn!(error = %e, "gate_open_rejected");
                Phase::Cooldown { until: now + self.config.cooldown() }
            }
        }
    }

    fn handle_denied(&mut self, verdict: &AuthorizationVerdict) {
        self.indicators.signal(Signal::DenialCue);

        // Inconclusive reads never page security
        if verdict.category == AuthCategory::Error {
            return;
        }

        let kind = if verdict.plate.is_none() {
            AlertKind::UnverifiedVehicle
        } else if self.gate.is_open() {
            AlertKind::UnauthorizedWhileOpen
        } else {
            AlertKind::UnauthorizedVehicle
        };
        let alert = Alert::new(kind, verdict.plate.clone())
            .with_detail(format!("source={}", verdict.source.as_str()));
        self.alerts.send(alert);
    }

    fn handle_error(&mut self, reason: &'static str) {
        error!(
            cycle_id = self.cycle.as_ref().map(|c| c.id.as_str()).unwrap_or("-"),
            reason,
            "cycle_error"
        );
        self.metrics.record_cycle_error();
        self.link.abandon();
        self.authorizer.cancel();
        self.raise_alarm();
        self.alerts.send(Alert::new(AlertKind::CycleError, None).with_detail(reason));
    }

    pub(super) fn on_busy_arrival(&mut self, distance_cm: f32) {
        if !self.phase.in_cycle() && !self.gate.is_open() {
            debug!(distance_cm = %distance_cm, "arrival_deferred");
            return;
        }

        self.metrics.record_tailgate();
        warn!(
            distance_cm = %distance_cm,
            state = self.phase.state().as_str(),
            gate_open = self.gate.is_open(),
            "tailgating_suspected"
        );
        let alert = Alert::new(AlertKind::Tailgating, None)
            .with_detail(format!("second vehicle while {}", self.phase.state().as_str()));
        self.alerts.send(alert);
    }

    /// Fatal hardware fault: stop cycling until `reset`
    pub(super) fn halt(&mut self, reason: String, actuator: bool) {
        error!(reason = %reason, actuator, "system_halted");
        self.link.abandon();
        self.authorizer.cancel();
        self.cycle = None;
        self.raise_alarm();
        self.alerts.send(Alert::new(AlertKind::HardwareFault, None).with_detail(reason.clone()));
        self.enter(Phase::Halted { reason, actuator });
    }

    fn raise_alarm(&mut self) {
        if !self.alarm {
            self.alarm = true;
            self.indicators.signal(Signal::AlarmOn);
        }
    }
}
