//! Plate authorization: remote store over the link, local list as backup
//!
//! The remote lookup is an AUTH_QUERY transaction on the serial link, bounded
//! by the remote timeout and the cycle deadline. Anything short of a clear
//! remote answer falls back to the local plate list.

use crate::domain::types::{
    normalize_plate, AuthCategory, AuthQuery, AuthorizationVerdict, CaptureResult, CorrelationId,
    RemoteLookup, VerdictSource,
};
use crate::infra::config::Config;
use crate::io::frame::FrameType;
use crate::io::link::{LinkEvent, SerialLink, Transport};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of starting an authorization
#[derive(Debug, Clone, PartialEq)]
pub enum AuthStep {
    Verdict(AuthorizationVerdict),
    /// Remote lookup in flight; keep polling
    Pending,
}

#[derive(Debug, Clone)]
struct PendingLookup {
    plate: String,
    corr: CorrelationId,
    deadline: Instant,
}

pub struct PlateAuthorizer {
    config: Config,
    pending: Option<PendingLookup>,
}

impl PlateAuthorizer {
    pub fn new(config: &Config) -> Self {
        Self { config: config.clone(), pending: None }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Resolve a plate given the remote answer, `None` meaning the remote
    /// could not be asked.
    pub fn authorize(&self, plate_text: &str, remote: Option<RemoteLookup>) -> AuthorizationVerdict {
        let plate = normalize_plate(plate_text);
        match remote {
            Some(RemoteLookup::Found { category }) if category.grants_access() => {
                self.verdict(category, VerdictSource::Remote, Some(plate))
            }
            Some(RemoteLookup::Found { .. }) | Some(RemoteLookup::NotFound) => {
                self.verdict(AuthCategory::Denied, VerdictSource::Remote, Some(plate))
            }
            Some(RemoteLookup::Unavailable) | None => self.authorize_local(&plate),
        }
    }

    /// Exact match against the local plate list
    pub fn authorize_local(&self, plate_text: &str) -> AuthorizationVerdict {
        let plate = normalize_plate(plate_text);
        let category = if self.config.local_plates().iter().any(|p| *p == plate) {
            AuthCategory::Resident
        } else {
            AuthCategory::Denied
        };
        self.verdict(category, VerdictSource::LocalFallback, Some(plate))
    }

    /// Verdict for a vehicle that could not be recognized because the vision
    /// node is unreachable
    pub fn unverified(&self) -> AuthorizationVerdict {
        self.verdict(AuthCategory::Denied, VerdictSource::LocalFallback, None)
    }

    /// Verdict for a failed or inconclusive recognition
    pub fn recognition_error(&self, plate: Option<String>) -> AuthorizationVerdict {
        self.verdict(AuthCategory::Error, VerdictSource::Recognition, plate)
    }

    /// Validate the capture and start the remote lookup.
    pub fn begin<T: Transport>(
        &mut self,
        capture: &CaptureResult,
        link: &mut SerialLink<T>,
        now: Instant,
        cycle_deadline: Instant,
    ) -> AuthStep {
        let plate = normalize_plate(&capture.plate_text);
        if plate.is_empty() {
            info!("recognition_empty");
            return AuthStep::Verdict(self.recognition_error(None));
        }
        if capture.confidence < self.config.min_confidence() {
            info!(plate = %plate, confidence = %capture.confidence, "recognition_low_confidence");
            return AuthStep::Verdict(self.recognition_error(Some(plate)));
        }

        if !link.is_peer_reachable(now) {
            debug!(plate = %plate, "remote_skipped_peer_unreachable");
            return AuthStep::Verdict(self.authorize_local(&plate));
        }

        match link.begin_request(FrameType::AuthQuery, &AuthQuery { plate: plate.clone() }, now) {
            Ok(corr) => {
                let deadline = (now + self.config.remote_timeout()).min(cycle_deadline);
                debug!(plate = %plate, corr = %corr, "remote_lookup_started");
                self.pending = Some(PendingLookup { plate, corr, deadline });
                AuthStep::Pending
            }
            Err(e) => {
                warn!(plate = %plate, error = %e, "remote_lookup_not_sent");
                AuthStep::Verdict(self.authorize_local(&plate))
            }
        }
    }

    /// Advance a pending lookup with this tick's link events.
    pub fn poll<T: Transport>(
        &mut self,
        events: &[LinkEvent],
        link: &mut SerialLink<T>,
        now: Instant,
    ) -> Option<AuthorizationVerdict> {
        let pending = self.pending.as_ref()?;

        for event in events {
            match event {
                LinkEvent::Response(frame)
                    if frame.corr == pending.corr && frame.kind == FrameType::AuthResult =>
                {
                    let lookup = match frame.json::<RemoteLookup>() {
                        Ok(lookup) => lookup,
                        Err(e) => {
                            warn!(error = %e, "remote_result_malformed");
                            RemoteLookup::Unavailable
                        }
                    };
                    let plate = pending.plate.clone();
                    self.pending = None;
                    return Some(self.authorize(&plate, Some(lookup)));
                }
                LinkEvent::Failed { corr, error } if *corr == pending.corr => {
                    warn!(plate = %pending.plate, error = %error, "remote_lookup_link_failed");
                    let plate = pending.plate.clone();
                    self.pending = None;
                    return Some(self.authorize_local(&plate));
                }
                _ => {}
            }
        }

        if now >= pending.deadline || !link.is_peer_reachable(now) {
            warn!(
                plate = %pending.plate,
                peer_reachable = link.is_peer_reachable(now),
                "remote_lookup_timeout"
            );
            let plate = pending.plate.clone();
            self.pending = None;
            link.abandon();
            return Some(self.authorize_local(&plate));
        }
        None
    }

    /// Drop a pending lookup without a verdict
    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(plate = %pending.plate, corr = %pending.corr, "remote_lookup_cancelled");
        }
    }

    fn verdict(
        &self,
        category: AuthCategory,
        source: VerdictSource,
        plate: Option<String>,
    ) -> AuthorizationVerdict {
        let open_duration: Option<Duration> = self.config.open_duration(category);
        AuthorizationVerdict { category, source, plate, open_duration }
    }
}
