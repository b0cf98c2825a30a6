//! Shared types for the vehicle gate

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Normalize a plate string: trim, drop inner whitespace, uppercase
pub fn normalize_plate(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).flat_map(char::to_uppercase).collect()
}

/// Newtype wrapper binding a request frame to its response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CorrelationId(pub u16);

impl CorrelationId {
    /// Reserved for heartbeats and link control frames
    pub const CONTROL: CorrelationId = CorrelationId(0);
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Vehicle presence edge emitted by the distance monitor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionEvent {
    pub timestamp: Instant,
    pub epoch_ms: u64,
    pub distance_cm: f32,
}

/// Authorization class, also used for the non-granting outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthCategory {
    Resident,
    Temporary,
    Emergency,
    Denied,
    Error,
}

impl AuthCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthCategory::Resident => "resident",
            AuthCategory::Temporary => "temporary",
            AuthCategory::Emergency => "emergency",
            AuthCategory::Denied => "denied",
            AuthCategory::Error => "error",
        }
    }

    #[inline]
    pub fn grants_access(&self) -> bool {
        matches!(self, AuthCategory::Resident | AuthCategory::Temporary | AuthCategory::Emergency)
    }
}

/// Where a verdict came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Remote,
    LocalFallback,
    /// Recognition failed; no store was consulted
    Recognition,
}

impl VerdictSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictSource::Remote => "remote",
            VerdictSource::LocalFallback => "local_fallback",
            VerdictSource::Recognition => "recognition",
        }
    }
}

/// Immutable outcome of authorization, consumed once by the gate actuator
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationVerdict {
    pub category: AuthCategory,
    pub source: VerdictSource,
    /// Normalized plate; `None` when no recognition took place
    pub plate: Option<String>,
    /// How long the gate stays open; `None` for denied/error
    pub open_duration: Option<Duration>,
}

impl AuthorizationVerdict {
    pub fn plate_or_unknown(&self) -> &str {
        self.plate.as_deref().unwrap_or("unknown")
    }
}

/// Successful recognition as reported by the vision node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    pub plate_text: String,
    pub confidence: f32,
    pub captured_at_ms: u64,
}

/// Recognition failure codes. `NoPlateFound` is distinct from a low-confidence read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureFailure {
    NoPlateFound,
    CameraFault,
    ServiceUnavailable,
}

impl CaptureFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureFailure::NoPlateFound => "no_plate_found",
            CaptureFailure::CameraFault => "camera_fault",
            CaptureFailure::ServiceUnavailable => "service_unavailable",
        }
    }
}

/// CAPTURE_REQUEST payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub detected_at_ms: u64,
    pub distance_cm: f32,
}

/// CAPTURE_RESULT payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaptureOutcome {
    Plate(CaptureResult),
    Failed { code: CaptureFailure },
}

/// AUTH_QUERY payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthQuery {
    pub plate: String,
}

/// ACCESS_LOG payload: one entry of the access audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub plate: String,
    pub category: AuthCategory,
    pub source: VerdictSource,
    pub site_id: String,
    pub recorded_at_ms: u64,
}

impl AccessRecord {
    /// Granted entries go to the access log, the rest to the
    /// unauthorized-vehicle log
    pub fn is_granted(&self) -> bool {
        self.category.grants_access()
    }
}

/// AUTH_RESULT payload: outcome of the remote store lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemoteLookup {
    Found { category: AuthCategory },
    NotFound,
    Unavailable,
}

/// Coarse orchestrator state, for logging and status reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessState {
    Idle,
    Detected,
    Capturing,
    Authorizing,
    Granted,
    Denied,
    Open,
    Cooldown,
    Error,
    Halted,
}

impl AccessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessState::Idle => "idle",
            AccessState::Detected => "detected",
            AccessState::Capturing => "capturing",
            AccessState::Authorizing => "authorizing",
            AccessState::Granted => "granted",
            AccessState::Denied => "denied",
            AccessState::Open => "open",
            AccessState::Cooldown => "cooldown",
            AccessState::Error => "error",
            AccessState::Halted => "halted",
        }
    }
}

/// Kinds of security alert sent to the operator contact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Plate recognized and rejected by both stores
    UnauthorizedVehicle,
    /// Rejected vehicle at the barrier while it stood open for someone else
    UnauthorizedWhileOpen,
    /// Vehicle present while the vision node was unreachable
    UnverifiedVehicle,
    /// Second arrival while a cycle was in progress
    Tailgating,
    /// Cycle aborted on link failure or deadline
    CycleError,
    /// Sensor or servo fault, system halted
    HardwareFault,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::UnauthorizedVehicle => "unauthorized_vehicle",
            AlertKind::UnauthorizedWhileOpen => "unauthorized_while_open",
            AlertKind::UnverifiedVehicle => "unverified_vehicle",
            AlertKind::Tailgating => "tailgating",
            AlertKind::CycleError => "cycle_error",
            AlertKind::HardwareFault => "hardware_fault",
        }
    }

    fn headline(&self) -> &'static str {
        match self {
            AlertKind::UnauthorizedVehicle => "Vehicle NOT authorized",
            AlertKind::UnauthorizedWhileOpen => "Vehicle NOT authorized (gate was open)",
            AlertKind::UnverifiedVehicle => "Vehicle could not be verified (camera offline)",
            AlertKind::Tailgating => "Possible tailgating at gate",
            AlertKind::CycleError => "Access cycle failed",
            AlertKind::HardwareFault => "Gate hardware fault - system halted",
        }
    }
}

/// A security alert, dispatched fire-and-forget
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub kind: AlertKind,
    pub plate: Option<String>,
    pub epoch_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Alert {
    pub fn new(kind: AlertKind, plate: Option<String>) -> Self {
        Self { id: new_uuid_v7(), kind, plate, epoch_ms: epoch_ms(), detail: None }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// SMS body sent to the security contact
    pub fn message(&self, site: &str) -> String {
        let when = DateTime::from_timestamp_millis(self.epoch_ms as i64)
            .map(|utc| utc.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| self.epoch_ms.to_string());

        let mut body = format!(
            "SECURITY ALERT\n{}\nPlate: {}\nTime: {}\nLocation: {}",
            self.kind.headline(),
            self.plate.as_deref().unwrap_or("unknown"),
            when,
            site
        );
        if let Some(ref detail) = self.detail {
            body.push_str("\nDetail: ");
            body.push_str(detail);
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_plate() {
        assert_eq!(normalize_plate("  abc123 "), "ABC123");
        assert_eq!(normalize_plate("ab c 123"), "ABC123");
        assert_eq!(normalize_plate("\tdef456\n"), "DEF456");
        assert_eq!(normalize_plate("   "), "");
    }

    #[test]
    fn test_only_grant_categories_grant_access() {
        assert!(AuthCategory::Resident.grants_access());
        assert!(AuthCategory::Temporary.grants_access());
        assert!(AuthCategory::Emergency.grants_access());
        assert!(!AuthCategory::Denied.grants_access());
        assert!(!AuthCategory::Error.grants_access());
    }

    #[test]
    fn test_capture_outcome_wire_shape() {
        let ok = CaptureOutcome::Plate(CaptureResult {
            plate_text: "ABC123".to_string(),
            confidence: 0.9,
            captured_at_ms: 42,
        });
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "plate");
        assert_eq!(json["plate_text"], "ABC123");

        let failed = CaptureOutcome::Failed { code: CaptureFailure::NoPlateFound };
        let json = serde_json::to_string(&failed).unwrap();
        assert_eq!(json, r#"{"status":"failed","code":"no_plate_found"}"#);
    }

    #[test]
    fn test_remote_lookup_parses() {
        let found: RemoteLookup =
            serde_json::from_str(r#"{"status":"found","category":"temporary"}"#).unwrap();
        assert_eq!(found, RemoteLookup::Found { category: AuthCategory::Temporary });
        let missing: RemoteLookup = serde_json::from_str(r#"{"status":"not_found"}"#).unwrap();
        assert_eq!(missing, RemoteLookup::NotFound);
    }

    #[test]
    fn test_alert_message_mentions_unknown_plate() {
        let alert = Alert::new(AlertKind::UnverifiedVehicle, None);
        let body = alert.message("main_entrance");
        assert!(body.contains("Plate: unknown"));
        assert!(body.contains("main_entrance"));
        assert!(!alert.id.is_empty());
    }
}
