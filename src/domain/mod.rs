//! Domain models - core types shared by both controllers
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - detection events, verdicts, frame payloads, alerts
//! - `error` - component error taxonomy

pub mod error;
pub mod types;

pub use error::{AlertError, ConfigError, GateError, LinkError, SensorError};
pub use types::{
    AccessState, Alert, AlertKind, AuthCategory, AuthorizationVerdict, CorrelationId,
    DetectionEvent, VerdictSource,
};
