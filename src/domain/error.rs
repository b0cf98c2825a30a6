//! Error taxonomy
//!
//! Recoverable errors are absorbed by the component that owns them and only
//! reach the orchestrator as a verdict or a retry-exhausted signal.
//! `GateError::ActuatorFault` and a permanent `SensorError` are fatal.

use crate::domain::types::CorrelationId;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SensorError {
    #[error("echo not received within {0:?}")]
    EchoTimeout(Duration),
    #[error("distance {0:.1} cm outside valid range")]
    OutOfRange(f32),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("no ack for frame {corr} after {attempts} attempts")]
    RetriesExhausted { corr: CorrelationId, attempts: u32 },
    #[error("transaction {0} timed out")]
    Timeout(CorrelationId),
    #[error("link busy with transaction {0}")]
    Busy(CorrelationId),
    #[error("peer unreachable")]
    PeerUnreachable,
    #[error("transport closed")]
    TransportClosed,
    #[error("payload of {0} bytes exceeds frame limit")]
    PayloadTooLarge(usize),
    #[error("malformed payload: {0}")]
    BadPayload(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GateError {
    #[error("servo did not reach {target} deg within {timeout:?} (last read {last:?})")]
    ActuatorFault { target: u8, last: Option<u8>, timeout: Duration },
    #[error("category {0} does not open the gate")]
    NotGranted(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("sms gateway not configured")]
    NotConfigured,
    #[error("sms request timed out")]
    Timeout,
    #[error("sms gateway returned status {0}")]
    Status(u16),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("remote store unavailable")]
    Unavailable,
    #[error("remote store returned status {0}")]
    Status(u16),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("local plate list is empty")]
    EmptyLocalPlates,
    #[error("invalid local plate entry {0:?}")]
    InvalidLocalPlate(String),
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
}
