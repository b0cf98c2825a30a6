//! Inter-controller frame codec
//!
//! Frame: [STX][Type][CorrL][CorrH][LenL][LenH][Payload][Checksum][ETX]
//! - Correlation id and length are little-endian
//! - Checksum: XOR of all bytes before checksum
//! - Payload bodies are JSON; control frames (ACK, NACK, HEARTBEAT) carry none
//! - ACCESS_LOG is a notice: acknowledged like any data frame, never answered

use crate::domain::error::LinkError;
use crate::domain::types::CorrelationId;
use serde::de::DeserializeOwned;
use serde::Serialize;

// Protocol constants
const STX: u8 = 0x02;
const ETX: u8 = 0x03;
const HEADER_LEN: usize = 6;
const TRAILER_LEN: usize = 2;
pub const MIN_FRAME_SIZE: usize = HEADER_LEN + TRAILER_LEN;
pub const MAX_PAYLOAD_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Ack = 0x06,
    Nack = 0x15,
    CaptureRequest = 0x10,
    CaptureResult = 0x11,
    AuthQuery = 0x20,
    AuthResult = 0x21,
    Heartbeat = 0x30,
    AccessLog = 0x40,
}

impl FrameType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x06 => FrameType::Ack,
            0x15 => FrameType::Nack,
            0x10 => FrameType::CaptureRequest,
            0x11 => FrameType::CaptureResult,
            0x20 => FrameType::AuthQuery,
            0x21 => FrameType::AuthResult,
            0x30 => FrameType::Heartbeat,
            0x40 => FrameType::AccessLog,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Ack => "ack",
            FrameType::Nack => "nack",
            FrameType::CaptureRequest => "capture_request",
            FrameType::CaptureResult => "capture_result",
            FrameType::AuthQuery => "auth_query",
            FrameType::AuthResult => "auth_result",
            FrameType::Heartbeat => "heartbeat",
            FrameType::AccessLog => "access_log",
        }
    }

    /// Response type expected for a request type
    pub fn response_type(&self) -> Option<FrameType> {
        match self {
            FrameType::CaptureRequest => Some(FrameType::CaptureResult),
            FrameType::AuthQuery => Some(FrameType::AuthResult),
            _ => None,
        }
    }

    /// Data frame that needs no response
    pub fn is_notice(&self) -> bool {
        matches!(self, FrameType::AccessLog)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub corr: CorrelationId,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn control(kind: FrameType, corr: CorrelationId) -> Self {
        Self { kind, corr, payload: Vec::new() }
    }

    /// Build a data frame with a JSON-encoded payload
    pub fn with_json<T: Serialize>(
        kind: FrameType,
        corr: CorrelationId,
        body: &T,
    ) -> Result<Self, LinkError> {
        let payload = serde_json::to_vec(body).map_err(|e| LinkError::BadPayload(e.to_string()))?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(LinkError::PayloadTooLarge(payload.len()));
        }
        Ok(Self { kind, corr, payload })
    }

    /// Decode the JSON payload
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, LinkError> {
        serde_json::from_slice(&self.payload).map_err(|e| LinkError::BadPayload(e.to_string()))
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let data_len = self.payload.len();
        let mut frame = vec![0u8; HEADER_LEN + data_len + TRAILER_LEN];
        frame[0] = STX;
        frame[1] = self.kind as u8;
        frame[2..4].copy_from_slice(&self.corr.0.to_le_bytes());
        frame[4] = (data_len & 0xFF) as u8;
        frame[5] = ((data_len >> 8) & 0xFF) as u8;

        if data_len > 0 {
            frame[HEADER_LEN..HEADER_LEN + data_len].copy_from_slice(&self.payload);
        }

        frame[HEADER_LEN + data_len] = calculate_checksum(&frame[..HEADER_LEN + data_len]);
        frame[HEADER_LEN + data_len + 1] = ETX;
        frame
    }
}

/// Result of scanning the receive buffer
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    /// Bytes before the next STX were dropped
    Skipped,
    /// Frame boundary found but content invalid. `corr` is set when the
    /// header was intact enough to NACK the sender.
    Corrupt { corr: Option<CorrelationId>, reason: &'static str },
}

/// Decode the first frame in `buf`.
///
/// Returns `None` when more bytes are needed, otherwise the decode outcome
/// and how many bytes to consume.
pub fn decode(buf: &[u8]) -> Option<(Decoded, usize)> {
    let stx_idx = buf.iter().position(|&b| b == STX)?;
    if stx_idx > 0 {
        return Some((Decoded::Skipped, stx_idx));
    }

    if buf.len() < HEADER_LEN {
        return None;
    }

    let data_len = (buf[4] as usize) | ((buf[5] as usize) << 8);
    if data_len > MAX_PAYLOAD_LEN {
        return Some((Decoded::Corrupt { corr: None, reason: "length exceeds maximum" }, 1));
    }

    let total_len = HEADER_LEN + data_len + TRAILER_LEN;
    if buf.len() < total_len {
        return None;
    }

    if buf[total_len - 1] != ETX {
        // Length byte probably damaged; resync on the next STX
        return Some((Decoded::Corrupt { corr: None, reason: "invalid ETX" }, 1));
    }

    let corr = CorrelationId(u16::from_le_bytes([buf[2], buf[3]]));
    let checksum = buf[HEADER_LEN + data_len];
    if checksum != calculate_checksum(&buf[..HEADER_LEN + data_len]) {
        return Some((Decoded::Corrupt { corr: Some(corr), reason: "checksum mismatch" }, total_len));
    }

    let Some(kind) = FrameType::from_u8(buf[1]) else {
        return Some((Decoded::Corrupt { corr: Some(corr), reason: "unknown frame type" }, total_len));
    };

    let payload = buf[HEADER_LEN..HEADER_LEN + data_len].to_vec();
    Some((Decoded::Frame(Frame { kind, corr, payload }), total_len))
}

fn calculate_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc ^ b)
}
