//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `frame` - Inter-controller frame codec
//! - `link` - Reliable framed link with heartbeats and a correlation slot
//! - `serial` - tokio-serial bridge for the UART between the controllers
//! - `hardware` - Sensor, servo and indicator seams
//! - `camera` - Camera snapshot source
//! - `ocr` - Plate recognition (OCR.space) and plate extraction
//! - `firebase` - Remote authorization store
//! - `sms` - Twilio SMS gateway

pub mod camera;
pub mod firebase;
pub mod frame;
pub mod hardware;
pub mod link;
pub mod ocr;
pub mod serial;
pub mod sms;

// Re-export commonly used types
pub use frame::{Frame, FrameType};
pub use link::{ChannelTransport, LinkEvent, LinkSettings, SerialLink, Transport};
pub use serial::open_serial_transport;
