//! Services - control logic for both controllers
//!
//! This module contains the core business logic services:
//! - `distance_monitor` - Debounced ultrasonic presence detection
//! - `gate` - Servo gate actuation and auto-close
//! - `authorizer` - Plate authorization with local fallback
//! - `orchestrator` - Access cycle state machine on the actuator controller
//! - `vision_node` - Capture and remote lookup on the vision controller
//! - `alert_worker` - Async SMS alert delivery

pub mod alert_worker;
pub mod authorizer;
pub mod distance_monitor;
pub mod gate;
pub mod orchestrator;
pub mod vision_node;

// Re-export commonly used types
pub use alert_worker::{create_alert_worker, AlertSender, AlertWorker};
pub use authorizer::{AuthStep, PlateAuthorizer};
pub use distance_monitor::{DistanceMonitor, MonitorEvent};
pub use gate::{GateActuator, GateState};
pub use orchestrator::AccessOrchestrator;
pub use vision_node::VisionNode;
