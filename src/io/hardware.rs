//! Actuator-side hardware seams: ultrasonic sensor, servo, operator signals
//!
//! Pin-level drivers live outside this crate. The simulated implementations
//! here back the simulator, the stdin-fed node and the tests.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// HC-SR04 style sensor: microseconds of echo per centimetre, round trip
pub const ECHO_US_PER_CM: f32 = 58.0;

pub trait RangeSensor: Send {
    /// Trigger one ping. Returns the echo pulse width, or `None` when no echo
    /// arrived within `max_wait`.
    fn ping(&mut self, max_wait: Duration) -> Option<Duration>;
}

pub trait Servo: Send {
    fn command(&mut self, angle: u8);

    /// Measured angle, `None` when the servo gives no feedback
    fn position(&mut self, now: Instant) -> Option<u8>;
}

/// Operator-facing outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Status LED toggle while idle
    StatusBlink,
    /// Access LED on plus confirmation beep
    AccessGranted,
    AccessLedOff,
    /// Short error LED flash and beep, gate stays closed
    DenialCue,
    /// Error LED and buzzer latched until acknowledged
    AlarmOn,
    AlarmOff,
}

pub trait Indicators: Send {
    fn signal(&mut self, signal: Signal);
}

/// Indicators that only log
#[derive(Debug, Default)]
pub struct LogIndicators;

impl Indicators for LogIndicators {
    fn signal(&mut self, signal: Signal) {
        match signal {
            Signal::StatusBlink => tracing::trace!("status_led_blink"),
            other => debug!(signal = ?other, "indicator_signal"),
        }
    }
}

/// Indicators that remember every signal, for assertions
#[derive(Debug, Clone, Default)]
pub struct RecordingIndicators {
    log: Arc<Mutex<Vec<Signal>>>,
}

impl RecordingIndicators {
    pub fn signals(&self) -> Vec<Signal> {
        self.log.lock().clone()
    }

    pub fn count(&self, signal: Signal) -> usize {
        self.log.lock().iter().filter(|s| **s == signal).count()
    }
}

impl Indicators for RecordingIndicators {
    fn signal(&mut self, signal: Signal) {
        if signal != Signal::StatusBlink {
            self.log.lock().push(signal);
        }
    }
}

/// Reading fed to a simulated sensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Distance(f32),
    NoEcho,
}

#[derive(Debug)]
struct SensorFeed {
    queued: VecDeque<Reading>,
    resting: Reading,
}

/// Sensor driven by a script of readings. Once the script runs out it keeps
/// returning the resting reading.
pub struct SimulatedSensor {
    feed: Arc<Mutex<SensorFeed>>,
}

/// Producer side of a `SimulatedSensor`
#[derive(Clone)]
pub struct SensorHandle {
    feed: Arc<Mutex<SensorFeed>>,
}

impl SimulatedSensor {
    pub fn new(resting_cm: f32) -> (Self, SensorHandle) {
        let feed = Arc::new(Mutex::new(SensorFeed {
            queued: VecDeque::new(),
            resting: Reading::Distance(resting_cm),
        }));
        (Self { feed: feed.clone() }, SensorHandle { feed })
    }
}

impl SensorHandle {
    pub fn push(&self, reading: Reading) {
        self.feed.lock().queued.push_back(reading);
    }

    pub fn push_cm(&self, cm: f32) {
        self.push(Reading::Distance(cm));
    }

    /// Reading returned once the queue is empty
    pub fn set_resting(&self, reading: Reading) {
        self.feed.lock().resting = reading;
    }

    pub fn pending(&self) -> usize {
        self.feed.lock().queued.len()
    }
}

impl RangeSensor for SimulatedSensor {
    fn ping(&mut self, max_wait: Duration) -> Option<Duration> {
        let reading = {
            let mut feed = self.feed.lock();
            let resting = feed.resting;
            feed.queued.pop_front().unwrap_or(resting)
        };
        match reading {
            Reading::Distance(cm) => {
                let echo = Duration::from_micros((cm.max(0.0) * ECHO_US_PER_CM) as u64);
                (echo <= max_wait).then_some(echo)
            }
            Reading::NoEcho => None,
        }
    }
}

#[derive(Debug)]
struct ServoState {
    target: u8,
    angle: f32,
    last_update: Option<Instant>,
    stuck: bool,
}

/// Servo that sweeps toward the commanded angle at a fixed rate
pub struct SimulatedServo {
    state: Arc<Mutex<ServoState>>,
    deg_per_sec: f32,
}

/// Fault-injection handle for a `SimulatedServo`
#[derive(Clone)]
pub struct ServoHandle {
    state: Arc<Mutex<ServoState>>,
}

impl SimulatedServo {
    pub fn new(initial_angle: u8, deg_per_sec: f32) -> (Self, ServoHandle) {
        let state = Arc::new(Mutex::new(ServoState {
            target: initial_angle,
            angle: initial_angle as f32,
            last_update: None,
            stuck: false,
        }));
        (Self { state: state.clone(), deg_per_sec }, ServoHandle { state })
    }
}

impl ServoHandle {
    /// A stuck servo ignores commands and stays where it is
    pub fn set_stuck(&self, stuck: bool) {
        self.state.lock().stuck = stuck;
    }

    pub fn angle(&self) -> u8 {
        self.state.lock().angle.round() as u8
    }
}

impl Servo for SimulatedServo {
    fn command(&mut self, angle: u8) {
        self.state.lock().target = angle;
    }

    fn position(&mut self, now: Instant) -> Option<u8> {
        let mut state = self.state.lock();
        let elapsed = state.last_update.map(|t| now.saturating_duration_since(t)).unwrap_or_default();
        state.last_update = Some(now);

        if !state.stuck {
            let step = self.deg_per_sec * elapsed.as_secs_f32();
            let target = state.target as f32;
            let delta = target - state.angle;
            state.angle = if delta.abs() <= step { target } else { state.angle + step * delta.signum() };
        }
        Some(state.angle.round() as u8)
    }
}
