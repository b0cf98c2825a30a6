//! Ultrasonic presence detection with two-sample debounce
//!
//! A detection is the rising edge of "vehicle in range" seen while the
//! orchestrator is idle. Once latched, the same vehicle never fires again
//! until two clear samples are seen.

use crate::domain::error::SensorError;
use crate::domain::types::{epoch_ms, DetectionEvent};
use crate::infra::config::Config;
use crate::io::hardware::{RangeSensor, ECHO_US_PER_CM};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

/// Consecutive samples needed to declare presence or clearance
const DEBOUNCE_SAMPLES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorEvent {
    Detection(DetectionEvent),
    /// A new vehicle arrived while the orchestrator was busy. Reported once
    /// per arrival; it becomes a detection later if still present.
    ArrivedWhileBusy { distance_cm: f32 },
    /// Too many consecutive invalid samples
    SensorFault { invalid_streak: u32 },
}

pub struct DistanceMonitor<S: RangeSensor> {
    sensor: S,
    detection_cm: f32,
    min_cm: f32,
    max_cm: f32,
    echo_timeout: Duration,
    cooldown: Duration,
    fault_threshold: u32,
    in_streak: u32,
    out_streak: u32,
    invalid_streak: u32,
    /// Current vehicle already produced its event
    latched: bool,
    busy_reported: bool,
    faulted: bool,
    last_event: Option<Instant>,
    last_distance: Option<f32>,
}

impl<S: RangeSensor> DistanceMonitor<S> {
    pub fn new(sensor: S, config: &Config) -> Self {
        Self {
            sensor,
            detection_cm: config.detection_cm(),
            min_cm: config.min_cm(),
            max_cm: config.max_cm(),
            echo_timeout: config.echo_timeout(),
            cooldown: config.cooldown(),
            fault_threshold: config.sensor_fault_threshold(),
            in_streak: 0,
            out_streak: 0,
            invalid_streak: 0,
            latched: false,
            busy_reported: false,
            faulted: false,
            last_event: None,
            last_distance: None,
        }
    }

    /// Last valid distance, for status reports
    pub fn last_distance(&self) -> Option<f32> {
        self.last_distance
    }

    /// One measurement
    pub fn sample(&mut self) -> Result<f32, SensorError> {
        let echo = self
            .sensor
            .ping(self.echo_timeout)
            .ok_or(SensorError::EchoTimeout(self.echo_timeout))?;
        let distance_cm = echo.as_micros() as f32 / ECHO_US_PER_CM;
        if distance_cm < self.min_cm || distance_cm > self.max_cm {
            return Err(SensorError::OutOfRange(distance_cm));
        }
        Ok(distance_cm)
    }

    /// Sample once and update debounce state. `idle` is whether the
    /// orchestrator can take a new cycle right now.
    pub fn tick(&mut self, now: Instant, idle: bool) -> Option<MonitorEvent> {
        if self.faulted {
            return None;
        }

        let distance_cm = match self.sample() {
            Ok(d) => d,
            Err(e) => {
                self.invalid_streak += 1;
                trace!(error = %e, invalid_streak = self.invalid_streak, "sensor_sample_invalid");
                if self.invalid_streak >= self.fault_threshold {
                    self.faulted = true;
                    error!(invalid_streak = self.invalid_streak, "sensor_fault");
                    return Some(MonitorEvent::SensorFault { invalid_streak: self.invalid_streak });
                }
                return None;
            }
        };
        self.invalid_streak = 0;
        self.last_distance = Some(distance_cm);

        if distance_cm >= self.detection_cm {
            self.in_streak = 0;
            self.out_streak += 1;
            if self.out_streak >= DEBOUNCE_SAMPLES && (self.latched || self.busy_reported) {
                debug!(distance_cm = %distance_cm, "vehicle_cleared");
                self.latched = false;
                self.busy_reported = false;
            }
            return None;
        }

        self.out_streak = 0;
        if distance_cm <= self.min_cm {
            self.in_streak = 0;
            return None;
        }
        self.in_streak += 1;

        if self.in_streak < DEBOUNCE_SAMPLES || self.latched {
            return None;
        }

        let cooled = self.last_event.map_or(true, |t| now.saturating_duration_since(t) >= self.cooldown);
        if idle && cooled {
            self.latched = true;
            self.busy_reported = false;
            self.last_event = Some(now);
            info!(distance_cm = %distance_cm, "vehicle_detected");
            return Some(MonitorEvent::Detection(DetectionEvent {
                timestamp: now,
                epoch_ms: epoch_ms(),
                distance_cm,
            }));
        }

        if !idle && !self.busy_reported {
            self.busy_reported = true;
            return Some(MonitorEvent::ArrivedWhileBusy { distance_cm });
        }
        None
    }

    /// Clear debounce and fault state after a manual reset
    pub fn reset(&mut self) {
        self.in_streak = 0;
        self.out_streak = 0;
        self.invalid_streak = 0;
        self.latched = false;
        self.busy_reported = false;
        self.faulted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::hardware::{Reading, SensorHandle, SimulatedSensor};

    const TICK: Duration = Duration::from_millis(50);

    fn monitor() -> (DistanceMonitor<SimulatedSensor>, SensorHandle) {
        let (sensor, handle) = SimulatedSensor::new(200.0);
        (DistanceMonitor::new(sensor, &Config::default()), handle)
    }

    /// Feed readings one per tick, collecting events
    fn feed(
        monitor: &mut DistanceMonitor<SimulatedSensor>,
        handle: &SensorHandle,
        now: &mut Instant,
        readings: &[f32],
        idle: bool,
    ) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        for &cm in readings {
            handle.push_cm(cm);
            *now += TICK;
            events.extend(monitor.tick(*now, idle));
        }
        events
    }

    #[test]
    fn test_two_in_range_samples_detect() {
        let (mut m, h) = monitor();
        let mut now = Instant::now();

        let events = feed(&mut m, &h, &mut now, &[25.0], true);
        assert!(events.is_empty());

        let events = feed(&mut m, &h, &mut now, &[25.0], true);
        assert!(matches!(events.as_slice(), [MonitorEvent::Detection(e)] if (e.distance_cm - 25.0).abs() < 0.1));
    }

    #[test]
    fn test_alternating_samples_never_detect() {
        let (mut m, h) = monitor();
        let mut now = Instant::now();
        let readings: Vec<f32> = (0..40).map(|i| if i % 2 == 0 { 40.0 } else { 20.0 }).collect();
        assert!(feed(&mut m, &h, &mut now, &readings, true).is_empty());
    }

    #[test]
    fn test_invalid_samples_do_not_break_streak() {
        let (mut m, h) = monitor();
        let mut now = Instant::now();

        h.push_cm(25.0);
        h.push(Reading::NoEcho);
        h.push_cm(2.0); // below minimum: invalid
        h.push_cm(25.0);

        let mut events = Vec::new();
        for _ in 0..4 {
            now += TICK;
            events.extend(m.tick(now, true));
        }
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], MonitorEvent::Detection(_)));
    }

    #[test]
    fn test_stationary_vehicle_fires_once() {
        let (mut m, h) = monitor();
        let mut now = Instant::now();
        let readings = vec![20.0; 400]; // 20 s parked
        let events = feed(&mut m, &h, &mut now, &readings, true);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_cooldown_between_detections() {
        let (mut m, h) = monitor();
        let mut now = Instant::now();

        let events = feed(&mut m, &h, &mut now, &[20.0, 20.0], true);
        let [MonitorEvent::Detection(first)] = events.as_slice() else { panic!("expected detection") };
        let first_at = first.timestamp;

        // Leaves and a new vehicle arrives quickly
        assert!(feed(&mut m, &h, &mut now, &[100.0, 100.0, 20.0, 20.0], true).is_empty());

        // Stays until cooldown expires, then fires
        let readings = vec![20.0; 120];
        let events = feed(&mut m, &h, &mut now, &readings, true);
        assert_eq!(events.len(), 1);
        let MonitorEvent::Detection(second) = events[0] else { panic!("expected detection") };
        assert!(second.timestamp - first_at >= Duration::from_millis(5000));
        assert!(second.timestamp - first_at < Duration::from_millis(5000) + TICK);
    }

    #[test]
    fn test_busy_arrival_reported_once_then_detected_when_idle() {
        let (mut m, h) = monitor();
        let mut now = Instant::now();

        let events = feed(&mut m, &h, &mut now, &[20.0, 20.0, 20.0, 20.0], false);
        assert_eq!(events, vec![MonitorEvent::ArrivedWhileBusy { distance_cm: 20.0 }]);

        let events = feed(&mut m, &h, &mut now, &[20.0], true);
        assert!(matches!(events.as_slice(), [MonitorEvent::Detection(_)]));
    }

    #[test]
    fn test_permanent_invalid_is_fault() {
        let (mut m, h) = monitor();
        h.set_resting(Reading::NoEcho);
        let mut now = Instant::now();

        let mut events = Vec::new();
        for _ in 0..150 {
            now += TICK;
            events.extend(m.tick(now, true));
        }
        assert_eq!(events, vec![MonitorEvent::SensorFault { invalid_streak: 100 }]);

        m.reset();
        h.set_resting(Reading::Distance(200.0));
        now += TICK;
        assert_eq!(m.tick(now, true), None);
        assert_eq!(m.last_distance(), Some(200.0));
    }
}
