//! Access orchestration on the actuator controller
//!
//! The AccessOrchestrator is the control loop that coordinates:
//! - Presence detection (distance monitor)
//! - Capture and authorization over the serial link
//! - Gate actuation and operator signals
//! - Security alerts (handed to the alert worker)
//! - Access records (sent to the vision node as ACCESS_LOG notices)
//!
//! Everything advances from `tick(now)`; no call blocks.

mod handlers;

use crate::domain::types::{
    new_uuid_v7, AccessRecord, AccessState, AuthorizationVerdict, CorrelationId, DetectionEvent,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::hardware::{Indicators, RangeSensor, Servo, Signal};
use crate::io::link::{SerialLink, Transport};
use crate::services::alert_worker::AlertSender;
use crate::services::authorizer::PlateAuthorizer;
use crate::services::distance_monitor::{DistanceMonitor, MonitorEvent};
use crate::services::gate::GateActuator;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

/// Status LED toggle period while idle
const STATUS_BLINK_INTERVAL: Duration = Duration::from_millis(500);
/// Transient phases resolved within one tick
const MAX_STEPS_PER_TICK: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Phase {
    Idle,
    Detected,
    Capturing { corr: CorrelationId, until: Instant },
    Authorizing,
    Granted(AuthorizationVerdict),
    Denied(AuthorizationVerdict),
    Open,
    Cooldown { until: Instant },
    Error { reason: &'static str },
    /// `actuator` is set when the servo is the failed part
    Halted { reason: String, actuator: bool },
}

impl Phase {
    fn state(&self) -> AccessState {
        match self {
            Phase::Idle => AccessState::Idle,
            Phase::Detected => AccessState::Detected,
            Phase::Capturing { .. } => AccessState::Capturing,
            Phase::Authorizing => AccessState::Authorizing,
            Phase::Granted(_) => AccessState::Granted,
            Phase::Denied(_) => AccessState::Denied,
            Phase::Open => AccessState::Open,
            Phase::Cooldown { .. } => AccessState::Cooldown,
            Phase::Error { .. } => AccessState::Error,
            Phase::Halted { .. } => AccessState::Halted,
        }
    }

    /// Between detection and the end of actuation
    fn in_cycle(&self) -> bool {
        matches!(
            self,
            Phase::Detected
                | Phase::Capturing { .. }
                | Phase::Authorizing
                | Phase::Granted(_)
                | Phase::Denied(_)
                | Phase::Open
        )
    }
}

/// One detection-to-cooldown pass
#[derive(Debug, Clone)]
pub(crate) struct Cycle {
    pub(crate) id: String,
    pub(crate) detection: DetectionEvent,
    /// DETECTED must reach a verdict before this
    pub(crate) deadline: Instant,
}

pub struct AccessOrchestrator<S: RangeSensor, V: Servo, I: Indicators, T: Transport> {
    pub(crate) config: Config,
    pub(crate) monitor: DistanceMonitor<S>,
    pub(crate) gate: GateActuator<V>,
    pub(crate) indicators: I,
    pub(crate) link: SerialLink<T>,
    pub(crate) authorizer: PlateAuthorizer,
    pub(crate) alerts: AlertSender,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) phase: Phase,
    pub(crate) cycle: Option<Cycle>,
    pub(crate) last_verdict: Option<AuthorizationVerdict>,
    /// Error LED and buzzer latched until `reset`
    pub(crate) alarm: bool,
    pub(crate) access_led: bool,
    /// Access records the link has not yet confirmed
    pub(crate) unconfirmed_records: Vec<(CorrelationId, AccessRecord)>,
    next_blink: Option<Instant>,
    next_status: Option<Instant>,
}

impl<S: RangeSensor, V: Servo, I: Indicators, T: Transport> AccessOrchestrator<S, V, I, T> {
    pub fn new(
        config: &Config,
        sensor: S,
        servo: V,
        indicators: I,
        link: SerialLink<T>,
        alerts: AlertSender,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config: config.clone(),
            monitor: DistanceMonitor::new(sensor, config),
            gate: GateActuator::new(servo, config),
            indicators,
            link,
            authorizer: PlateAuthorizer::new(config),
            alerts,
            metrics,
            phase: Phase::Idle,
            cycle: None,
            last_verdict: None,
            alarm: false,
            access_led: false,
            unconfirmed_records: Vec::new(),
            next_blink: None,
            next_status: None,
        }
    }

    pub fn state(&self) -> AccessState {
        self.phase.state()
    }

    pub fn gate(&self) -> &GateActuator<V> {
        &self.gate
    }

    pub fn last_verdict(&self) -> Option<&AuthorizationVerdict> {
        self.last_verdict.as_ref()
    }

    pub fn is_alarm_active(&self) -> bool {
        self.alarm
    }

    pub fn is_peer_reachable(&self, now: Instant) -> bool {
        self.link.is_peer_reachable(now)
    }

    /// One control loop iteration
    pub fn tick(&mut self, now: Instant) {
        let started = Instant::now();
        let events = self.link.poll(now);
        self.settle_access_records(&events);

        let actuator_down = matches!(self.phase, Phase::Halted { actuator: true, .. });
        if !actuator_down {
            if let Err(fault) = self.gate.tick(now) {
                self.halt(fault.to_string(), true);
            }
        }
        if self.access_led && !self.gate.is_open() {
            self.access_led = false;
            self.indicators.signal(Signal::AccessLedOff);
        }

        if !matches!(self.phase, Phase::Halted { .. }) {
            let idle = self.phase == Phase::Idle;
            match self.monitor.tick(now, idle) {
                Some(MonitorEvent::Detection(event)) => self.start_cycle(event, now),
                Some(MonitorEvent::ArrivedWhileBusy { distance_cm }) => {
                    self.on_busy_arrival(distance_cm)
                }
                Some(MonitorEvent::SensorFault { invalid_streak }) => {
                    self.halt(format!("{invalid_streak} consecutive invalid sensor samples"), false)
                }
                None => {}
            }
        }

        self.check_deadline(now);

        for _ in 0..MAX_STEPS_PER_TICK {
            let Some(next) = self.step(&events, now) else {
                break;
            };
            self.enter(next);
        }

        self.emit_status(now);
        self.metrics.record_tick(started.elapsed().as_micros() as u64);
    }

    /// Manual reset: leave HALTED and silence the alarm
    pub fn reset(&mut self, now: Instant) {
        if let Phase::Halted { actuator: true, .. } = self.phase {
            self.gate.close_now(now);
        }
        if self.alarm {
            self.alarm = false;
            self.indicators.signal(Signal::AlarmOff);
        }
        self.monitor.reset();
        if matches!(self.phase, Phase::Halted { .. }) {
            info!("system_reset");
            self.cycle = None;
            self.enter(Phase::Idle);
        }
    }

    /// Drive the orchestrator on a fixed tick until shutdown. Each message on
    /// `resets` is an operator reset.
    pub async fn run(mut self, mut resets: mpsc::Receiver<()>, mut shutdown: watch::Receiver<bool>) {
        let tick_interval = self.config.tick_interval();
        info!(tick_ms = %tick_interval.as_millis(), "orchestrator_started");
        let mut ticker = interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(state = self.state().as_str(), "orchestrator_shutdown");
                        return;
                    }
                }
                Some(()) = resets.recv() => self.reset(Instant::now()),
                _ = ticker.tick() => self.tick(Instant::now()),
            }
        }
    }

    fn emit_status(&mut self, now: Instant) {
        if self.phase == Phase::Idle && self.next_blink.map_or(true, |t| now >= t) {
            self.indicators.signal(Signal::StatusBlink);
            self.next_blink = Some(now + STATUS_BLINK_INTERVAL);
        }

        if !self.config.debug_enabled() || self.next_status.is_some_and(|t| now < t) {
            return;
        }
        self.next_status = Some(now + self.config.debug_interval());

        let gate = self.gate.state();
        info!(
            state = self.state().as_str(),
            distance_cm = ?self.monitor.last_distance(),
            gate_angle = ?gate.angle,
            gate_open = self.gate.is_open(),
            peer_reachable = self.link.is_peer_reachable(now),
            alarm = self.alarm,
            "status"
        );
        self.metrics.report().log();
    }

    fn start_cycle(&mut self, detection: DetectionEvent, now: Instant) {
        let cycle = Cycle {
            id: new_uuid_v7(),
            detection,
            deadline: now + self.config.process_timeout(),
        };
        info!(cycle_id = %cycle.id, distance_cm = %detection.distance_cm, "cycle_started");
        self.metrics.record_cycle_started();
        self.cycle = Some(cycle);
        self.enter(Phase::Detected);
    }

    fn enter(&mut self, next: Phase) {
        let from = self.phase.state();
        let to = next.state();
        if from != to {
            info!(
                cycle_id = self.cycle.as_ref().map(|c| c.id.as_str()).unwrap_or("-"),
                from = from.as_str(),
                to = to.as_str(),
                "state_transition"
            );
        }
        self.phase = next;
    }
}
