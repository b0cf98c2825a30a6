//! Servo gate with category-keyed auto-close
//!
//! First come, first served: a grant while the gate is already open keeps
//! the original close schedule.

use crate::domain::error::GateError;
use crate::domain::types::AuthCategory;
use crate::infra::config::Config;
use crate::io::hardware::Servo;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateState {
    /// Last angle read back from the servo
    pub angle: Option<u8>,
    pub opened_at: Option<Instant>,
    pub scheduled_close_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct Motion {
    target: u8,
    deadline: Instant,
}

pub struct GateActuator<V: Servo> {
    servo: V,
    config: Config,
    state: GateState,
    motion: Option<Motion>,
}

impl<V: Servo> GateActuator<V> {
    pub fn new(servo: V, config: &Config) -> Self {
        Self { servo, config: config.clone(), state: GateState::default(), motion: None }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// Gate is commanded open (moving or at rest) and not yet closing
    pub fn is_open(&self) -> bool {
        self.state.scheduled_close_at.is_some()
    }

    pub fn is_moving(&self) -> bool {
        self.motion.is_some()
    }

    /// Reached the open angle and resting there
    pub fn is_fully_open(&self) -> bool {
        self.is_open() && !self.is_moving() && self.state.angle == Some(self.config.open_angle())
    }

    /// Open for a granting category and return when it will close.
    pub fn open(&mut self, category: AuthCategory, now: Instant) -> Result<Instant, GateError> {
        let duration =
            self.config.open_duration(category).ok_or(GateError::NotGranted(category.as_str()))?;

        if let Some(close_at) = self.state.scheduled_close_at {
            info!(
                category = category.as_str(),
                remaining_ms = %close_at.saturating_duration_since(now).as_millis(),
                "gate_already_open"
            );
            return Ok(close_at);
        }

        let close_at = now + duration;
        self.state.opened_at = Some(now);
        self.state.scheduled_close_at = Some(close_at);
        self.drive(self.config.open_angle(), now);
        info!(category = category.as_str(), open_ms = %duration.as_millis(), "gate_opening");
        Ok(close_at)
    }

    /// Close immediately, cancelling the auto-close
    pub fn close_now(&mut self, now: Instant) {
        if self.state.scheduled_close_at.take().is_some() {
            info!("gate_closed_manually");
        }
        self.state.opened_at = None;
        self.drive(self.config.closed_angle(), now);
    }

    /// Read back the servo, fire the auto-close, and check travel time.
    pub fn tick(&mut self, now: Instant) -> Result<(), GateError> {
        self.state.angle = self.servo.position(now);

        if let Some(close_at) = self.state.scheduled_close_at {
            if now >= close_at {
                let held = self.state.opened_at.map(|t| now.saturating_duration_since(t));
                self.state.scheduled_close_at = None;
                self.state.opened_at = None;
                self.drive(self.config.closed_angle(), now);
                info!(held_ms = ?held.map(|d| d.as_millis()), "gate_auto_close");
            }
        }

        let Some(motion) = self.motion else {
            return Ok(());
        };

        if self.state.angle == Some(motion.target) {
            self.motion = None;
            debug!(angle = motion.target, "gate_reached_target");
            return Ok(());
        }

        if now >= motion.deadline {
            self.motion = None;
            let fault = GateError::ActuatorFault {
                target: motion.target,
                last: self.state.angle,
                timeout: self.config.servo_travel_timeout(),
            };
            error!(error = %fault, "gate_actuator_fault");
            return Err(fault);
        }
        Ok(())
    }

    fn drive(&mut self, target: u8, now: Instant) {
        if self.motion.map(|m| m.target) == Some(target) {
            return;
        }
        if self.motion.is_some() {
            warn!(target, "gate_reversing");
        }
        self.servo.command(target);
        self.motion = Some(Motion { target, deadline: now + self.travel_timeout() });
    }

    fn travel_timeout(&self) -> Duration {
        self.config.servo_travel_timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::hardware::{ServoHandle, SimulatedServo};

    const TICK: Duration = Duration::from_millis(50);

    fn gate() -> (GateActuator<SimulatedServo>, ServoHandle) {
        let (servo, handle) = SimulatedServo::new(0, 180.0);
        (GateActuator::new(servo, &Config::default()), handle)
    }

    /// Tick until `until`, returning the first error
    fn run(g: &mut GateActuator<SimulatedServo>, now: &mut Instant, until: Instant) -> Result<(), GateError> {
        while *now < until {
            *now += TICK;
            g.tick(*now)?;
        }
        Ok(())
    }

    #[test]
    fn test_resident_open_then_auto_close() {
        let (mut g, servo) = gate();
        let t0 = Instant::now();
        let mut now = t0;
        g.tick(now).unwrap();

        let close_at = g.open(AuthCategory::Resident, now).unwrap();
        assert_eq!(close_at, t0 + Duration::from_millis(7000));
        assert!(g.is_moving());

        run(&mut g, &mut now, t0 + Duration::from_millis(1000)).unwrap();
        assert!(g.is_fully_open());
        assert_eq!(servo.angle(), 90);

        run(&mut g, &mut now, t0 + Duration::from_millis(6950)).unwrap();
        assert!(g.is_open());

        run(&mut g, &mut now, t0 + Duration::from_millis(8000)).unwrap();
        assert!(!g.is_open());
        assert_eq!(servo.angle(), 0);
        assert_eq!(g.state().angle, Some(0));
    }

    #[test]
    fn test_open_duration_by_category() {
        let t0 = Instant::now();
        for (category, ms) in [
            (AuthCategory::Temporary, 6000),
            (AuthCategory::Emergency, 5000),
        ] {
            let (mut g, _) = gate();
            assert_eq!(g.open(category, t0).unwrap(), t0 + Duration::from_millis(ms));
        }
    }

    #[test]
    fn test_denied_never_opens() {
        let (mut g, _) = gate();
        let now = Instant::now();
        assert_eq!(g.open(AuthCategory::Denied, now), Err(GateError::NotGranted("denied")));
        assert_eq!(g.open(AuthCategory::Error, now), Err(GateError::NotGranted("error")));
        assert!(!g.is_open());
        assert!(!g.is_moving());
    }

    #[test]
    fn test_second_grant_keeps_original_schedule() {
        let (mut g, _) = gate();
        let t0 = Instant::now();
        let first = g.open(AuthCategory::Resident, t0).unwrap();
        let second = g.open(AuthCategory::Emergency, t0 + Duration::from_millis(3000)).unwrap();
        assert_eq!(first, second);
        assert_eq!(g.state().opened_at, Some(t0));
    }

    #[test]
    fn test_manual_close_preempts_auto_close() {
        let (mut g, servo) = gate();
        let t0 = Instant::now();
        let mut now = t0;
        g.open(AuthCategory::Resident, now).unwrap();
        run(&mut g, &mut now, t0 + Duration::from_millis(1000)).unwrap();

        g.close_now(now);
        assert!(!g.is_open());
        run(&mut g, &mut now, t0 + Duration::from_millis(9000)).unwrap();
        assert_eq!(servo.angle(), 0);
        assert!(!g.is_moving());
    }

    #[test]
    fn test_stuck_servo_is_actuator_fault() {
        let (mut g, servo) = gate();
        servo.set_stuck(true);
        let t0 = Instant::now();
        let mut now = t0;
        g.open(AuthCategory::Resident, now).unwrap();

        let err = run(&mut g, &mut now, t0 + Duration::from_millis(3000)).unwrap_err();
        assert!(matches!(err, GateError::ActuatorFault { target: 90, last: Some(0), .. }));
        assert!(now - t0 >= Duration::from_millis(2000));
    }
}
