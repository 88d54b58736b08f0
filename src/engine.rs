//! # Engine State Machine
//!
//! Turns the per-tick external-power reading into a debounced engine state.
//!
//! - `Off → On` happens on the first tick that sees external power.
//! - `On → Off` happens only once power has been absent for the whole
//!   cooldown, measured from the last tick that saw power. A short dip while
//!   idling never ends a ride.
//!
//! External power is taken to mean "engine running". This conflates key-on
//! with engine-on, which is the accepted behaviour of the rig.

use tokio::time::{Duration, Instant};

use crate::types::EngineState;

/// Hysteresis state machine for engine detection.
///
/// Pure with respect to its inputs: callers pass in the power reading and
/// the current instant.
///
/// # Examples
///
/// ```
/// use ride_recorder::engine::EngineStateMachine;
/// use ride_recorder::types::EngineState;
/// use tokio::time::{Duration, Instant};
///
/// let mut engine = EngineStateMachine::new(Duration::from_secs(30));
/// let t0 = Instant::now();
///
/// assert_eq!(engine.update(true, t0), EngineState::On);
/// assert_eq!(engine.update(false, t0 + Duration::from_secs(10)), EngineState::On);
/// assert_eq!(engine.update(false, t0 + Duration::from_secs(30)), EngineState::Off);
/// ```
#[derive(Debug, Clone)]
pub struct EngineStateMachine {
    cooldown: Duration,
    state: EngineState,
    last_powered: Option<Instant>,
}

impl EngineStateMachine {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            state: EngineState::Off,
            last_powered: None,
        }
    }

    /// Feed one power reading and return the resulting state
    pub fn update(&mut self, powered: bool, now: Instant) -> EngineState {
        if powered {
            self.last_powered = Some(now);
            self.state = EngineState::On;
            return self.state;
        }

        if self.state == EngineState::On {
            let unpowered_for = self
                .last_powered
                .map(|seen| now.saturating_duration_since(seen))
                .unwrap_or(self.cooldown);

            if unpowered_for >= self.cooldown {
                self.state = EngineState::Off;
            }
        }

        self.state
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Time left before a pending `On → Off` fires, if power is currently absent
    pub fn remaining_cooldown(&self, now: Instant) -> Option<Duration> {
        if self.state != EngineState::On {
            return None;
        }
        let seen = self.last_powered?;
        let elapsed = now.saturating_duration_since(seen);
        if elapsed.is_zero() {
            return None;
        }
        Some(self.cooldown.saturating_sub(elapsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(200);

    fn tick(base: Instant, n: u32) -> Instant {
        base + TICK * n
    }

    #[test]
    fn test_initial_state_is_off() {
        let engine = EngineStateMachine::new(Duration::from_secs(30));
        assert_eq!(engine.state(), EngineState::Off);
    }

    #[test]
    fn test_unpowered_stays_off() {
        let mut engine = EngineStateMachine::new(TICK * 5);
        let base = Instant::now();
        for n in 0..20 {
            assert_eq!(engine.update(false, tick(base, n)), EngineState::Off);
        }
    }

    #[test]
    fn test_turns_on_at_first_powered_tick() {
        let mut engine = EngineStateMachine::new(TICK * 5);
        let base = Instant::now();
        assert_eq!(engine.update(false, tick(base, 1)), EngineState::Off);
        assert_eq!(engine.update(false, tick(base, 2)), EngineState::Off);
        assert_eq!(engine.update(true, tick(base, 3)), EngineState::On);
    }

    #[test]
    fn test_cooldown_scenario() {
        // Power true on ticks 1-3, false on ticks 4-13, cooldown of 5 ticks
        let mut engine = EngineStateMachine::new(TICK * 5);
        let base = Instant::now();
        let readings: Vec<bool> = [true; 3].into_iter().chain([false; 10]).collect();

        let states: Vec<EngineState> = readings
            .iter()
            .enumerate()
            .map(|(i, &powered)| engine.update(powered, tick(base, i as u32 + 1)))
            .collect();

        for n in 1..=7 {
            assert_eq!(states[n - 1], EngineState::On, "tick {} should still be on", n);
        }
        for n in 8..=13 {
            assert_eq!(states[n - 1], EngineState::Off, "tick {} should be off", n);
        }
    }

    #[test]
    fn test_single_false_reading_never_turns_off() {
        let mut engine = EngineStateMachine::new(TICK * 5);
        let base = Instant::now();
        for n in 0..50 {
            // Alternating dips never accumulate a full cooldown
            let powered = n % 2 == 0;
            assert_eq!(engine.update(powered, tick(base, n)), EngineState::On);
        }
    }

    #[test]
    fn test_power_return_resets_cooldown() {
        let mut engine = EngineStateMachine::new(TICK * 5);
        let base = Instant::now();
        engine.update(true, tick(base, 0));
        for n in 1..=4 {
            assert_eq!(engine.update(false, tick(base, n)), EngineState::On);
        }
        engine.update(true, tick(base, 5));
        for n in 6..=9 {
            assert_eq!(engine.update(false, tick(base, n)), EngineState::On);
        }
        assert_eq!(engine.update(false, tick(base, 10)), EngineState::Off);
    }

    #[test]
    fn test_restart_after_off() {
        let mut engine = EngineStateMachine::new(TICK * 2);
        let base = Instant::now();
        engine.update(true, tick(base, 0));
        assert_eq!(engine.update(false, tick(base, 2)), EngineState::Off);
        assert_eq!(engine.update(true, tick(base, 3)), EngineState::On);
    }

    #[test]
    fn test_remaining_cooldown() {
        let mut engine = EngineStateMachine::new(Duration::from_secs(30));
        let base = Instant::now();
        assert_eq!(engine.remaining_cooldown(base), None);

        engine.update(true, base);
        assert_eq!(engine.remaining_cooldown(base), None);

        let later = base + Duration::from_secs(10);
        engine.update(false, later);
        assert_eq!(engine.remaining_cooldown(later), Some(Duration::from_secs(20)));
    }
}
