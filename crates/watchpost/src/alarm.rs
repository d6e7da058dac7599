//! Arming state machine
//!
//! Pure state: no I/O, no clocks. The engine feeds it one motion verdict
//! per processed cycle and acts on the returned [`CycleOutcome`]; baseline
//! seeding and the alarm signal stay with the engine.

use serde::Serialize;
use std::fmt;

use crate::{Schedule, ScheduleChange};

/// Consecutive-motion count that must be exceeded to trigger
pub const TRIGGER_THRESHOLD: u32 = 20;

/// Arming state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlarmState {
    Disarmed,
    Armed,
    Triggered,
}

impl AlarmState {
    /// Armed or triggered
    pub fn is_armed(&self) -> bool {
        !matches!(self, AlarmState::Disarmed)
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmState::Disarmed => write!(f, "Disarmed"),
            AlarmState::Armed => write!(f, "Armed"),
            AlarmState::Triggered => write!(f, "Triggered"),
        }
    }
}

/// What a cycle did to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Not armed; nothing counted
    Idle,
    /// Counter moved (or stayed at its floor) without a transition
    Counted,
    /// `Armed -> Triggered` happened on this cycle
    Triggered,
}

/// Snapshot returned by `status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmStatus {
    pub state: AlarmState,
    pub manual_override: bool,
    pub next_change: ScheduleChange,
}

#[derive(Debug, Clone)]
pub struct AlarmStateMachine {
    state: AlarmState,
    counter: u32,
    manual_override: bool,
    trigger_threshold: u32,
}

impl Default for AlarmStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AlarmStateMachine {
    pub fn new() -> Self {
        Self::with_threshold(TRIGGER_THRESHOLD)
    }

    /// State machine that triggers once the counter exceeds `threshold`
    pub fn with_threshold(trigger_threshold: u32) -> Self {
        Self {
            state: AlarmState::Disarmed,
            counter: 0,
            manual_override: false,
            trigger_threshold,
        }
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    /// Current debounce count
    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn manual_override(&self) -> bool {
        self.manual_override
    }

    /// Enter `Armed` from any state.
    ///
    /// The counter is kept; only `disarm` and `reset` clear it. Returns the
    /// previous state so the caller can silence a running signal.
    pub fn arm(&mut self) -> AlarmState {
        let previous = self.state;
        self.state = AlarmState::Armed;
        self.manual_override = true;
        previous
    }

    /// Enter `Disarmed` and clear the counter. Idempotent.
    pub fn disarm(&mut self) -> AlarmState {
        let previous = self.state;
        self.state = AlarmState::Disarmed;
        self.counter = 0;
        self.manual_override = true;
        previous
    }

    /// Return from `Triggered` to `Armed` with a cleared counter.
    ///
    /// Returns whether anything changed; outside `Triggered` this is a
    /// no-op.
    pub fn reset(&mut self) -> bool {
        if self.state != AlarmState::Triggered {
            return false;
        }
        self.state = AlarmState::Armed;
        self.counter = 0;
        true
    }

    /// Account one processed cycle.
    ///
    /// Motion advances the counter and may trigger from `Armed`; no motion
    /// decrements it (floor 0). Neither path ever leaves `Triggered`.
    pub fn on_cycle(&mut self, motion: bool) -> CycleOutcome {
        if !self.state.is_armed() {
            return CycleOutcome::Idle;
        }

        if !motion {
            self.counter = self.counter.saturating_sub(1);
            return CycleOutcome::Counted;
        }

        self.counter = self.counter.saturating_add(1);
        if self.state == AlarmState::Armed && self.counter > self.trigger_threshold {
            self.state = AlarmState::Triggered;
            return CycleOutcome::Triggered;
        }
        CycleOutcome::Counted
    }

    /// Current state plus the next scheduled change relative to `hour`
    pub fn status(&self, schedule: &Schedule, hour: u8) -> AlarmStatus {
        AlarmStatus {
            state: self.state,
            manual_override: self.manual_override,
            next_change: schedule.next_change(hour),
        }
    }
}
