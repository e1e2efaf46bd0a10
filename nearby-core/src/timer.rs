//! Single owned timer per subsystem. The host runs the clock; the core only
//! hands out arm/cancel requests and checks fired ids against the current
//! generation, so a superseded timer can never fire twice.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::Action;

/// Subsystem owning a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerKind {
    Scan,
    Advertise,
}

/// Identity of one arming of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerId {
    pub kind: TimerKind,
    pub generation: u64,
}

#[derive(Debug)]
pub struct TimerSlot {
    kind: TimerKind,
    generation: u64,
    armed: bool,
}

impl TimerSlot {
    pub fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            generation: 0,
            armed: false,
        }
    }

    fn current(&self) -> TimerId {
        TimerId {
            kind: self.kind,
            generation: self.generation,
        }
    }

    /// Arm the slot, replacing any pending timer.
    pub fn arm(&mut self, after: Duration, out: &mut Vec<Action>) {
        self.cancel(out);
        self.generation += 1;
        self.armed = true;
        out.push(Action::ArmTimer {
            timer: self.current(),
            after,
        });
    }

    pub fn cancel(&mut self, out: &mut Vec<Action>) {
        if self.armed {
            out.push(Action::CancelTimer {
                timer: self.current(),
            });
            self.armed = false;
            self.generation += 1;
        }
    }

    /// Accept a fired timer if it is the one currently armed; disarms the slot.
    pub fn fire(&mut self, timer: TimerId) -> bool {
        if self.armed && timer == self.current() {
            self.armed = false;
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed_id(out: &[Action]) -> TimerId {
        match out.last() {
            Some(Action::ArmTimer { timer, .. }) => *timer,
            other => panic!("expected ArmTimer, got {other:?}"),
        }
    }

    #[test]
    fn rearm_supersedes_previous() {
        let mut slot = TimerSlot::new(TimerKind::Scan);
        let mut out = Vec::new();
        slot.arm(Duration::from_secs(5), &mut out);
        let first = armed_id(&out);
        slot.arm(Duration::from_secs(5), &mut out);
        let second = armed_id(&out);
        assert!(matches!(out[1], Action::CancelTimer { timer } if timer == first));
        assert!(!slot.fire(first));
        assert!(slot.fire(second));
        assert!(!slot.fire(second));
    }

    #[test]
    fn cancelled_timer_is_ignored() {
        let mut slot = TimerSlot::new(TimerKind::Advertise);
        let mut out = Vec::new();
        slot.arm(Duration::from_secs(2), &mut out);
        let id = armed_id(&out);
        slot.cancel(&mut out);
        assert!(!slot.is_armed());
        assert!(!slot.fire(id));
        // cancelling an idle slot emits nothing
        let len = out.len();
        slot.cancel(&mut out);
        assert_eq!(out.len(), len);
    }
}
