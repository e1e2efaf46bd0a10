//! Scan duty cycle: scan for a burst, rest, repeat.
//!
//! Runs only while discovery is enabled and not paused. Every burst end and
//! every stop asks the caller to sweep stale peers.

use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use crate::core::Action;
use crate::timer::{TimerId, TimerKind, TimerSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Stopped,
    Scanning,
    Waiting,
}

pub struct ScanScheduler {
    state: ScanState,
    enabled: bool,
    paused: bool,
    radio_available: bool,
    burst: Duration,
    rest: Duration,
    service_filter: Option<Uuid>,
    timer: TimerSlot,
}

impl ScanScheduler {
    pub fn new(burst: Duration, rest: Duration, service_filter: Option<Uuid>) -> Self {
        Self {
            state: ScanState::Stopped,
            enabled: false,
            paused: false,
            radio_available: true,
            burst,
            rest,
            service_filter,
            timer: TimerSlot::new(TimerKind::Scan),
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn is_scanning(&self) -> bool {
        self.state == ScanState::Scanning
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable the cycle. Enabling an already-enabled scheduler
    /// that was stopped by radio loss restarts it. Returns true when the
    /// caller should sweep stale peers.
    pub fn set_enabled(&mut self, enabled: bool, out: &mut Vec<Action>) -> bool {
        if enabled {
            self.enabled = true;
            if self.state == ScanState::Stopped {
                self.resume(out);
            }
            false
        } else {
            if !self.enabled {
                return false;
            }
            self.enabled = false;
            self.halt(out);
            true
        }
    }

    /// Returns true when the caller should sweep stale peers.
    pub fn set_paused(&mut self, paused: bool, out: &mut Vec<Action>) -> bool {
        if self.paused == paused {
            return false;
        }
        self.paused = paused;
        if paused {
            if !self.enabled {
                return false;
            }
            self.halt(out);
            true
        } else {
            self.resume(out);
            false
        }
    }

    /// Change burst and rest lengths. A running cycle restarts from a fresh burst.
    pub fn set_intervals(&mut self, burst: Duration, rest: Duration, out: &mut Vec<Action>) {
        self.burst = burst;
        self.rest = rest;
        if self.state == ScanState::Stopped {
            return;
        }
        debug!(?burst, ?rest, "scan intervals changed; restarting burst");
        self.timer.cancel(out);
        if self.state == ScanState::Scanning {
            self.timer.arm(self.burst, out);
        } else {
            self.start_burst(out);
        }
    }

    pub fn intervals(&self) -> (Duration, Duration) {
        (self.burst, self.rest)
    }

    /// Returns true when the caller should sweep stale peers.
    pub fn on_timer(&mut self, timer: TimerId, out: &mut Vec<Action>) -> bool {
        if !self.timer.fire(timer) {
            return false;
        }
        match self.state {
            ScanState::Scanning => {
                debug!("scan burst ended");
                out.push(Action::StopScan);
                self.timer.arm(self.rest, out);
                self.state = ScanState::Waiting;
                true
            }
            ScanState::Waiting => {
                if self.can_run() {
                    self.start_burst(out);
                } else {
                    self.state = ScanState::Stopped;
                }
                false
            }
            ScanState::Stopped => false,
        }
    }

    /// Track radio power. Losing the radio stops the cycle; regaining it does
    /// not restart scanning until discovery is enabled again. Returns true
    /// when the caller should sweep stale peers.
    pub fn set_radio_available(&mut self, available: bool, out: &mut Vec<Action>) -> bool {
        self.radio_available = available;
        if available || self.state == ScanState::Stopped {
            return false;
        }
        info!("radio unavailable; scan cycle stopped");
        self.timer.cancel(out);
        self.state = ScanState::Stopped;
        true
    }

    fn can_run(&self) -> bool {
        self.enabled && !self.paused
    }

    fn resume(&mut self, out: &mut Vec<Action>) {
        if !self.can_run() {
            return;
        }
        if !self.radio_available {
            info!("radio unavailable; scan cycle not started");
            return;
        }
        info!("scan cycle started");
        self.start_burst(out);
    }

    fn start_burst(&mut self, out: &mut Vec<Action>) {
        out.push(Action::StartScan {
            service_filter: self.service_filter,
        });
        self.timer.arm(self.burst, out);
        self.state = ScanState::Scanning;
    }

    fn halt(&mut self, out: &mut Vec<Action>) {
        self.timer.cancel(out);
        if self.state == ScanState::Scanning {
            out.push(Action::StopScan);
        }
        if self.state != ScanState::Stopped {
            info!("scan cycle stopped");
        }
        self.state = ScanState::Stopped;
    }
}
