//! Advertising lifecycle: start/stop broadcast, exponential backoff on start
//! failure, automatic restart when the radio comes back.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::core::Action;
use crate::timer::{TimerId, TimerKind, TimerSlot};

/// Why the transport could not start advertising.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum AdvertiseError {
    #[error("advertising already started")]
    AlreadyStarted,
    #[error("advertisement data too large")]
    DataTooLarge,
    #[error("advertising not supported")]
    FeatureUnsupported,
    #[error("internal radio error")]
    InternalError,
    #[error("too many advertisers")]
    TooManyAdvertisers,
    #[error("advertise failed with code {0}")]
    Other(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiseState {
    Idle,
    Starting,
    Running,
    BackingOff,
}

pub struct AdvertisingController {
    desired: bool,
    paused: bool,
    radio_available: bool,
    state: AdvertiseState,
    retries: u32,
    max_retries: u32,
    timer: TimerSlot,
}

impl AdvertisingController {
    pub fn new(max_retries: u32) -> Self {
        Self {
            desired: false,
            paused: false,
            radio_available: true,
            state: AdvertiseState::Idle,
            retries: 0,
            max_retries,
            timer: TimerSlot::new(TimerKind::Advertise),
        }
    }

    pub fn state(&self) -> AdvertiseState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.desired
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn set_max_retries(&mut self, max_retries: u32) {
        self.max_retries = max_retries;
    }

    pub fn enable(&mut self, config: &DiscoveryConfig, out: &mut Vec<Action>) {
        self.desired = true;
        if self.state != AdvertiseState::Idle {
            return;
        }
        self.try_start(config, out);
    }

    pub fn disable(&mut self, out: &mut Vec<Action>) {
        if !self.desired && self.state == AdvertiseState::Idle {
            return;
        }
        self.desired = false;
        self.stop(out);
        info!("advertising disabled");
    }

    pub fn set_paused(&mut self, paused: bool, config: &DiscoveryConfig, out: &mut Vec<Action>) {
        if self.paused == paused {
            return;
        }
        self.paused = paused;
        if paused {
            self.stop(out);
        } else if self.desired {
            self.try_start(config, out);
        }
    }

    /// Restart a live advertisement so it carries fresh identity.
    pub fn restart(&mut self, config: &DiscoveryConfig, out: &mut Vec<Action>) {
        if matches!(self.state, AdvertiseState::Starting | AdvertiseState::Running) {
            out.push(Action::StopAdvertising);
            self.state = AdvertiseState::Idle;
            self.try_start(config, out);
        }
    }

    pub fn on_started(&mut self, out: &mut Vec<Action>) {
        if self.state != AdvertiseState::Starting {
            if !self.desired || self.paused {
                // came up after we stopped wanting it
                out.push(Action::StopAdvertising);
            }
            return;
        }
        info!("advertising started");
        self.state = AdvertiseState::Running;
        self.retries = 0;
    }

    /// Handle a start failure. Returns the error once retries are exhausted;
    /// advertising is then disabled.
    pub fn on_failed(
        &mut self,
        error: AdvertiseError,
        out: &mut Vec<Action>,
    ) -> Option<AdvertiseError> {
        if self.state != AdvertiseState::Starting {
            debug!(%error, "ignoring advertise failure outside a start attempt");
            return None;
        }
        warn!(%error, retries = self.retries, "advertise failed");
        if self.retries < self.max_retries {
            self.retries += 1;
            let delay = backoff(self.retries);
            debug!(?delay, attempt = self.retries, "scheduling advertise retry");
            self.timer.arm(delay, out);
            self.state = AdvertiseState::BackingOff;
            None
        } else {
            warn!(%error, "advertise retries exhausted; disabling advertising");
            self.desired = false;
            self.state = AdvertiseState::Idle;
            self.retries = 0;
            Some(error)
        }
    }

    pub fn on_timer(&mut self, timer: TimerId, config: &DiscoveryConfig, out: &mut Vec<Action>) {
        if !self.timer.fire(timer) || self.state != AdvertiseState::BackingOff {
            return;
        }
        out.push(Action::StopAdvertising);
        self.state = AdvertiseState::Idle;
        self.try_start(config, out);
    }

    /// Track radio power. The radio going away takes the advertisement with it;
    /// when it returns, advertising resumes if it is still wanted.
    pub fn set_radio_available(
        &mut self,
        available: bool,
        config: &DiscoveryConfig,
        out: &mut Vec<Action>,
    ) {
        if self.radio_available == available {
            return;
        }
        self.radio_available = available;
        if available {
            if self.desired && self.state == AdvertiseState::Idle {
                info!("radio available; resuming advertising");
                self.try_start(config, out);
            }
        } else {
            self.timer.cancel(out);
            self.state = AdvertiseState::Idle;
        }
    }

    fn try_start(&mut self, config: &DiscoveryConfig, out: &mut Vec<Action>) {
        if self.paused {
            return;
        }
        if !self.radio_available {
            info!("radio unavailable; advertising deferred");
            return;
        }
        out.push(Action::StartAdvertising {
            local_name: config.local_name.clone(),
            service_id: config.service_id,
            include_name: config.name_fits_advertisement(),
        });
        self.state = AdvertiseState::Starting;
    }

    fn stop(&mut self, out: &mut Vec<Action>) {
        self.timer.cancel(out);
        if self.state != AdvertiseState::Idle {
            out.push(Action::StopAdvertising);
        }
        self.state = AdvertiseState::Idle;
        self.retries = 0;
    }
}

/// Delay before retry number `attempt` (1-based): 2^attempt seconds.
fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(16))
}
