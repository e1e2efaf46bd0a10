//! Host-driven API: DiscoveryCore receives events from host, returns actions.
//!
//! One `DiscoveryCore` is one serialized timeline. The host feeds it every
//! transport callback and timer expiry in order and carries out the returned
//! actions; nothing in here blocks or performs I/O.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::advertise::{AdvertiseError, AdvertiseState, AdvertisingController};
use crate::config::{ConfigError, DiscoveryConfig, RosterOrder};
use crate::identify::{IdentificationCoordinator, SessionEvent, SessionId};
use crate::peer::{PeerId, RosterEntry};
use crate::registry::{Observation, PeerRegistry};
use crate::scan::{ScanScheduler, ScanState};
use crate::timer::{TimerId, TimerKind};

/// Input from the host: transport callbacks, radio state and timer expiries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Observed(Observation),
    ScanFailed(i32),
    Session {
        session: SessionId,
        event: SessionEvent,
    },
    AdvertiseStarted,
    AdvertiseFailed(AdvertiseError),
    RadioAvailability(bool),
    TimerFired(TimerId),
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    StartScan {
        service_filter: Option<Uuid>,
    },
    StopScan,
    StartAdvertising {
        local_name: String,
        service_id: Uuid,
        /// Put the name in the advertisement payload; otherwise peers read it
        /// over a session.
        include_name: bool,
    },
    StopAdvertising,
    OpenSession {
        peer: PeerId,
        session: SessionId,
    },
    DiscoverServices {
        session: SessionId,
    },
    ReadCharacteristic {
        session: SessionId,
        service_id: Uuid,
    },
    DisableNotifications {
        session: SessionId,
        service_id: Uuid,
    },
    CloseSession {
        session: SessionId,
    },
    ArmTimer {
        timer: TimerId,
        after: Duration,
    },
    CancelTimer {
        timer: TimerId,
    },
    /// Deliver the roster to the application.
    RosterChanged {
        peers: Vec<RosterEntry>,
        changed: bool,
    },
    /// Advertising gave up after exhausting its retries.
    AdvertisingFailed {
        error: AdvertiseError,
    },
}

/// Discovery facade. Host passes events; core returns actions.
pub struct DiscoveryCore {
    config: DiscoveryConfig,
    registry: PeerRegistry,
    coordinator: IdentificationCoordinator,
    scanner: ScanScheduler,
    advertiser: AdvertisingController,
}

impl DiscoveryCore {
    pub fn new(config: DiscoveryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let service_filter = config.scan_filter.then_some(config.service_id);
        Ok(Self {
            registry: PeerRegistry::new(config.service_id),
            coordinator: IdentificationCoordinator::new(
                config.service_id,
                config.handshake_timeout,
            ),
            scanner: ScanScheduler::new(config.scan_burst, config.scan_rest, service_filter),
            advertiser: AdvertisingController::new(config.advertise_max_retries),
            config,
        })
    }

    /// Switch on the subsystems named by the configured start mode.
    pub fn start(&mut self, now: Instant) -> Vec<Action> {
        let mode = self.config.start_mode;
        info!(?mode, name = %self.config.local_name, service = %self.config.service_id, "starting discovery");
        let mut out = Vec::new();
        if mode.advertises() {
            out.extend(self.set_advertising_enabled(true));
        }
        if mode.discovers() {
            out.extend(self.set_discovery_enabled(true, now));
        }
        out
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn set_discovery_enabled(&mut self, enabled: bool, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        if self.scanner.set_enabled(enabled, &mut out) {
            self.sweep(now, &mut out);
        }
        out
    }

    pub fn set_advertising_enabled(&mut self, enabled: bool) -> Vec<Action> {
        let mut out = Vec::new();
        if enabled {
            self.advertiser.enable(&self.config, &mut out);
        } else {
            self.advertiser.disable(&mut out);
        }
        out
    }

    /// Suspend or resume both scanning and advertising, keeping configuration,
    /// enable intents and registry state.
    pub fn set_paused(&mut self, paused: bool, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        if self.scanner.set_paused(paused, &mut out) {
            self.sweep(now, &mut out);
        }
        self.advertiser.set_paused(paused, &self.config, &mut out);
        out
    }

    pub fn set_scan_burst(&mut self, burst: Duration) -> Result<Vec<Action>, ConfigError> {
        if burst.is_zero() {
            return Err(ConfigError::ZeroDuration("scan_burst"));
        }
        self.config.scan_burst = burst;
        Ok(self.restart_scan_cycle())
    }

    pub fn set_scan_rest(&mut self, rest: Duration) -> Result<Vec<Action>, ConfigError> {
        if rest.is_zero() {
            return Err(ConfigError::ZeroDuration("scan_rest"));
        }
        self.config.scan_rest = rest;
        Ok(self.restart_scan_cycle())
    }

    /// Staleness timeout used by the next eviction pass.
    pub fn set_user_timeout(&mut self, timeout: Duration) -> Result<(), ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("peer_timeout"));
        }
        self.config.peer_timeout = timeout;
        Ok(())
    }

    pub fn set_handshake_timeout(&mut self, timeout: Duration) -> Result<(), ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("handshake_timeout"));
        }
        self.config.handshake_timeout = timeout;
        self.coordinator.set_timeout(timeout);
        Ok(())
    }

    pub fn set_advertise_max_retries(&mut self, max_retries: u32) {
        self.config.advertise_max_retries = max_retries;
        self.advertiser.set_max_retries(max_retries);
    }

    /// Change the broadcast display name; a live advertisement is restarted.
    pub fn set_local_name(&mut self, name: impl Into<String>) -> Result<Vec<Action>, ConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigError::EmptyLocalName);
        }
        self.config.local_name = name;
        let mut out = Vec::new();
        self.advertiser.restart(&self.config, &mut out);
        Ok(out)
    }

    pub fn set_roster_order(&mut self, order: RosterOrder) {
        self.config.roster_order = order;
    }

    /// Apply one host event.
    pub fn handle(&mut self, event: Event, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        match event {
            Event::Observed(obs) => self.on_observed(obs, now, &mut out),
            Event::ScanFailed(code) => {
                warn!(code, "scan failed");
            }
            Event::Session { session, event } => {
                if let Some(res) = self.coordinator.on_session_event(session, event, &mut out) {
                    if self.registry.on_handshake_resolved(
                        &res.peer,
                        res.display_name,
                        res.matched,
                        now,
                    ) {
                        self.notify(true, &mut out);
                    }
                }
            }
            Event::AdvertiseStarted => self.advertiser.on_started(&mut out),
            Event::AdvertiseFailed(error) => {
                if let Some(error) = self.advertiser.on_failed(error, &mut out) {
                    out.push(Action::AdvertisingFailed { error });
                }
            }
            Event::RadioAvailability(available) => {
                info!(available, "radio availability changed");
                if self.scanner.set_radio_available(available, &mut out) {
                    self.sweep(now, &mut out);
                }
                self.advertiser
                    .set_radio_available(available, &self.config, &mut out);
            }
            Event::TimerFired(timer) => match timer.kind {
                TimerKind::Scan => {
                    if self.scanner.on_timer(timer, &mut out) {
                        self.sweep(now, &mut out);
                    }
                }
                TimerKind::Advertise => self.advertiser.on_timer(timer, &self.config, &mut out),
            },
        }
        out
    }

    /// Current roster, identified peers only.
    pub fn roster(&self) -> Vec<RosterEntry> {
        self.registry.snapshot(self.config.roster_order)
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &IdentificationCoordinator {
        &self.coordinator
    }

    pub fn scan_state(&self) -> ScanState {
        self.scanner.state()
    }

    pub fn advertise_state(&self) -> AdvertiseState {
        self.advertiser.state()
    }

    fn on_observed(&mut self, obs: Observation, now: Instant, out: &mut Vec<Action>) {
        if !self.scanner.is_scanning() {
            trace!(peer = %obs.peer, "observation outside scan burst dropped");
            return;
        }
        let outcome = self.registry.observe(&obs, now);
        if outcome.needs_identify {
            self.coordinator.identify(&obs.peer, now, out);
        }
        if outcome.changed {
            self.notify(true, out);
        }
    }

    fn restart_scan_cycle(&mut self) -> Vec<Action> {
        let mut out = Vec::new();
        self.scanner
            .set_intervals(self.config.scan_burst, self.config.scan_rest, &mut out);
        out
    }

    /// Evict stale peers and re-send the roster; ordering may have shifted
    /// even when nobody left.
    fn sweep(&mut self, now: Instant, out: &mut Vec<Action>) {
        let removed = self.registry.evict_stale(now, self.config.peer_timeout);
        if removed > 0 {
            debug!(removed, remaining = self.registry.len(), "evicted stale peers");
        }
        self.notify(removed > 0, out);
    }

    fn notify(&self, changed: bool, out: &mut Vec<Action>) {
        out.push(Action::RosterChanged {
            peers: self.roster(),
            changed,
        });
    }
}
