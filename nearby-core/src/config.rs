//! Discovery configuration: local identity, service namespace, intervals.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default scan burst length.
pub const DEFAULT_SCAN_BURST: Duration = Duration::from_secs(5);

/// Default rest between scan bursts.
pub const DEFAULT_SCAN_REST: Duration = Duration::from_secs(5);

/// Default time since last sighting before a peer is evicted.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time a handshake may stay open before it is replaced.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of backoff retries after an advertise start failure.
pub const DEFAULT_ADVERTISE_MAX_RETRIES: u32 = 3;

/// Longest display name (bytes) that still fits the advertisement payload.
pub const DEFAULT_ADVERTISE_NAME_MAX_LEN: usize = 7;

/// Ordering of the roster handed to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RosterOrder {
    /// Ascending smoothed proximity: the weakest (most negative) score first.
    #[default]
    Ascending,
    /// Descending smoothed proximity: the strongest signal first.
    NearestFirst,
}

/// Which subsystems `DiscoveryCore::start` switches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    #[default]
    AdvertiseAndDiscover,
    AdvertiseOnly,
    DiscoverOnly,
    None,
}

impl StartMode {
    pub fn advertises(self) -> bool {
        matches!(self, StartMode::AdvertiseAndDiscover | StartMode::AdvertiseOnly)
    }

    pub fn discovers(self) -> bool {
        matches!(self, StartMode::AdvertiseAndDiscover | StartMode::DiscoverOnly)
    }
}

/// Process-wide discovery settings. Supplied at construction; individual
/// fields are changed at runtime through the `DiscoveryCore` setters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Display name broadcast to and read by other peers.
    pub local_name: String,
    /// Service namespace distinguishing compatible peers.
    pub service_id: Uuid,
    pub scan_burst: Duration,
    pub scan_rest: Duration,
    /// Peers not seen for longer than this are evicted.
    pub peer_timeout: Duration,
    pub handshake_timeout: Duration,
    pub advertise_max_retries: u32,
    pub advertise_name_max_len: usize,
    pub roster_order: RosterOrder,
    pub start_mode: StartMode,
    /// Pass the service id to the transport as a scan filter.
    pub scan_filter: bool,
}

impl DiscoveryConfig {
    pub fn new(local_name: impl Into<String>, service_id: Uuid) -> Self {
        Self {
            local_name: local_name.into(),
            service_id,
            scan_burst: DEFAULT_SCAN_BURST,
            scan_rest: DEFAULT_SCAN_REST,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            advertise_max_retries: DEFAULT_ADVERTISE_MAX_RETRIES,
            advertise_name_max_len: DEFAULT_ADVERTISE_NAME_MAX_LEN,
            roster_order: RosterOrder::default(),
            start_mode: StartMode::default(),
            scan_filter: false,
        }
    }

    /// Check the invariants the core relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_name.is_empty() {
            return Err(ConfigError::EmptyLocalName);
        }
        let durations = [
            ("scan_burst", self.scan_burst),
            ("scan_rest", self.scan_rest),
            ("peer_timeout", self.peer_timeout),
            ("handshake_timeout", self.handshake_timeout),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(field));
            }
        }
        Ok(())
    }

    /// Whether the local name fits in the advertisement payload.
    pub fn name_fits_advertisement(&self) -> bool {
        self.local_name.len() <= self.advertise_name_max_len
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("local name must not be empty")]
    EmptyLocalName,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let c = DiscoveryConfig::new("alice", Uuid::new_v4());
        assert_eq!(c.scan_burst, Duration::from_secs(5));
        assert_eq!(c.handshake_timeout, Duration::from_secs(30));
        assert_eq!(c.advertise_max_retries, 3);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn rejects_empty_name_and_zero_durations() {
        let mut c = DiscoveryConfig::new("", Uuid::new_v4());
        assert_eq!(c.validate(), Err(ConfigError::EmptyLocalName));
        c.local_name = "bob".into();
        c.scan_rest = Duration::ZERO;
        assert_eq!(c.validate(), Err(ConfigError::ZeroDuration("scan_rest")));
    }

    #[test]
    fn short_names_fit_advertisement() {
        let mut c = DiscoveryConfig::new("alice", Uuid::new_v4());
        assert!(c.name_fits_advertisement());
        c.local_name = "alexandria".into();
        assert!(!c.name_fits_advertisement());
    }

    #[test]
    fn start_modes() {
        assert!(StartMode::AdvertiseAndDiscover.advertises());
        assert!(StartMode::AdvertiseAndDiscover.discovers());
        assert!(!StartMode::AdvertiseOnly.discovers());
        assert!(!StartMode::DiscoverOnly.advertises());
        assert!(!StartMode::None.advertises() && !StartMode::None.discovers());
    }
}
