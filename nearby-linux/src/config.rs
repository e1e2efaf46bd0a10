//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nearby_core::config::{
    DEFAULT_ADVERTISE_MAX_RETRIES, DEFAULT_ADVERTISE_NAME_MAX_LEN, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_PEER_TIMEOUT, DEFAULT_SCAN_BURST, DEFAULT_SCAN_REST,
};
use nearby_core::{DiscoveryConfig, RosterOrder, StartMode};
use serde::Deserialize;
use uuid::Uuid;

/// Service namespace used when none is configured.
pub const DEFAULT_SERVICE_ID: Uuid = Uuid::from_u128(0x6e65_6172_6279_4d00_8000_00805f9b34fb);

/// Daemon configuration. File: ~/.config/nearby/config.toml or /etc/nearby/config.toml.
/// Env overrides: NEARBY_LOCAL_NAME, NEARBY_SERVICE_ID, NEARBY_SCAN_BURST_SECS,
/// NEARBY_SCAN_REST_SECS, NEARBY_USER_TIMEOUT_SECS, NEARBY_LOG.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Display name broadcast to peers (default "nearby").
    #[serde(default = "default_local_name")]
    pub local_name: String,
    #[serde(default = "default_service_id")]
    pub service_id: Uuid,
    #[serde(default = "default_scan_burst_secs")]
    pub scan_burst_secs: u64,
    #[serde(default = "default_scan_rest_secs")]
    pub scan_rest_secs: u64,
    /// Seconds without a sighting before a peer is dropped.
    #[serde(default = "default_user_timeout_secs")]
    pub user_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_advertise_max_retries")]
    pub advertise_max_retries: u32,
    #[serde(default)]
    pub roster_order: RosterOrder,
    #[serde(default)]
    pub start_mode: StartMode,
    #[serde(default)]
    pub scan_filter: bool,
    /// Log filter directive, e.g. "info" or "nearby_core=debug". `RUST_LOG` wins.
    #[serde(default)]
    pub log: Option<String>,
}

fn default_local_name() -> String {
    "nearby".to_owned()
}
fn default_service_id() -> Uuid {
    DEFAULT_SERVICE_ID
}
fn default_scan_burst_secs() -> u64 {
    DEFAULT_SCAN_BURST.as_secs()
}
fn default_scan_rest_secs() -> u64 {
    DEFAULT_SCAN_REST.as_secs()
}
fn default_user_timeout_secs() -> u64 {
    DEFAULT_PEER_TIMEOUT.as_secs()
}
fn default_handshake_timeout_secs() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT.as_secs()
}
fn default_advertise_max_retries() -> u32 {
    DEFAULT_ADVERTISE_MAX_RETRIES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_name: default_local_name(),
            service_id: default_service_id(),
            scan_burst_secs: default_scan_burst_secs(),
            scan_rest_secs: default_scan_rest_secs(),
            user_timeout_secs: default_user_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            advertise_max_retries: default_advertise_max_retries(),
            roster_order: RosterOrder::default(),
            start_mode: StartMode::default(),
            scan_filter: false,
            log: None,
        }
    }
}

impl Config {
    /// Core configuration. Zero durations are passed through and rejected by
    /// `DiscoveryCore::new`.
    pub fn discovery(&self) -> DiscoveryConfig {
        let mut cfg = DiscoveryConfig::new(self.local_name.clone(), self.service_id);
        cfg.scan_burst = Duration::from_secs(self.scan_burst_secs);
        cfg.scan_rest = Duration::from_secs(self.scan_rest_secs);
        cfg.peer_timeout = Duration::from_secs(self.user_timeout_secs);
        cfg.handshake_timeout = Duration::from_secs(self.handshake_timeout_secs);
        cfg.advertise_max_retries = self.advertise_max_retries;
        cfg.advertise_name_max_len = DEFAULT_ADVERTISE_NAME_MAX_LEN;
        cfg.roster_order = self.roster_order;
        cfg.start_mode = self.start_mode;
        cfg.scan_filter = self.scan_filter;
        cfg
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{var}={value:?} is not valid")]
    Env { var: &'static str, value: String },
}

/// Load config: merge default, then config file (if present), then env vars.
/// `explicit` replaces the search path and must exist.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let file = match explicit {
        Some(path) => Some(read_file(path)?),
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => Some(read_file(&path)?),
            None => None,
        },
    };
    let mut c = file.unwrap_or_default();
    apply_env(&mut c, |var| std::env::var(var).ok())?;
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    if let Some(s) = var("NEARBY_LOCAL_NAME") {
        c.local_name = s;
    }
    if let Some(s) = var("NEARBY_SERVICE_ID") {
        c.service_id = parse_env("NEARBY_SERVICE_ID", s)?;
    }
    if let Some(s) = var("NEARBY_SCAN_BURST_SECS") {
        c.scan_burst_secs = parse_env("NEARBY_SCAN_BURST_SECS", s)?;
    }
    if let Some(s) = var("NEARBY_SCAN_REST_SECS") {
        c.scan_rest_secs = parse_env("NEARBY_SCAN_REST_SECS", s)?;
    }
    if let Some(s) = var("NEARBY_USER_TIMEOUT_SECS") {
        c.user_timeout_secs = parse_env("NEARBY_USER_TIMEOUT_SECS", s)?;
    }
    if let Some(s) = var("NEARBY_LOG") {
        c.log = Some(s);
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nearby/config.toml"));
    }
    out.push(PathBuf::from("/etc/nearby/config.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}
