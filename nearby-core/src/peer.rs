//! Peer model: one entry per radio address observed.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::filter::ProximityFilter;

/// Opaque, stable radio address of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(address: impl Into<String>) -> Self {
        PeerId(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId::new(s)
    }
}

/// Whether a peer belongs to our service namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceMatch {
    #[default]
    Unknown,
    Match,
    NoMatch,
}

/// A remote participant. Mutated only by the registry.
#[derive(Debug, Clone)]
pub struct Peer {
    id: PeerId,
    pub(crate) display_name: Option<String>,
    pub(crate) service_match: ServiceMatch,
    pub(crate) identified: bool,
    pub(crate) raw_signal: i32,
    pub(crate) smoothed_proximity: i32,
    pub(crate) last_seen_at: Instant,
    pub(crate) filter: ProximityFilter,
}

impl Peer {
    pub(crate) fn new(id: PeerId, now: Instant) -> Self {
        Self {
            id,
            display_name: None,
            service_match: ServiceMatch::Unknown,
            identified: false,
            raw_signal: 0,
            smoothed_proximity: 0,
            last_seen_at: now,
            filter: ProximityFilter::new(),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn service_match(&self) -> ServiceMatch {
        self.service_match
    }

    pub fn is_identified(&self) -> bool {
        self.identified
    }

    pub fn raw_signal(&self) -> i32 {
        self.raw_signal
    }

    pub fn smoothed_proximity(&self) -> i32 {
        self.smoothed_proximity
    }

    pub fn last_seen_at(&self) -> Instant {
        self.last_seen_at
    }

    /// Recompute `identified` from name and service match. Never demotes.
    pub(crate) fn refresh_identified(&mut self) {
        if self.display_name.is_some() && self.service_match == ServiceMatch::Match {
            self.identified = true;
        }
    }

    pub(crate) fn roster_entry(&self) -> Option<RosterEntry> {
        if !self.identified {
            return None;
        }
        Some(RosterEntry {
            id: self.id.clone(),
            display_name: self.display_name.clone()?,
            smoothed_proximity: self.smoothed_proximity,
        })
    }
}

/// One identified peer as delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: PeerId,
    pub display_name: String,
    pub smoothed_proximity: i32,
}
