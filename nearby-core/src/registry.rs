//! Peer registry: sole owner and mutator of peer state.
//!
//! Observations and handshake results only ever upgrade a peer (name set once,
//! `Match` latched, `identified` never cleared), so the two can be merged in
//! either order. Peers leave only through timeout eviction.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::RosterOrder;
use crate::peer::{Peer, PeerId, RosterEntry, ServiceMatch};

/// One advertisement seen by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub peer: PeerId,
    pub signal: i32,
    pub advertised_name: Option<String>,
    pub advertised_service_ids: Vec<Uuid>,
}

impl Observation {
    pub fn new(peer: impl Into<PeerId>, signal: i32) -> Self {
        Self {
            peer: peer.into(),
            signal,
            advertised_name: None,
            advertised_service_ids: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.advertised_name = Some(name.into());
        self
    }

    pub fn with_service(mut self, service_id: Uuid) -> Self {
        self.advertised_service_ids.push(service_id);
        self
    }
}

/// What an observation did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObserveOutcome {
    /// Name, service match or identification transitioned.
    pub changed: bool,
    /// Not identified and not ruled out; a handshake should be attempted.
    pub needs_identify: bool,
}

pub struct PeerRegistry {
    peers: HashMap<PeerId, Peer>,
    service_id: Uuid,
}

impl PeerRegistry {
    pub fn new(service_id: Uuid) -> Self {
        Self {
            peers: HashMap::new(),
            service_id,
        }
    }

    /// Apply an observation, creating the peer on first sight.
    pub fn observe(&mut self, obs: &Observation, now: Instant) -> ObserveOutcome {
        let service_id = self.service_id;
        let peer = self.peers.entry(obs.peer.clone()).or_insert_with(|| {
            debug!(peer = %obs.peer, "new peer");
            Peer::new(obs.peer.clone(), now)
        });
        let before = (
            peer.display_name.is_some(),
            peer.service_match,
            peer.identified,
        );

        if peer.service_match == ServiceMatch::Unknown
            && obs.advertised_service_ids.contains(&service_id)
        {
            peer.service_match = ServiceMatch::Match;
        }
        if peer.display_name.is_none() {
            if let Some(name) = obs.advertised_name.as_deref().filter(|n| !n.is_empty()) {
                peer.display_name = Some(name.to_owned());
            }
        }
        peer.refresh_identified();

        peer.raw_signal = obs.signal;
        peer.smoothed_proximity = peer.filter.update(obs.signal);
        peer.last_seen_at = now;

        let after = (
            peer.display_name.is_some(),
            peer.service_match,
            peer.identified,
        );
        if after.2 && !before.2 {
            debug!(peer = %obs.peer, "identified from advertisement");
        }
        ObserveOutcome {
            changed: before != after,
            needs_identify: !peer.identified && peer.service_match != ServiceMatch::NoMatch,
        }
    }

    /// Merge a handshake result. Returns true when the peer became identified
    /// by this call.
    pub fn on_handshake_resolved(
        &mut self,
        id: &PeerId,
        display_name: Option<String>,
        matched: bool,
        now: Instant,
    ) -> bool {
        let Some(peer) = self.peers.get_mut(id) else {
            debug!(peer = %id, "handshake resolved for evicted peer; ignoring");
            return false;
        };
        peer.last_seen_at = now;

        if !matched {
            if peer.service_match == ServiceMatch::Unknown {
                debug!(peer = %id, "peer is not our service");
                peer.service_match = ServiceMatch::NoMatch;
            }
            return false;
        }

        let was_identified = peer.identified;
        if peer.display_name.is_none() {
            peer.display_name = display_name.filter(|n| !n.is_empty());
        }
        peer.service_match = ServiceMatch::Match;
        peer.refresh_identified();
        let newly = peer.identified && !was_identified;
        if newly {
            debug!(peer = %id, name = ?peer.display_name, "identified by handshake");
        }
        newly
    }

    /// Drop peers not seen for longer than `timeout`. Returns how many were removed.
    pub fn evict_stale(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.peers.len();
        self.peers.retain(|id, peer| {
            let keep = now.saturating_duration_since(peer.last_seen_at) <= timeout;
            if !keep {
                debug!(peer = %id, "evicting stale peer");
            }
            keep
        });
        before - self.peers.len()
    }

    /// Identified peers ranked by smoothed proximity.
    pub fn snapshot(&self, order: RosterOrder) -> Vec<RosterEntry> {
        let mut roster: Vec<RosterEntry> =
            self.peers.values().filter_map(Peer::roster_entry).collect();
        match order {
            RosterOrder::Ascending => roster.sort_by_key(|e| e.smoothed_proximity),
            RosterOrder::NearestFirst => {
                roster.sort_by_key(|e| std::cmp::Reverse(e.smoothed_proximity))
            }
        }
        roster
    }

    pub fn get(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
