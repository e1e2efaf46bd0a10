//! Identification coordinator: per-peer connect -> discover -> read handshake.
//!
//! Never touches peer state. A finished handshake yields a `Resolution` that
//! the caller hands to the registry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::Action;
use crate::peer::PeerId;

/// Transport session handle, allocated by the coordinator when it asks the
/// host to open a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

/// Transport callbacks for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    /// Service discovery could not be issued on a connected session.
    DiscoveryRejected,
    ServicesDiscovered(Vec<Uuid>),
    /// `value` is `None` when the read failed.
    CharacteristicRead {
        service_id: Uuid,
        value: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Connecting,
    ServiceDiscovery,
    CharacteristicRead,
}

/// Outcome of a finished handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub peer: PeerId,
    pub display_name: Option<String>,
    pub matched: bool,
}

struct ConnectionAttempt {
    session: SessionId,
    started_at: Instant,
    state: HandshakeState,
    pending_reads: usize,
}

pub struct IdentificationCoordinator {
    attempts: HashMap<PeerId, ConnectionAttempt>,
    sessions: HashMap<SessionId, PeerId>,
    service_id: Uuid,
    timeout: Duration,
    next_session: u64,
}

impl IdentificationCoordinator {
    pub fn new(service_id: Uuid, timeout: Duration) -> Self {
        Self {
            attempts: HashMap::new(),
            sessions: HashMap::new(),
            service_id,
            timeout,
            next_session: 1,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Start a handshake with `peer` unless one is already in flight.
    /// A handshake older than the timeout is closed and replaced.
    /// Returns true when a new session was requested.
    pub fn identify(&mut self, peer: &PeerId, now: Instant, out: &mut Vec<Action>) -> bool {
        if let Some(attempt) = self.attempts.get(peer) {
            if now.saturating_duration_since(attempt.started_at) < self.timeout {
                debug!(%peer, "handshake already in progress");
                return false;
            }
            warn!(%peer, session = attempt.session.0, "handshake timed out; retrying");
            let stale = attempt.session;
            self.finish(stale);
            out.push(Action::CloseSession { session: stale });
        }

        let session = SessionId(self.next_session);
        self.next_session += 1;
        debug!(%peer, session = session.0, "opening session");
        self.attempts.insert(
            peer.clone(),
            ConnectionAttempt {
                session,
                started_at: now,
                state: HandshakeState::Connecting,
                pending_reads: 0,
            },
        );
        self.sessions.insert(session, peer.clone());
        out.push(Action::OpenSession {
            peer: peer.clone(),
            session,
        });
        true
    }

    /// Advance the handshake owning `session`.
    pub fn on_session_event(
        &mut self,
        session: SessionId,
        event: SessionEvent,
        out: &mut Vec<Action>,
    ) -> Option<Resolution> {
        let Some(peer) = self.sessions.get(&session).cloned() else {
            if event != SessionEvent::Disconnected {
                debug!(session = session.0, "event for unknown session; closing");
                out.push(Action::CloseSession { session });
            }
            return None;
        };

        match event {
            SessionEvent::Connected => {
                debug!(%peer, "connected; discovering services");
                self.set_state(&peer, HandshakeState::ServiceDiscovery);
                out.push(Action::DiscoverServices { session });
                None
            }
            SessionEvent::DiscoveryRejected => {
                debug!(%peer, "service discovery could not start");
                self.close(session, out);
                None
            }
            SessionEvent::ServicesDiscovered(services) => {
                let matches = services.iter().filter(|s| **s == self.service_id).count();
                if matches == 0 {
                    debug!(%peer, "service not offered");
                    self.close(session, out);
                    return Some(Resolution {
                        peer,
                        display_name: None,
                        matched: false,
                    });
                }
                if let Some(attempt) = self.attempts.get_mut(&peer) {
                    attempt.state = HandshakeState::CharacteristicRead;
                    attempt.pending_reads += matches;
                }
                for _ in 0..matches {
                    out.push(Action::ReadCharacteristic {
                        session,
                        service_id: self.service_id,
                    });
                }
                None
            }
            SessionEvent::CharacteristicRead { service_id, value } => {
                if service_id != self.service_id {
                    return None;
                }
                let remaining = match self.attempts.get_mut(&peer) {
                    Some(attempt) => {
                        attempt.pending_reads = attempt.pending_reads.saturating_sub(1);
                        attempt.pending_reads
                    }
                    None => 0,
                };
                match value.as_deref().and_then(decode_name) {
                    Some(name) => {
                        debug!(%peer, %name, "read display name");
                        out.push(Action::DisableNotifications {
                            session,
                            service_id,
                        });
                        self.close(session, out);
                        Some(Resolution {
                            peer,
                            display_name: Some(name),
                            matched: true,
                        })
                    }
                    None => {
                        if remaining == 0 {
                            debug!(%peer, "characteristic read gave no name");
                            self.close(session, out);
                        }
                        None
                    }
                }
            }
            SessionEvent::Disconnected => {
                debug!(%peer, session = session.0, "disconnected");
                self.finish(session);
                None
            }
        }
    }

    pub fn in_flight(&self, peer: &PeerId) -> bool {
        self.attempts.contains_key(peer)
    }

    pub fn state(&self, peer: &PeerId) -> Option<HandshakeState> {
        self.attempts.get(peer).map(|a| a.state)
    }

    pub fn session(&self, peer: &PeerId) -> Option<SessionId> {
        self.attempts.get(peer).map(|a| a.session)
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    fn set_state(&mut self, peer: &PeerId, state: HandshakeState) {
        if let Some(attempt) = self.attempts.get_mut(peer) {
            attempt.state = state;
        }
    }

    fn close(&mut self, session: SessionId, out: &mut Vec<Action>) {
        self.finish(session);
        out.push(Action::CloseSession { session });
    }

    /// Forget `session`. The peer's attempt goes with it only if it is still
    /// the peer's current session.
    fn finish(&mut self, session: SessionId) {
        if let Some(peer) = self.sessions.remove(&session) {
            if self.attempts.get(&peer).map(|a| a.session) == Some(session) {
                self.attempts.remove(&peer);
            }
        }
    }
}

/// Characteristic value as a display name: UTF-8, trailing NULs dropped.
fn decode_name(value: &[u8]) -> Option<String> {
    let name = String::from_utf8_lossy(value);
    let name = name.trim_end_matches('\0');
    if name.is_empty() {
        None
    } else {
        Some(name.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Uuid {
        Uuid::from_u128(0x6e65_6172_6279_0000_0000_0000_0000_0001)
    }

    fn coordinator() -> IdentificationCoordinator {
        IdentificationCoordinator::new(service(), Duration::from_secs(30))
    }

    fn opened(out: &[Action]) -> Vec<SessionId> {
        out.iter()
            .filter_map(|a| match a {
                Action::OpenSession { session, .. } => Some(*session),
                _ => None,
            })
            .collect()
    }

    fn closed(out: &[Action]) -> Vec<SessionId> {
        out.iter()
            .filter_map(|a| match a {
                Action::CloseSession { session } => Some(*session),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn second_identify_within_timeout_is_noop() {
        let mut c = coordinator();
        let peer = PeerId::from("X");
        let t0 = Instant::now();
        let mut out = Vec::new();
        assert!(c.identify(&peer, t0, &mut out));
        assert!(!c.identify(&peer, t0 + Duration::from_secs(29), &mut out));
        assert_eq!(opened(&out).len(), 1);
        assert!(closed(&out).is_empty());
    }

    #[test]
    fn stale_handshake_is_replaced_once() {
        let mut c = coordinator();
        let peer = PeerId::from("X");
        let t0 = Instant::now();
        let mut out = Vec::new();
        c.identify(&peer, t0, &mut out);
        let first = opened(&out)[0];
        out.clear();

        assert!(c.identify(&peer, t0 + Duration::from_secs(31), &mut out));
        assert_eq!(closed(&out), vec![first]);
        let fresh = opened(&out);
        assert_eq!(fresh.len(), 1);
        assert_ne!(fresh[0], first);
        assert_eq!(c.attempt_count(), 1);
    }

    #[test]
    fn full_handshake_resolves_name() {
        let mut c = coordinator();
        let peer = PeerId::from("X");
        let mut out = Vec::new();
        c.identify(&peer, Instant::now(), &mut out);
        let s = opened(&out)[0];

        out.clear();
        assert_eq!(c.on_session_event(s, SessionEvent::Connected, &mut out), None);
        assert_eq!(out, vec![Action::DiscoverServices { session: s }]);
        assert_eq!(c.state(&peer), Some(HandshakeState::ServiceDiscovery));

        out.clear();
        let other = Uuid::from_u128(7);
        c.on_session_event(s, SessionEvent::ServicesDiscovered(vec![other, service()]), &mut out);
        assert_eq!(
            out,
            vec![Action::ReadCharacteristic {
                session: s,
                service_id: service()
            }]
        );
        assert_eq!(c.state(&peer), Some(HandshakeState::CharacteristicRead));

        out.clear();
        let res = c.on_session_event(
            s,
            SessionEvent::CharacteristicRead {
                service_id: service(),
                value: Some(b"alice\0".to_vec()),
            },
            &mut out,
        );
        assert_eq!(
            res,
            Some(Resolution {
                peer: peer.clone(),
                display_name: Some("alice".into()),
                matched: true
            })
        );
        assert_eq!(
            out,
            vec![
                Action::DisableNotifications {
                    session: s,
                    service_id: service()
                },
                Action::CloseSession { session: s },
            ]
        );
        assert!(!c.in_flight(&peer));
        // the transport's disconnect for the closed session is quietly absorbed
        out.clear();
        c.on_session_event(s, SessionEvent::Disconnected, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn missing_service_resolves_no_match_and_closes() {
        let mut c = coordinator();
        let peer = PeerId::from("X");
        let mut out = Vec::new();
        c.identify(&peer, Instant::now(), &mut out);
        let s = opened(&out)[0];
        c.on_session_event(s, SessionEvent::Connected, &mut out);
        out.clear();
        let res = c.on_session_event(s, SessionEvent::ServicesDiscovered(vec![]), &mut out);
        assert_eq!(res.map(|r| r.matched), Some(false));
        assert_eq!(closed(&out), vec![s]);
        assert!(!c.in_flight(&peer));
    }

    #[test]
    fn duplicate_service_entries_read_each() {
        let mut c = coordinator();
        let peer = PeerId::from("X");
        let mut out = Vec::new();
        c.identify(&peer, Instant::now(), &mut out);
        let s = opened(&out)[0];
        out.clear();
        c.on_session_event(
            s,
            SessionEvent::ServicesDiscovered(vec![service(), service()]),
            &mut out,
        );
        assert_eq!(out.len(), 2);

        // first read fails; the session stays open for the second
        out.clear();
        let failed = SessionEvent::CharacteristicRead {
            service_id: service(),
            value: None,
        };
        assert_eq!(c.on_session_event(s, failed.clone(), &mut out), None);
        assert!(out.is_empty());
        assert!(c.in_flight(&peer));

        // second read also fails; give up and leave the peer unresolved
        c.on_session_event(s, failed, &mut out);
        assert_eq!(closed(&out), vec![s]);
        assert!(!c.in_flight(&peer));
    }

    #[test]
    fn rejected_discovery_closes_without_resolution() {
        let mut c = coordinator();
        let peer = PeerId::from("X");
        let mut out = Vec::new();
        c.identify(&peer, Instant::now(), &mut out);
        let s = opened(&out)[0];
        c.on_session_event(s, SessionEvent::Connected, &mut out);
        out.clear();
        assert_eq!(c.on_session_event(s, SessionEvent::DiscoveryRejected, &mut out), None);
        assert_eq!(closed(&out), vec![s]);
        let mut again = Vec::new();
        assert!(c.identify(&peer, Instant::now(), &mut again));
    }

    #[test]
    fn disconnect_discards_attempt_in_any_state() {
        let mut c = coordinator();
        let peer = PeerId::from("X");
        let mut out = Vec::new();
        c.identify(&peer, Instant::now(), &mut out);
        let s = opened(&out)[0];
        c.on_session_event(s, SessionEvent::Connected, &mut out);
        c.on_session_event(s, SessionEvent::Disconnected, &mut out);
        assert!(!c.in_flight(&peer));
    }

    #[test]
    fn late_disconnect_of_replaced_session_keeps_retry() {
        let mut c = coordinator();
        let peer = PeerId::from("X");
        let t0 = Instant::now();
        let mut out = Vec::new();
        c.identify(&peer, t0, &mut out);
        let stale = opened(&out)[0];
        c.identify(&peer, t0 + Duration::from_secs(31), &mut out);
        let fresh = c.session(&peer);

        out.clear();
        c.on_session_event(stale, SessionEvent::Disconnected, &mut out);
        assert!(out.is_empty());
        assert_eq!(c.session(&peer), fresh);

        // a stale session that connects late is told to close again
        c.on_session_event(stale, SessionEvent::Connected, &mut out);
        assert_eq!(closed(&out), vec![stale]);
        assert_eq!(c.session(&peer), fresh);
    }

    #[test]
    fn foreign_characteristic_is_ignored() {
        let mut c = coordinator();
        let peer = PeerId::from("X");
        let mut out = Vec::new();
        c.identify(&peer, Instant::now(), &mut out);
        let s = opened(&out)[0];
        c.on_session_event(s, SessionEvent::ServicesDiscovered(vec![service()]), &mut out);
        out.clear();
        let res = c.on_session_event(
            s,
            SessionEvent::CharacteristicRead {
                service_id: Uuid::from_u128(9),
                value: Some(b"mallory".to_vec()),
            },
            &mut out,
        );
        assert_eq!(res, None);
        assert!(out.is_empty());
        assert!(c.in_flight(&peer));
    }

    #[test]
    fn decode_name_rejects_empty() {
        assert_eq!(decode_name(b""), None);
        assert_eq!(decode_name(b"\0\0"), None);
        assert_eq!(decode_name(b"bob"), Some("bob".into()));
    }
}
