//! Nearby proximity discovery protocol core.
//! Host-driven: no I/O; host passes events and receives actions.
//!
//! Peers are found by duty-cycled scanning, identified either from their
//! advertisement or by a short connect/discover/read handshake, ranked by a
//! smoothed signal score and dropped once they go quiet.

pub mod config;
pub mod filter;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod wire;

pub mod advertise;
pub mod core;
pub mod identify;
pub mod scan;
pub mod timer;

pub mod ffi;

pub use advertise::{AdvertiseError, AdvertiseState};
pub use config::{ConfigError, DiscoveryConfig, RosterOrder, StartMode};
pub use crate::core::{Action, DiscoveryCore, Event};
pub use identify::{SessionEvent, SessionId};
pub use peer::{PeerId, RosterEntry, ServiceMatch};
pub use protocol::{CoreMessage, HostMessage, PROTOCOL_VERSION};
pub use registry::Observation;
pub use scan::ScanState;
pub use timer::{TimerId, TimerKind};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
