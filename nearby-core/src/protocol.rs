//! Host boundary messages and version.

use serde::{Deserialize, Serialize};

use crate::core::{Action, Event};

/// Current protocol version. Exchanged in `Hello` before any event flows.
pub const PROTOCOL_VERSION: u8 = 1;

/// Host (radio helper, embedding app) to core. Encoding is bincode; framing is
/// length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostMessage {
    Hello { protocol_version: u8 },
    Event(Event),
}

/// Core to host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreMessage {
    Hello { protocol_version: u8 },
    Action(Action),
}

impl HostMessage {
    pub fn hello() -> Self {
        HostMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl CoreMessage {
    pub fn hello() -> Self {
        CoreMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Version carried by a peer's `Hello` must match ours exactly.
pub fn version_compatible(protocol_version: u8) -> bool {
    protocol_version == PROTOCOL_VERSION
}
