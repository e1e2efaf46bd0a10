//! Nearby discovery host for Linux: a tokio driver around `nearby_core`, a
//! radio transport seam and a stdio bridge to a platform radio helper.

pub mod bridge;
pub mod config;
pub mod driver;
pub mod transport;

pub use driver::{channel, Discovery, DiscoveryListener, Driver, DriverError, EventSink};
pub use transport::{RadioTransport, TransportError};
