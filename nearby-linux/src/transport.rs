//! Radio transport seam. Calls are non-blocking requests; their outcomes come
//! back later as `Event`s through the driver's `EventSink`.

use nearby_core::{AdvertiseError, FrameEncodeError, PeerId, SessionId};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("radio unavailable")]
    Unavailable,
    #[error("request rejected with code {0}")]
    Rejected(i32),
    #[error("advertise: {0}")]
    Advertise(#[from] AdvertiseError),
    #[error("transport closed")]
    Closed,
    #[error("frame: {0}")]
    Frame(#[from] FrameEncodeError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Status code reported for a failed scan start.
    pub fn scan_code(&self) -> i32 {
        match self {
            TransportError::Rejected(code) => *code,
            _ => -1,
        }
    }

    pub fn advertise_error(&self) -> AdvertiseError {
        match self {
            TransportError::Advertise(e) => *e,
            TransportError::Rejected(code) => AdvertiseError::Other(*code),
            _ => AdvertiseError::InternalError,
        }
    }
}

pub trait RadioTransport: Send {
    fn start_scan(&mut self, service_filter: Option<Uuid>) -> Result<(), TransportError>;
    fn stop_scan(&mut self) -> Result<(), TransportError>;
    fn start_advertising(
        &mut self,
        local_name: &str,
        service_id: Uuid,
        include_name: bool,
    ) -> Result<(), TransportError>;
    fn stop_advertising(&mut self) -> Result<(), TransportError>;
    fn open_session(&mut self, peer: &PeerId, session: SessionId) -> Result<(), TransportError>;
    fn discover_services(&mut self, session: SessionId) -> Result<(), TransportError>;
    fn read_characteristic(
        &mut self,
        session: SessionId,
        service_id: Uuid,
    ) -> Result<(), TransportError>;
    fn disable_notifications(
        &mut self,
        session: SessionId,
        service_id: Uuid,
    ) -> Result<(), TransportError>;
    fn close_session(&mut self, session: SessionId) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_through() {
        assert_eq!(TransportError::Rejected(2).scan_code(), 2);
        assert_eq!(TransportError::Unavailable.scan_code(), -1);
        assert_eq!(
            TransportError::from(AdvertiseError::DataTooLarge).advertise_error(),
            AdvertiseError::DataTooLarge
        );
        assert_eq!(
            TransportError::Rejected(18).advertise_error(),
            AdvertiseError::Other(18)
        );
        assert_eq!(
            TransportError::Closed.advertise_error(),
            AdvertiseError::InternalError
        );
    }
}
