//! Stdio bridge to a platform radio helper. Transport requests go out as
//! `CoreMessage::Action` frames; the helper's callbacks come back as
//! `HostMessage::Event` frames. Both directions open with `Hello`.

use std::io;

use nearby_core::protocol::version_compatible;
use nearby_core::wire::frame_len;
use nearby_core::{
    decode_frame, encode_frame, Action, CoreMessage, FrameDecodeError, HostMessage, PeerId,
    SessionId,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::driver::EventSink;
use crate::transport::{RadioTransport, TransportError};

const READ_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("frame: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("helper speaks protocol version {0}")]
    Version(u8),
    #[error("helper sent an event before hello")]
    NoHello,
}

/// Transport that forwards every request to the helper as a frame.
pub struct BridgeTransport {
    out: mpsc::UnboundedSender<Vec<u8>>,
}

impl BridgeTransport {
    /// Start the writer task on `writer`. The task ends when the transport is
    /// dropped or the writer fails.
    pub fn spawn<W>(writer: W) -> (Self, JoinHandle<io::Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out, rx) = mpsc::unbounded_channel();
        let transport = Self { out };
        if let Err(e) = transport.send(CoreMessage::hello()) {
            warn!(%e, "queueing hello");
        }
        (transport, tokio::spawn(write_loop(writer, rx)))
    }

    fn send(&self, msg: CoreMessage) -> Result<(), TransportError> {
        let frame = encode_frame(&msg)?;
        self.out.send(frame).map_err(|_| TransportError::Closed)
    }

    fn action(&mut self, action: Action) -> Result<(), TransportError> {
        self.send(CoreMessage::Action(action))
    }
}

impl RadioTransport for BridgeTransport {
    fn start_scan(&mut self, service_filter: Option<Uuid>) -> Result<(), TransportError> {
        self.action(Action::StartScan { service_filter })
    }

    fn stop_scan(&mut self) -> Result<(), TransportError> {
        self.action(Action::StopScan)
    }

    fn start_advertising(
        &mut self,
        local_name: &str,
        service_id: Uuid,
        include_name: bool,
    ) -> Result<(), TransportError> {
        self.action(Action::StartAdvertising {
            local_name: local_name.to_owned(),
            service_id,
            include_name,
        })
    }

    fn stop_advertising(&mut self) -> Result<(), TransportError> {
        self.action(Action::StopAdvertising)
    }

    fn open_session(&mut self, peer: &PeerId, session: SessionId) -> Result<(), TransportError> {
        self.action(Action::OpenSession {
            peer: peer.clone(),
            session,
        })
    }

    fn discover_services(&mut self, session: SessionId) -> Result<(), TransportError> {
        self.action(Action::DiscoverServices { session })
    }

    fn read_characteristic(
        &mut self,
        session: SessionId,
        service_id: Uuid,
    ) -> Result<(), TransportError> {
        self.action(Action::ReadCharacteristic {
            session,
            service_id,
        })
    }

    fn disable_notifications(
        &mut self,
        session: SessionId,
        service_id: Uuid,
    ) -> Result<(), TransportError> {
        self.action(Action::DisableNotifications {
            session,
            service_id,
        })
    }

    fn close_session(&mut self, session: SessionId) -> Result<(), TransportError> {
        self.action(Action::CloseSession { session })
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        writer.write_all(&frame).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Read helper frames until EOF and queue their events on `sink`. The helper
/// must open with a compatible `Hello`. A frame whose body does not decode is
/// skipped; an oversized length prefix ends the stream since framing is lost.
pub async fn read_loop<R>(mut reader: R, sink: EventSink) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    let mut greeted = false;
    loop {
        loop {
            match decode_frame::<HostMessage>(&buf) {
                Ok((msg, used)) => {
                    buf.drain(..used);
                    if !dispatch(msg, &mut greeted, &sink)? {
                        debug!("driver stopped; bridge reader exiting");
                        return Ok(());
                    }
                }
                Err(FrameDecodeError::NeedMore) => break,
                Err(FrameDecodeError::Decode(e)) => {
                    warn!(%e, "skipping undecodable frame");
                    let skip = frame_len(&buf)?.map(|len| 4 + len).unwrap_or(buf.len());
                    buf.drain(..skip);
                }
                Err(e) => return Err(e.into()),
            }
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if !buf.is_empty() {
                warn!(bytes = buf.len(), "helper closed mid-frame");
            }
            info!("radio helper disconnected");
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Returns false once the driver is gone.
fn dispatch(msg: HostMessage, greeted: &mut bool, sink: &EventSink) -> Result<bool, BridgeError> {
    match msg {
        HostMessage::Hello { protocol_version } => {
            if !version_compatible(protocol_version) {
                return Err(BridgeError::Version(protocol_version));
            }
            info!(protocol_version, "radio helper connected");
            *greeted = true;
            Ok(true)
        }
        HostMessage::Event(_) if !*greeted => Err(BridgeError::NoHello),
        HostMessage::Event(event) => Ok(sink.send(event)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver;
    use nearby_core::{Event, Observation, SessionEvent, PROTOCOL_VERSION};

    async fn read_frames(reader: &mut tokio::io::DuplexStream, count: usize) -> Vec<CoreMessage> {
        let mut buf = Vec::new();
        let mut out = Vec::new();
        let mut chunk = [0u8; 256];
        while out.len() < count {
            match decode_frame::<CoreMessage>(&buf) {
                Ok((msg, used)) => {
                    buf.drain(..used);
                    out.push(msg);
                }
                Err(FrameDecodeError::NeedMore) => {
                    let n = reader.read(&mut chunk).await.unwrap();
                    assert!(n > 0, "writer closed early");
                    buf.extend_from_slice(&chunk[..n]);
                }
                Err(e) => panic!("{e}"),
            }
        }
        out
    }

    #[tokio::test]
    async fn requests_are_framed_after_hello() {
        let (ours, mut theirs) = tokio::io::duplex(1024);
        let (mut transport, _task) = BridgeTransport::spawn(ours);
        transport.start_scan(None).unwrap();
        transport.close_session(SessionId(4)).unwrap();

        let frames = read_frames(&mut theirs, 3).await;
        assert_eq!(frames[0], CoreMessage::hello());
        assert_eq!(
            frames[1],
            CoreMessage::Action(Action::StartScan {
                service_filter: None
            })
        );
        assert_eq!(
            frames[2],
            CoreMessage::Action(Action::CloseSession {
                session: SessionId(4)
            })
        );
    }

    #[tokio::test]
    async fn helper_events_reach_the_driver_queue() {
        let (discovery, mut inbox) = driver::channel();
        let (mut helper, ours) = tokio::io::duplex(1024);
        let reader = tokio::spawn(read_loop(ours, discovery.events()));

        let observed = Event::Observed(Observation::new("A", -40));
        let session = Event::Session {
            session: SessionId(1),
            event: SessionEvent::Connected,
        };
        let mut bytes = encode_frame(&HostMessage::hello()).unwrap();
        bytes.extend(encode_frame(&HostMessage::Event(observed.clone())).unwrap());
        // garbage body with a valid prefix is skipped
        bytes.extend(2u32.to_le_bytes());
        bytes.extend([0xff, 0xff]);
        bytes.extend(encode_frame(&HostMessage::Event(session.clone())).unwrap());
        helper.write_all(&bytes).await.unwrap();
        drop(helper);

        assert_eq!(inbox.next_event().await, Some(observed));
        assert_eq!(inbox.next_event().await, Some(session));
        reader.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn events_before_hello_are_refused() {
        let (discovery, mut inbox) = driver::channel();
        let (mut helper, ours) = tokio::io::duplex(1024);
        let reader = tokio::spawn(read_loop(ours, discovery.events()));
        let mut bytes =
            encode_frame(&HostMessage::Event(Event::Observed(Observation::new("A", -40)))).unwrap();
        bytes.extend(encode_frame(&HostMessage::hello()).unwrap());
        helper.write_all(&bytes).await.unwrap();

        assert!(matches!(reader.await.unwrap(), Err(BridgeError::NoHello)));
        assert_eq!(inbox.try_next_event(), None);
    }

    #[tokio::test]
    async fn incompatible_helper_is_refused() {
        let (discovery, _inbox) = driver::channel();
        let (mut helper, ours) = tokio::io::duplex(64);
        let reader = tokio::spawn(read_loop(ours, discovery.events()));
        let hello = encode_frame(&HostMessage::Hello {
            protocol_version: PROTOCOL_VERSION + 1,
        })
        .unwrap();
        helper.write_all(&hello).await.unwrap();
        assert!(matches!(
            reader.await.unwrap(),
            Err(BridgeError::Version(v)) if v == PROTOCOL_VERSION + 1
        ));
    }
}
