//! Driver task: owns the `DiscoveryCore` and feeds it application commands,
//! transport events and timer expiries from one queue, so every state change
//! happens on a single serialized timeline.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use nearby_core::{
    Action, AdvertiseError, ConfigError, DiscoveryCore, Event, RosterEntry, RosterOrder,
    SessionEvent, TimerId, TimerKind,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::RadioTransport;

/// Application callbacks. Called on the driver task; keep them short.
pub trait DiscoveryListener: Send {
    fn on_roster_changed(&mut self, peers: &[RosterEntry], changed: bool);
    fn on_advertising_failed(&mut self, error: AdvertiseError);
}

type Reply<T> = oneshot::Sender<Result<T, ConfigError>>;

enum Command {
    SetDiscoveryEnabled(bool),
    SetAdvertisingEnabled(bool),
    SetPaused(bool),
    SetScanBurst(Duration, Reply<()>),
    SetScanRest(Duration, Reply<()>),
    SetUserTimeout(Duration, Reply<()>),
    SetHandshakeTimeout(Duration, Reply<()>),
    SetLocalName(String, Reply<()>),
    SetRosterOrder(RosterOrder),
    Roster(oneshot::Sender<Vec<RosterEntry>>),
    Shutdown,
}

enum Input {
    Command(Command),
    Event(Event),
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("discovery driver stopped")]
    Stopped,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Application handle to a running driver.
#[derive(Clone)]
pub struct Discovery {
    tx: mpsc::UnboundedSender<Input>,
}

/// Where transports deliver their callbacks.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Input>,
}

impl EventSink {
    /// Queue a transport event. Returns false once the driver has stopped.
    pub fn send(&self, event: Event) -> bool {
        self.tx.send(Input::Event(event)).is_ok()
    }
}

/// Receiving end of the driver queue, handed to `Driver::new`.
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Input>,
    tx: mpsc::UnboundedSender<Input>,
}

pub fn channel() -> (Discovery, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Discovery { tx: tx.clone() }, Inbox { rx, tx })
}

#[cfg(test)]
impl Inbox {
    /// Next queued transport event, skipping commands.
    pub(crate) async fn next_event(&mut self) -> Option<Event> {
        while let Some(input) = self.rx.recv().await {
            if let Input::Event(event) = input {
                return Some(event);
            }
        }
        None
    }

    /// Queued transport event, if any, without waiting.
    pub(crate) fn try_next_event(&mut self) -> Option<Event> {
        while let Ok(input) = self.rx.try_recv() {
            if let Input::Event(event) = input {
                return Some(event);
            }
        }
        None
    }
}

impl Discovery {
    pub fn events(&self) -> EventSink {
        EventSink {
            tx: self.tx.clone(),
        }
    }

    pub fn set_discovery_enabled(&self, enabled: bool) -> Result<(), DriverError> {
        self.send(Command::SetDiscoveryEnabled(enabled))
    }

    pub fn set_advertising_enabled(&self, enabled: bool) -> Result<(), DriverError> {
        self.send(Command::SetAdvertisingEnabled(enabled))
    }

    pub fn set_paused(&self, paused: bool) -> Result<(), DriverError> {
        self.send(Command::SetPaused(paused))
    }

    pub fn set_roster_order(&self, order: RosterOrder) -> Result<(), DriverError> {
        self.send(Command::SetRosterOrder(order))
    }

    pub async fn set_scan_burst(&self, burst: Duration) -> Result<(), DriverError> {
        Ok(self.request(|r| Command::SetScanBurst(burst, r)).await??)
    }

    pub async fn set_scan_rest(&self, rest: Duration) -> Result<(), DriverError> {
        Ok(self.request(|r| Command::SetScanRest(rest, r)).await??)
    }

    pub async fn set_user_timeout(&self, timeout: Duration) -> Result<(), DriverError> {
        Ok(self.request(|r| Command::SetUserTimeout(timeout, r)).await??)
    }

    pub async fn set_handshake_timeout(&self, timeout: Duration) -> Result<(), DriverError> {
        Ok(self
            .request(|r| Command::SetHandshakeTimeout(timeout, r))
            .await??)
    }

    pub async fn set_local_name(&self, name: impl Into<String>) -> Result<(), DriverError> {
        let name = name.into();
        Ok(self.request(|r| Command::SetLocalName(name, r)).await??)
    }

    pub async fn roster(&self) -> Result<Vec<RosterEntry>, DriverError> {
        self.request(Command::Roster).await
    }

    /// Stop scanning and advertising, then end the driver task.
    pub fn shutdown(&self) {
        let _ = self.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<(), DriverError> {
        self.tx
            .send(Input::Command(command))
            .map_err(|_| DriverError::Stopped)
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, DriverError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| DriverError::Stopped)
    }
}

pub struct Driver<T, L> {
    core: DiscoveryCore,
    transport: T,
    listener: L,
    inbox: Inbox,
    timers: HashMap<TimerKind, (TimerId, JoinHandle<()>)>,
}

impl<T: RadioTransport, L: DiscoveryListener> Driver<T, L> {
    pub fn new(core: DiscoveryCore, transport: T, listener: L, inbox: Inbox) -> Self {
        Self {
            core,
            transport,
            listener,
            inbox,
            timers: HashMap::new(),
        }
    }

    /// Apply the start mode, then process the queue until shutdown.
    pub async fn run(mut self) {
        let actions = self.core.start(now());
        self.apply(actions);
        while let Some(input) = self.inbox.rx.recv().await {
            match input {
                Input::Event(event) => {
                    if let Event::TimerFired(timer) = event {
                        self.forget_timer(timer);
                    }
                    let actions = self.core.handle(event, now());
                    self.apply(actions);
                }
                Input::Command(Command::Shutdown) => break,
                Input::Command(command) => self.command(command),
            }
        }
        info!("discovery driver stopping");
        let mut actions = self.core.set_discovery_enabled(false, now());
        actions.extend(self.core.set_advertising_enabled(false));
        self.apply(actions);
        for (_, (_, task)) in self.timers.drain() {
            task.abort();
        }
    }

    fn command(&mut self, command: Command) {
        let now = now();
        match command {
            Command::SetDiscoveryEnabled(enabled) => {
                let actions = self.core.set_discovery_enabled(enabled, now);
                self.apply(actions);
            }
            Command::SetAdvertisingEnabled(enabled) => {
                let actions = self.core.set_advertising_enabled(enabled);
                self.apply(actions);
            }
            Command::SetPaused(paused) => {
                let actions = self.core.set_paused(paused, now);
                self.apply(actions);
            }
            Command::SetScanBurst(burst, reply) => {
                let result = self.core.set_scan_burst(burst);
                let _ = reply.send(self.apply_result(result));
            }
            Command::SetScanRest(rest, reply) => {
                let result = self.core.set_scan_rest(rest);
                let _ = reply.send(self.apply_result(result));
            }
            Command::SetLocalName(name, reply) => {
                let result = self.core.set_local_name(name);
                let _ = reply.send(self.apply_result(result));
            }
            Command::SetUserTimeout(timeout, reply) => {
                let _ = reply.send(self.core.set_user_timeout(timeout));
            }
            Command::SetHandshakeTimeout(timeout, reply) => {
                let _ = reply.send(self.core.set_handshake_timeout(timeout));
            }
            Command::SetRosterOrder(order) => self.core.set_roster_order(order),
            Command::Roster(reply) => {
                let _ = reply.send(self.core.roster());
            }
            Command::Shutdown => {}
        }
    }

    fn apply_result(
        &mut self,
        result: Result<Vec<Action>, ConfigError>,
    ) -> Result<(), ConfigError> {
        let actions = result?;
        self.apply(actions);
        Ok(())
    }

    /// Carry out actions in order. A transport call that fails synchronously
    /// becomes the event the transport would have reported, handled before
    /// the remaining actions.
    fn apply(&mut self, actions: Vec<Action>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            if let Some(event) = self.perform(action) {
                queue.extend(self.core.handle(event, now()));
            }
        }
    }

    fn perform(&mut self, action: Action) -> Option<Event> {
        match action {
            Action::StartScan { service_filter } => {
                if let Err(e) = self.transport.start_scan(service_filter) {
                    warn!(%e, "start scan failed");
                    return Some(Event::ScanFailed(e.scan_code()));
                }
            }
            Action::StopScan => {
                if let Err(e) = self.transport.stop_scan() {
                    warn!(%e, "stop scan failed");
                }
            }
            Action::StartAdvertising {
                local_name,
                service_id,
                include_name,
            } => {
                if let Err(e) =
                    self.transport
                        .start_advertising(&local_name, service_id, include_name)
                {
                    return Some(Event::AdvertiseFailed(e.advertise_error()));
                }
            }
            Action::StopAdvertising => {
                if let Err(e) = self.transport.stop_advertising() {
                    warn!(%e, "stop advertising failed");
                }
            }
            Action::OpenSession { peer, session } => {
                if let Err(e) = self.transport.open_session(&peer, session) {
                    debug!(%peer, %e, "open session failed");
                    return Some(Event::Session {
                        session,
                        event: SessionEvent::Disconnected,
                    });
                }
            }
            Action::DiscoverServices { session } => {
                if let Err(e) = self.transport.discover_services(session) {
                    debug!(session = session.0, %e, "service discovery failed");
                    return Some(Event::Session {
                        session,
                        event: SessionEvent::DiscoveryRejected,
                    });
                }
            }
            Action::ReadCharacteristic {
                session,
                service_id,
            } => {
                if let Err(e) = self.transport.read_characteristic(session, service_id) {
                    debug!(session = session.0, %e, "characteristic read failed");
                    return Some(Event::Session {
                        session,
                        event: SessionEvent::CharacteristicRead {
                            service_id,
                            value: None,
                        },
                    });
                }
            }
            Action::DisableNotifications {
                session,
                service_id,
            } => {
                if let Err(e) = self.transport.disable_notifications(session, service_id) {
                    debug!(session = session.0, %e, "disable notifications failed");
                }
            }
            Action::CloseSession { session } => {
                if let Err(e) = self.transport.close_session(session) {
                    debug!(session = session.0, %e, "close session failed");
                }
            }
            Action::ArmTimer { timer, after } => self.arm_timer(timer, after),
            Action::CancelTimer { timer } => self.cancel_timer(timer),
            Action::RosterChanged { peers, changed } => {
                self.listener.on_roster_changed(&peers, changed);
            }
            Action::AdvertisingFailed { error } => {
                self.listener.on_advertising_failed(error);
            }
        }
        None
    }

    fn arm_timer(&mut self, timer: TimerId, after: Duration) {
        let tx = self.inbox.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Input::Event(Event::TimerFired(timer)));
        });
        if let Some((_, old)) = self.timers.insert(timer.kind, (timer, task)) {
            old.abort();
        }
    }

    fn cancel_timer(&mut self, timer: TimerId) {
        if let Some((_, task)) = self.forget_timer(timer) {
            task.abort();
        }
    }

    fn forget_timer(&mut self, timer: TimerId) -> Option<(TimerId, JoinHandle<()>)> {
        match self.timers.get(&timer.kind) {
            Some((armed, _)) if *armed == timer => self.timers.remove(&timer.kind),
            _ => None,
        }
    }
}

/// Core clock. Follows tokio's clock so paused-time tests see the same instants.
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use nearby_core::{DiscoveryConfig, Observation, PeerId, SessionId, StartMode};
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    fn service() -> Uuid {
        Uuid::from_u128(0x6e65_6172_6279_0000_0000_0000_0000_0001)
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        StartScan,
        StopScan,
        StartAdvertising(String),
        StopAdvertising,
        Open(PeerId, SessionId),
        Discover(SessionId),
        Read(SessionId),
        Disable(SessionId),
        Close(SessionId),
    }

    #[derive(Clone)]
    struct Recorder {
        calls: Arc<Mutex<Vec<(u64, Call)>>>,
        started: tokio::time::Instant,
        fail_advertise: bool,
        fail_open: bool,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                calls: Arc::default(),
                started: tokio::time::Instant::now(),
                fail_advertise: false,
                fail_open: false,
            }
        }

        fn record(&self, call: Call) {
            let at = self.started.elapsed().as_secs();
            self.calls.lock().unwrap().push((at, call));
        }

        fn calls(&self) -> Vec<(u64, Call)> {
            self.calls.lock().unwrap().clone()
        }

        fn times_of(&self, call: &Call) -> Vec<u64> {
            self.calls()
                .into_iter()
                .filter(|(_, c)| c == call)
                .map(|(t, _)| t)
                .collect()
        }

        fn opened(&self) -> Vec<SessionId> {
            self.calls()
                .into_iter()
                .filter_map(|(_, c)| match c {
                    Call::Open(_, s) => Some(s),
                    _ => None,
                })
                .collect()
        }
    }

    impl RadioTransport for Recorder {
        fn start_scan(&mut self, _: Option<Uuid>) -> Result<(), TransportError> {
            self.record(Call::StartScan);
            Ok(())
        }
        fn stop_scan(&mut self) -> Result<(), TransportError> {
            self.record(Call::StopScan);
            Ok(())
        }
        fn start_advertising(&mut self, name: &str, _: Uuid, _: bool) -> Result<(), TransportError> {
            self.record(Call::StartAdvertising(name.to_owned()));
            if self.fail_advertise {
                return Err(AdvertiseError::InternalError.into());
            }
            Ok(())
        }
        fn stop_advertising(&mut self) -> Result<(), TransportError> {
            self.record(Call::StopAdvertising);
            Ok(())
        }
        fn open_session(&mut self, peer: &PeerId, session: SessionId) -> Result<(), TransportError> {
            self.record(Call::Open(peer.clone(), session));
            if self.fail_open {
                return Err(TransportError::Unavailable);
            }
            Ok(())
        }
        fn discover_services(&mut self, session: SessionId) -> Result<(), TransportError> {
            self.record(Call::Discover(session));
            Ok(())
        }
        fn read_characteristic(&mut self, session: SessionId, _: Uuid) -> Result<(), TransportError> {
            self.record(Call::Read(session));
            Ok(())
        }
        fn disable_notifications(&mut self, session: SessionId, _: Uuid) -> Result<(), TransportError> {
            self.record(Call::Disable(session));
            Ok(())
        }
        fn close_session(&mut self, session: SessionId) -> Result<(), TransportError> {
            self.record(Call::Close(session));
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Notes {
        rosters: Arc<Mutex<Vec<(Vec<RosterEntry>, bool)>>>,
        failures: Arc<Mutex<Vec<AdvertiseError>>>,
    }

    impl DiscoveryListener for Notes {
        fn on_roster_changed(&mut self, peers: &[RosterEntry], changed: bool) {
            self.rosters.lock().unwrap().push((peers.to_vec(), changed));
        }
        fn on_advertising_failed(&mut self, error: AdvertiseError) {
            self.failures.lock().unwrap().push(error);
        }
    }

    fn spawn(
        config: DiscoveryConfig,
        transport: Recorder,
        notes: Notes,
    ) -> (Discovery, JoinHandle<()>) {
        let (discovery, inbox) = channel();
        let core = DiscoveryCore::new(config).unwrap();
        let task = tokio::spawn(Driver::new(core, transport, notes, inbox).run());
        (discovery, task)
    }

    fn config(mode: StartMode) -> DiscoveryConfig {
        let mut cfg = DiscoveryConfig::new("me", service());
        cfg.start_mode = mode;
        cfg
    }

    #[tokio::test(start_paused = true)]
    async fn duty_cycle_follows_burst_and_rest() {
        let mut cfg = config(StartMode::DiscoverOnly);
        cfg.scan_burst = Duration::from_secs(5);
        cfg.scan_rest = Duration::from_secs(3);
        let radio = Recorder::new();
        let (discovery, task) = spawn(cfg, radio.clone(), Notes::default());

        tokio::time::sleep(Duration::from_secs(17)).await;
        assert_eq!(radio.times_of(&Call::StartScan), [0, 8, 16]);
        assert_eq!(radio.times_of(&Call::StopScan), [5, 13]);

        discovery.shutdown();
        task.await.unwrap();
        assert_eq!(radio.times_of(&Call::StopScan), [5, 13, 17]);
    }

    #[tokio::test(start_paused = true)]
    async fn advertise_backoff_is_2_4_8_then_gives_up() {
        let mut radio = Recorder::new();
        radio.fail_advertise = true;
        let notes = Notes::default();
        let (discovery, task) = spawn(config(StartMode::AdvertiseOnly), radio.clone(), notes.clone());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            radio.times_of(&Call::StartAdvertising("me".into())),
            [0, 2, 6, 14]
        );
        assert_eq!(
            *notes.failures.lock().unwrap(),
            [AdvertiseError::InternalError]
        );
        discovery.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn events_reach_roster_through_queue() {
        let radio = Recorder::new();
        let notes = Notes::default();
        let (discovery, task) = spawn(config(StartMode::DiscoverOnly), radio.clone(), notes.clone());
        let sink = discovery.events();

        sink.send(Event::Observed(
            Observation::new("A", -50).with_name("alice").with_service(service()),
        ));
        sink.send(Event::Observed(Observation::new("B", -60)));
        let roster = discovery.roster().await.unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].display_name, "alice");

        let session = radio.opened()[0];
        sink.send(Event::Session {
            session,
            event: SessionEvent::Connected,
        });
        sink.send(Event::Session {
            session,
            event: SessionEvent::ServicesDiscovered(vec![service()]),
        });
        sink.send(Event::Session {
            session,
            event: SessionEvent::CharacteristicRead {
                service_id: service(),
                value: Some(b"bob".to_vec()),
            },
        });
        let roster = discovery.roster().await.unwrap();
        assert_eq!(roster.len(), 2);

        let calls: Vec<Call> = radio.calls().into_iter().map(|(_, c)| c).collect();
        assert!(calls.contains(&Call::Discover(session)));
        assert!(calls.contains(&Call::Read(session)));
        assert!(calls.contains(&Call::Disable(session)));
        assert!(calls.contains(&Call::Close(session)));

        let rosters = notes.rosters.lock().unwrap().clone();
        assert_eq!(rosters.iter().filter(|(_, changed)| *changed).count(), 2);
        discovery.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_clears_attempt() {
        let mut radio = Recorder::new();
        radio.fail_open = true;
        let (discovery, task) = spawn(config(StartMode::DiscoverOnly), radio.clone(), Notes::default());
        let sink = discovery.events();

        sink.send(Event::Observed(Observation::new("B", -60)));
        sink.send(Event::Observed(Observation::new("B", -60)));
        discovery.roster().await.unwrap();
        assert_eq!(radio.opened().len(), 2);
        discovery.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn setters_report_invalid_values() {
        let (discovery, task) = spawn(config(StartMode::None), Recorder::new(), Notes::default());
        assert!(matches!(
            discovery.set_scan_burst(Duration::ZERO).await,
            Err(DriverError::Config(ConfigError::ZeroDuration(_)))
        ));
        assert!(discovery.set_local_name("").await.is_err());
        discovery.set_user_timeout(Duration::from_secs(9)).await.unwrap();
        discovery.shutdown();
        task.await.unwrap();
        assert!(matches!(
            discovery.roster().await,
            Err(DriverError::Stopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_halts_cycle_until_resumed() {
        let radio = Recorder::new();
        let (discovery, task) = spawn(config(StartMode::DiscoverOnly), radio.clone(), Notes::default());
        tokio::time::sleep(Duration::from_secs(1)).await;
        discovery.set_paused(true).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(radio.times_of(&Call::StartScan), [0]);
        discovery.set_paused(false).unwrap();
        discovery.roster().await.unwrap();
        assert_eq!(radio.times_of(&Call::StartScan), [0, 31]);
        discovery.shutdown();
        task.await.unwrap();
    }
}
