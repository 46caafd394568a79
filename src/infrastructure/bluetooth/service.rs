//! LED Control Service
//!
//! Owns the link to the LED controller board. A single actor task (the
//! apply context) holds every mutable piece: connection state, the active
//! writer and reader, and the device state store. Everything else, from
//! connect attempts to reader lines to caller submissions, is posted to it
//! as a [`ServiceEvent`], so state mutations and listener notifications
//! never race.

use crate::domain::listeners::{LedControlListener, ListenerBus, ListenerId};
use crate::domain::models::{ConnectionState, DeviceState, LayerSettings, MAX_LAYERS};
use crate::domain::settings::LinkSettings;
use crate::infrastructure::bluetooth::connector::{self, Connector, Link, LinkError};
use crate::infrastructure::bluetooth::protocol::{self, BOOTSTRAP_SEQUENCE};
use crate::infrastructure::bluetooth::reader::{self, ReaderEvent};
use crate::infrastructure::bluetooth::writer::{CommandWriter, WriterTiming};
use std::any::Any;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

/// How a command is submitted to the writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Always queued (e.g. the user released a slider)
    Commit,
    /// Dropped if a command is already waiting (e.g. the user is dragging)
    Preview,
}

type Edit = Box<dyn FnOnce(&mut DeviceState) -> String + Send>;

enum ServiceEvent {
    RequestConnect(Duration),
    /// `retry_of` is the link generation a retry timer was armed under
    Connect { retry_of: Option<u64> },
    AttemptFinished(Result<Link, LinkError>),
    Reader { generation: u64, event: ReaderEvent },
    Send { command: String, mode: SendMode },
    Edit { edit: Edit, mode: SendMode },
    Shutdown,
}

/// Cloneable handle to the service. The actor shuts down when the last
/// handle is dropped or [`LedControlService::shutdown`] is called.
#[derive(Clone)]
pub struct LedControlService {
    shared: Arc<Shared>,
}

struct Shared {
    events: mpsc::UnboundedSender<ServiceEvent>,
    state: Arc<RwLock<DeviceState>>,
    listeners: Arc<ListenerBus>,
    connection: watch::Receiver<ConnectionState>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = self.events.send(ServiceEvent::Shutdown);
    }
}

impl LedControlService {
    /// Start the service and immediately begin connecting. Must be called
    /// from within a tokio runtime.
    pub fn start<C: Connector>(settings: LinkSettings, connector: C) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(DeviceState::new()));
        let listeners = Arc::new(ListenerBus::new());
        let (connection_tx, connection) = watch::channel(ConnectionState::Disconnected);

        info!(
            "Starting LED control service for device {:?}",
            settings.device_name
        );

        let actor = ServiceActor {
            connector: Arc::new(connector),
            settings,
            events: events.clone(),
            state: Arc::clone(&state),
            listeners: Arc::clone(&listeners),
            connection: connection_tx,
            link: None,
            generation: 0,
        };
        tokio::spawn(actor.run(rx));

        Self {
            shared: Arc::new(Shared {
                events,
                state,
                listeners,
                connection,
            }),
        }
    }

    /// Close the link and stop the service
    pub fn shutdown(&self) {
        self.post(ServiceEvent::Shutdown);
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.connection.borrow()
    }

    /// Receiver that observes every connection state the service settles in
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.shared.connection.clone()
    }

    /// Read access to the live device state. Hold the guard briefly: the
    /// service cannot apply device reports while it is held.
    pub fn state(&self) -> RwLockReadGuard<'_, DeviceState> {
        self.shared
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_listener(&self, listener: Arc<dyn LedControlListener>) -> ListenerId {
        self.shared.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    /// Queue a command for the board. Reconnects instead if there is no live
    /// link; the command is then dropped.
    pub fn send_command(&self, command: impl Into<String>) {
        self.post(ServiceEvent::Send {
            command: command.into(),
            mode: SendMode::Commit,
        });
    }

    /// Queue a command only if the writer is idle
    pub fn send_command_if_ready(&self, command: impl Into<String>) {
        self.post(ServiceEvent::Send {
            command: command.into(),
            mode: SendMode::Preview,
        });
    }

    /// Tear down the current link (if any) and reconnect after `delay`.
    /// Ignored while a connect attempt is in flight.
    pub fn request_connect(&self, delay: Duration) {
        self.post(ServiceEvent::RequestConnect(delay));
    }

    /// Edit global brightness settings locally and send them to the board
    pub fn update_global<F>(&self, mode: SendMode, edit: F)
    where
        F: FnOnce(&mut DeviceState) + Send + 'static,
    {
        let edit: Edit = Box::new(move |state| {
            edit(&mut *state);
            protocol::encode_global(state)
        });
        self.post(ServiceEvent::Edit { edit, mode });
    }

    /// Edit one layer locally (creating it if needed) and send it to the board
    pub fn update_layer<F>(&self, index: usize, mode: SendMode, edit: F)
    where
        F: FnOnce(&mut LayerSettings) + Send + 'static,
    {
        if index >= MAX_LAYERS {
            warn!("Ignoring edit of layer {} (limit {})", index, MAX_LAYERS);
            return;
        }
        let edit: Edit = Box::new(move |state| {
            let layer = state.layer_mut(index);
            edit(&mut *layer);
            protocol::encode_layer(layer)
        });
        self.post(ServiceEvent::Edit { edit, mode });
    }

    fn post(&self, event: ServiceEvent) {
        if self.shared.events.send(event).is_err() {
            debug!("LED control service has stopped");
        }
    }
}

struct ActiveLink {
    generation: u64,
    writer: CommandWriter,
    // Dropping this ends the reader
    _close: oneshot::Sender<()>,
    _socket: Option<Box<dyn Any + Send>>,
}

struct ServiceActor<C> {
    connector: Arc<C>,
    settings: LinkSettings,
    events: mpsc::UnboundedSender<ServiceEvent>,
    state: Arc<RwLock<DeviceState>>,
    listeners: Arc<ListenerBus>,
    connection: watch::Sender<ConnectionState>,
    link: Option<ActiveLink>,
    generation: u64,
}

impl<C: Connector> ServiceActor<C> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ServiceEvent>) {
        self.schedule_connect(Duration::ZERO);

        while let Some(event) = rx.recv().await {
            match event {
                ServiceEvent::RequestConnect(delay) => self.schedule_connect(delay),
                ServiceEvent::Connect { retry_of } => {
                    if retry_of.is_some_and(|generation| generation != self.generation) {
                        trace!("Dropping retry armed before link {}", self.generation);
                    } else {
                        self.begin_attempt();
                    }
                }
                ServiceEvent::AttemptFinished(result) => self.finish_attempt(result),
                ServiceEvent::Reader { generation, event } => {
                    self.handle_reader(generation, event)
                }
                ServiceEvent::Send { command, mode } => self.submit(command, mode),
                ServiceEvent::Edit { edit, mode } => {
                    let command = {
                        let mut state = self.write_state();
                        edit(&mut *state)
                    };
                    self.submit(command, mode);
                }
                ServiceEvent::Shutdown => break,
            }
        }

        self.close_link();
        self.set_connection(ConnectionState::Disconnected);
        info!("LED control service stopped");
    }

    fn schedule_connect(&self, delay: Duration) {
        self.post_connect(delay, None);
    }

    /// Retry after a failed attempt, unless a link comes up in the meantime
    fn schedule_retry(&self) {
        self.post_connect(self.settings.retry_delay(), Some(self.generation));
    }

    fn post_connect(&self, delay: Duration, retry_of: Option<u64>) {
        let event = ServiceEvent::Connect { retry_of };
        if delay.is_zero() {
            let _ = self.events.send(event);
            return;
        }

        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }

    fn begin_attempt(&mut self) {
        if *self.connection.borrow() == ConnectionState::Connecting {
            trace!("Connect attempt already in flight");
            return;
        }

        self.close_link();
        self.set_connection(ConnectionState::Connecting);

        let connector = Arc::clone(&self.connector);
        let device_name = self.settings.device_name.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = connector::open_link(connector.as_ref(), &device_name).await;
            let _ = events.send(ServiceEvent::AttemptFinished(result));
        });
    }

    fn finish_attempt(&mut self, result: Result<Link, LinkError>) {
        let link = match result {
            Ok(link) => link,
            Err(e) => {
                warn!(
                    "Failed to connect: {}. Retrying in {} ms",
                    e, self.settings.retry_delay_ms
                );
                self.set_connection(ConnectionState::Disconnected);
                self.schedule_retry();
                return;
            }
        };

        self.generation += 1;
        let generation = self.generation;

        let (writer, _) = CommandWriter::spawn(link.writer, WriterTiming::from(&self.settings));

        let (close, close_rx) = oneshot::channel();
        let events = self.events.clone();
        reader::spawn(link.reader, close_rx, move |event| {
            let _ = events.send(ServiceEvent::Reader { generation, event });
        });

        // Ask for the pattern catalog and the current state of everything
        for request in BOOTSTRAP_SEQUENCE {
            writer.send_command(request.as_str());
        }

        self.link = Some(ActiveLink {
            generation,
            writer,
            _close: close,
            _socket: link.socket,
        });
        info!("Connected to {} (link {})", self.settings.device_name, generation);
        self.set_connection(ConnectionState::Connected);
    }

    fn handle_reader(&mut self, generation: u64, event: ReaderEvent) {
        let live = self.link.as_ref().map(|link| link.generation) == Some(generation);
        if !live {
            trace!("Ignoring event from stale link {}", generation);
            return;
        }

        match event {
            ReaderEvent::Line(line) => self.apply_line(&line),
            ReaderEvent::Closed => {
                info!("Link {} lost, reconnecting", generation);
                self.schedule_connect(Duration::ZERO);
            }
        }
    }

    fn apply_line(&self, line: &str) {
        let delta = match protocol::decode_line(line) {
            Ok(delta) => delta,
            Err(e) => {
                warn!("Invalid config line {:?}: {}", line, e);
                return;
            }
        };

        delta.apply(&mut *self.write_state());
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        self.listeners.emit_device_state(&state);
    }

    fn submit(&mut self, command: String, mode: SendMode) {
        let Some(writer) = self.live_writer() else {
            debug!("No active writer, requesting connect");
            self.schedule_connect(Duration::ZERO);
            return;
        };

        let queued = match mode {
            SendMode::Commit => writer.send_command(command),
            SendMode::Preview => writer.send_command_if_ready(command),
        };
        if !queued {
            trace!("{:?} command not queued", mode);
        }
    }

    fn live_writer(&self) -> Option<&CommandWriter> {
        self.link
            .as_ref()
            .map(|link| &link.writer)
            .filter(|writer| writer.is_alive())
    }

    /// Stop the writer and close the link; the reader sees the close and
    /// winds down on its own
    fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            debug!("Closing link {}", link.generation);
            link.writer.stop();
        }
    }

    fn set_connection(&self, state: ConnectionState) {
        let previous = self.connection.send_replace(state);
        if previous != state {
            info!("Connection status: {}", state);
        }
        self.listeners.emit_connection_state(state);
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, DeviceState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::connector::mock::{
        duplex_link, MockConnector, MockOutcome,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Note {
        Connection(ConnectionState),
        Device,
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Note>,
    }

    impl LedControlListener for Recorder {
        fn on_connection_state_change(&self, state: ConnectionState) {
            let _ = self.tx.send(Note::Connection(state));
        }

        fn on_device_state_change(&self, _state: &DeviceState) {
            let _ = self.tx.send(Note::Device);
        }
    }

    fn test_settings() -> LinkSettings {
        LinkSettings {
            retry_delay_ms: 50,
            command_pacing_ms: 1,
            writer_poll_ms: 50,
            ..LinkSettings::default()
        }
    }

    fn start(
        settings: LinkSettings,
        outcomes: Vec<MockOutcome>,
    ) -> (
        LedControlService,
        Arc<MockConnector>,
        mpsc::UnboundedReceiver<Note>,
    ) {
        let connector = Arc::new(MockConnector::new(&settings.device_name, outcomes));
        let service = LedControlService::start(settings, SharedConnector(Arc::clone(&connector)));
        let (tx, rx) = mpsc::unbounded_channel();
        service.add_listener(Arc::new(Recorder { tx }));
        (service, connector, rx)
    }

    /// Lets a test keep inspecting the connector the service owns
    struct SharedConnector(Arc<MockConnector>);

    impl Connector for SharedConnector {
        async fn paired_devices(
            &self,
        ) -> Result<Vec<connector::PairedDevice>, LinkError> {
            self.0.paired_devices().await
        }

        async fn connect(
            &self,
            device: &connector::PairedDevice,
            strategy: connector::ConnectStrategy,
        ) -> Result<Link, LinkError> {
            self.0.connect(device, strategy).await
        }
    }

    async fn next_note(rx: &mut mpsc::UnboundedReceiver<Note>) -> Note {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("service dropped listener")
    }

    async fn wait_for_connection(rx: &mut mpsc::UnboundedReceiver<Note>, wanted: ConnectionState) {
        loop {
            if next_note(rx).await == Note::Connection(wanted) {
                return;
            }
        }
    }

    async fn read_board(board: &mut DuplexStream, len: usize) -> String {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(Duration::from_secs(2), board.read_exact(&mut buf))
            .await
            .expect("timed out reading from link")
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn test_connects_and_requests_catalog_and_config() {
        let (link, mut board) = duplex_link();
        let (service, _connector, mut notes) =
            start(test_settings(), vec![MockOutcome::Link(link)]);

        assert_eq!(
            next_note(&mut notes).await,
            Note::Connection(ConnectionState::Connecting)
        );
        assert_eq!(
            next_note(&mut notes).await,
            Note::Connection(ConnectionState::Connected)
        );
        assert_eq!(service.connection_state(), ConnectionState::Connected);

        assert_eq!(read_board(&mut board, 2).await, "lc");
    }

    #[tokio::test]
    async fn test_device_reports_update_state_and_notify() {
        let (link, mut board) = duplex_link();
        let (service, _connector, mut notes) =
            start(test_settings(), vec![MockOutcome::Link(link)]);
        wait_for_connection(&mut notes, ConnectionState::Connected).await;

        board
            .write_all(b"b128\ns10,20,30,40\nz1,2,3\nl1,Rainbow,speed,0,10\n")
            .await
            .unwrap();

        // The invalid line produces no notification
        for _ in 0..3 {
            assert_eq!(next_note(&mut notes).await, Note::Device);
        }

        let state = service.state();
        assert_eq!(state.global_brightness, 128);
        assert_eq!(state.section_brightness, [10, 20, 30, 40]);
        assert_eq!(state.patterns().len(), 2);
        assert_eq!(state.pattern(1).unwrap().name, "Rainbow");
        assert_eq!(state.layer_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_error_triggers_reconnect() {
        let (first, board) = duplex_link();
        let (second, mut second_board) = duplex_link();
        let (service, connector, mut notes) = start(
            test_settings(),
            vec![MockOutcome::Link(first), MockOutcome::Link(second)],
        );
        wait_for_connection(&mut notes, ConnectionState::Connected).await;

        drop(board);

        assert_eq!(
            next_note(&mut notes).await,
            Note::Connection(ConnectionState::Connecting)
        );
        assert_eq!(
            next_note(&mut notes).await,
            Note::Connection(ConnectionState::Connected)
        );
        assert_eq!(service.connection_state(), ConnectionState::Connected);
        assert_eq!(connector.discoveries(), 2);
        assert_eq!(read_board(&mut second_board, 2).await, "lc");
    }

    #[tokio::test]
    async fn test_failed_attempt_retries_after_delay() {
        let (link, _board) = duplex_link();
        let (_service, connector, mut notes) = start(
            test_settings(),
            vec![
                MockOutcome::Fail("primary"),
                MockOutcome::Fail("fallback"),
                MockOutcome::Link(link),
            ],
        );

        let expected = [
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ];
        for state in expected {
            assert_eq!(next_note(&mut notes).await, Note::Connection(state));
        }
        assert_eq!(connector.discoveries(), 2);
    }

    #[tokio::test]
    async fn test_missing_device_keeps_retrying() {
        let settings = LinkSettings {
            device_name: "LED-BOARD".to_string(),
            ..test_settings()
        };
        let connector = MockConnector::new("Something else", Vec::new());
        let service = LedControlService::start(settings, connector);
        let mut connection = service.watch_connection();

        let mut disconnects = 0;
        while disconnects < 2 {
            tokio::time::timeout(Duration::from_secs(2), connection.changed())
                .await
                .unwrap()
                .unwrap();
            if *connection.borrow_and_update() == ConnectionState::Disconnected {
                disconnects += 1;
            }
        }
    }

    #[tokio::test]
    async fn test_send_while_disconnected_triggers_connect() {
        let settings = LinkSettings {
            retry_delay_ms: 60_000,
            ..test_settings()
        };
        let (link, mut board) = duplex_link();
        let (service, connector, mut notes) = start(
            settings,
            vec![
                MockOutcome::Fail("primary"),
                MockOutcome::Fail("fallback"),
                MockOutcome::Link(link),
            ],
        );
        wait_for_connection(&mut notes, ConnectionState::Disconnected).await;

        // Dropped, but kicks off a connect long before the retry timer
        service.send_command("b5\n");
        wait_for_connection(&mut notes, ConnectionState::Connected).await;
        assert_eq!(connector.discoveries(), 2);

        service.send_command("b6\n");
        assert_eq!(read_board(&mut board, 5).await, "lcb6\n");
    }

    #[tokio::test]
    async fn test_retry_timer_does_not_replace_newer_link() {
        let settings = LinkSettings {
            retry_delay_ms: 200,
            ..test_settings()
        };
        let (link, mut board) = duplex_link();
        let (service, connector, mut notes) = start(
            settings,
            vec![
                MockOutcome::Fail("primary"),
                MockOutcome::Fail("fallback"),
                MockOutcome::Link(link),
            ],
        );
        wait_for_connection(&mut notes, ConnectionState::Disconnected).await;

        // Connect before the retry timer fires
        service.request_connect(Duration::ZERO);
        wait_for_connection(&mut notes, ConnectionState::Connected).await;
        assert_eq!(read_board(&mut board, 2).await, "lc");

        // The timer fires while connected and must be ignored
        let quiet = tokio::time::timeout(Duration::from_millis(400), notes.recv()).await;
        assert!(quiet.is_err(), "unexpected notification {:?}", quiet);
        assert_eq!(service.connection_state(), ConnectionState::Connected);
        assert_eq!(connector.discoveries(), 2);

        service.send_command("b1\n");
        assert_eq!(read_board(&mut board, 3).await, "b1\n");
    }

    #[tokio::test]
    async fn test_stale_reader_events_ignored() {
        let (first, _board) = duplex_link();
        let (second, mut second_board) = duplex_link();
        let (service, connector, mut notes) = start(
            test_settings(),
            vec![MockOutcome::Link(first), MockOutcome::Link(second)],
        );
        wait_for_connection(&mut notes, ConnectionState::Connected).await;

        service.request_connect(Duration::ZERO);
        wait_for_connection(&mut notes, ConnectionState::Connected).await;
        assert_eq!(read_board(&mut second_board, 2).await, "lc");

        // Late events from link 1 arrive after link 2 is up
        service.post(ServiceEvent::Reader {
            generation: 1,
            event: ReaderEvent::Line("b99".to_string()),
        });
        service.post(ServiceEvent::Reader {
            generation: 1,
            event: ReaderEvent::Closed,
        });

        let quiet = tokio::time::timeout(Duration::from_millis(200), notes.recv()).await;
        assert!(quiet.is_err(), "unexpected notification {:?}", quiet);
        assert_eq!(service.connection_state(), ConnectionState::Connected);
        assert_eq!(connector.discoveries(), 2);
        assert_eq!(service.state().global_brightness, 0);

        // Link 2 still works
        second_board.write_all(b"b12\n").await.unwrap();
        assert_eq!(next_note(&mut notes).await, Note::Device);
        assert_eq!(service.state().global_brightness, 12);
    }

    #[tokio::test]
    async fn test_reconnect_drops_commands_queued_for_old_link() {
        let settings = LinkSettings {
            command_pacing_ms: 100,
            ..test_settings()
        };
        let (first, mut first_board) = duplex_link();
        let (second, mut second_board) = duplex_link();
        let (service, _connector, mut notes) = start(
            settings,
            vec![MockOutcome::Link(first), MockOutcome::Link(second)],
        );
        wait_for_connection(&mut notes, ConnectionState::Connected).await;

        for i in 0..5 {
            service.send_command(format!("b{}\n", i));
        }
        service.request_connect(Duration::ZERO);
        wait_for_connection(&mut notes, ConnectionState::Connected).await;

        let mut written = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), first_board.read_to_end(&mut written))
            .await
            .unwrap()
            .unwrap();
        let written = String::from_utf8(written).unwrap();
        assert!(written.starts_with('l'), "old link got {:?}", written);
        assert!(!written.contains("b4"), "old link got {:?}", written);

        assert_eq!(read_board(&mut second_board, 2).await, "lc");
    }

    #[tokio::test]
    async fn test_update_layer_beyond_limit_ignored() {
        let (link, mut board) = duplex_link();
        let (service, _connector, mut notes) =
            start(test_settings(), vec![MockOutcome::Link(link)]);
        wait_for_connection(&mut notes, ConnectionState::Connected).await;
        assert_eq!(read_board(&mut board, 2).await, "lc");

        service.update_layer(100_000_000, SendMode::Commit, |layer| layer.anim_step = 1);
        service.send_command("b1\n");

        assert_eq!(read_board(&mut board, 3).await, "b1\n");
        assert_eq!(service.state().layer_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_connect_requests_collapse() {
        let (first, _board) = duplex_link();
        let (second, _second_board) = duplex_link();
        let (service, connector, mut notes) = start(
            test_settings(),
            vec![MockOutcome::Link(first), MockOutcome::Link(second)],
        );
        wait_for_connection(&mut notes, ConnectionState::Connected).await;

        service.request_connect(Duration::ZERO);
        service.request_connect(Duration::ZERO);
        service.request_connect(Duration::ZERO);

        wait_for_connection(&mut notes, ConnectionState::Connected).await;
        // Let any stray requests run their course
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(connector.discoveries(), 2);
        assert_eq!(service.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_local_edits_are_encoded_and_sent() {
        let (link, mut board) = duplex_link();
        let (service, _connector, mut notes) =
            start(test_settings(), vec![MockOutcome::Link(link)]);
        wait_for_connection(&mut notes, ConnectionState::Connected).await;
        assert_eq!(read_board(&mut board, 2).await, "lc");

        service.update_global(SendMode::Commit, |state| {
            state.global_brightness = 77;
            state.section_brightness[2] = 9;
        });
        let expected = "b77\ns0,0,9,0\n";
        assert_eq!(read_board(&mut board, expected.len()).await, expected);

        service.update_layer(1, SendMode::Commit, |layer| {
            layer.pattern_num = 3;
            layer.args = [5, 6, 7];
            layer.anim_speed = 500;
            layer.anim_step = 10;
        });
        let expected = "p1,3,5,6,7\na1,31\nt1,10\n";
        assert_eq!(read_board(&mut board, expected.len()).await, expected);

        let state = service.state();
        assert_eq!(state.global_brightness, 77);
        assert_eq!(state.layer(1).unwrap().pattern_num, 3);
        assert_eq!(state.layer(0).unwrap().layer_num, 0);
    }

    #[tokio::test]
    async fn test_shutdown_disconnects() {
        let (link, mut board) = duplex_link();
        let (service, _connector, mut notes) =
            start(test_settings(), vec![MockOutcome::Link(link)]);
        wait_for_connection(&mut notes, ConnectionState::Connected).await;

        service.shutdown();
        wait_for_connection(&mut notes, ConnectionState::Disconnected).await;
        assert_eq!(service.connection_state(), ConnectionState::Disconnected);

        // The writer exits and the link closes
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), board.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_removed_listener_not_notified() {
        let (link, _board) = duplex_link();
        let (service, _connector, mut notes) =
            start(test_settings(), vec![MockOutcome::Link(link)]);

        let (tx, mut removed_notes) = mpsc::unbounded_channel();
        let id = service.add_listener(Arc::new(Recorder { tx }));
        assert!(service.remove_listener(id));

        wait_for_connection(&mut notes, ConnectionState::Connected).await;
        assert!(removed_notes.try_recv().is_err());
    }
}
