//! Tokio driver for the connection state machine.
//!
//! [`Transport`] is a cheap clonable handle. The spawned driver task owns the
//! [`ConnectionMachine`] and the socket, sleeps until the machine's next
//! deadline, and publishes state on a watch channel and lifecycle events on a
//! broadcast channel so any number of observers can follow along.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::config::TransportConfig;
use super::connection::{Action, ConnectionMachine, TransportEvent, TransportState};
use super::socket::{Connector, Socket, SocketEvent, SocketEventSink};
use crate::core::{ConfigError, EVENT_CHANNEL_CAPACITY, Target, TransportError};

#[derive(Debug, Clone, Copy)]
enum Command {
    Connect,
    Disconnect,
    Destroy,
    PauseHeartbeat,
    ResumeHeartbeat,
    ImmediateReconnect,
}

struct ActiveSocket {
    generation: u64,
    socket: Arc<dyn Socket>,
    open: bool,
}

struct Shared {
    target: Target,
    state: watch::Sender<TransportState>,
    events: broadcast::Sender<TransportEvent>,
    active: Mutex<Option<ActiveSocket>>,
    has_ever_connected: AtomicBool,
    destroyed: AtomicBool,
}

impl Shared {
    fn active(&self) -> std::sync::MutexGuard<'_, Option<ActiveSocket>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to a running connection transport for one target.
///
/// Dropping every handle destroys the transport.
#[derive(Clone)]
pub struct Transport {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("target", &self.shared.target)
            .field("state", &self.state())
            .finish()
    }
}

impl Transport {
    /// Validate `config` and spawn the driver task.
    ///
    /// Must be called from within a tokio runtime. The transport starts
    /// idle; call [`connect`](Self::connect) to dial.
    pub fn spawn(
        target: Target,
        config: TransportConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(TransportState::Idle);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let shared = Arc::new(Shared {
            target,
            state,
            events,
            active: Mutex::new(None),
            has_ever_connected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        });

        let driver = Driver {
            machine: ConnectionMachine::new(config),
            connector,
            shared: Arc::clone(&shared),
            socket_tx,
        };
        tokio::spawn(driver.run(command_rx, socket_rx));

        Ok(Self { commands, shared })
    }

    /// Target this transport dials.
    pub fn target(&self) -> &Target {
        &self.shared.target
    }

    /// Current state.
    pub fn state(&self) -> TransportState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.shared.state.subscribe()
    }

    /// Subscribe to lifecycle events and inbound frames.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    /// Whether the socket is open right now.
    pub fn is_connected(&self) -> bool {
        self.shared
            .active()
            .as_ref()
            .is_some_and(|active| active.open)
    }

    /// Whether the transport has ever been connected.
    pub fn has_ever_connected(&self) -> bool {
        self.shared.has_ever_connected.load(Ordering::Acquire)
    }

    /// Whether `destroy` was called.
    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }

    /// Send a text frame on the open socket.
    ///
    /// Never queues. Callers that need queuing go through the router.
    pub fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
        if self.is_destroyed() {
            return Err(TransportError::Destroyed);
        }
        let active = self.shared.active();
        match active.as_ref() {
            Some(active) if active.open => active.socket.send(text.into()),
            _ => Err(TransportError::NotOpen),
        }
    }

    /// Open a connection unless one is already opening or open.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Close the connection and stop reconnecting until `connect`.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Tear down permanently. Later `connect` calls are no-ops.
    pub fn destroy(&self) {
        self.shared.destroyed.store(true, Ordering::Release);
        self.command(Command::Destroy);
    }

    /// Suspend heartbeat checks, e.g. while the app is backgrounded.
    pub fn pause_heartbeat(&self) {
        self.command(Command::PauseHeartbeat);
    }

    /// Resume heartbeat checks with an immediate ping.
    pub fn resume_heartbeat(&self) {
        self.command(Command::ResumeHeartbeat);
    }

    /// Retry right away instead of waiting out the backoff delay.
    pub fn immediate_reconnect(&self) {
        self.command(Command::ImmediateReconnect);
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(?command, "transport driver gone, command dropped");
        }
    }
}

struct Driver {
    machine: ConnectionMachine,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    socket_tx: mpsc::UnboundedSender<(u64, SocketEvent)>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut socket_events: mpsc::UnboundedReceiver<(u64, SocketEvent)>,
    ) {
        debug!(address = %self.shared.target, "transport driver started");
        loop {
            let deadline = self.machine.next_deadline().map(Instant::from_std);
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => {
                        debug!("all transport handles dropped");
                        self.machine.destroy();
                    }
                },
                Some((generation, event)) = socket_events.recv() => {
                    self.on_socket_event(generation, event);
                }
                _ = sleep_until(deadline) => {
                    self.machine.poll(now());
                }
            }
            self.execute();
            if self.machine.is_destroyed() {
                break;
            }
        }
        debug!(address = %self.shared.target, "transport driver stopped");
    }

    fn apply(&mut self, command: Command) {
        let now = now();
        match command {
            Command::Connect => self.machine.connect(now),
            Command::Disconnect => self.machine.disconnect(),
            Command::Destroy => self.machine.destroy(),
            Command::PauseHeartbeat => self.machine.pause_heartbeat(),
            Command::ResumeHeartbeat => self.machine.resume_heartbeat(now),
            Command::ImmediateReconnect => self.machine.immediate_reconnect(now),
        }
    }

    fn on_socket_event(&mut self, generation: u64, event: SocketEvent) {
        match event {
            SocketEvent::Open => self.machine.on_open(generation, now()),
            SocketEvent::Message(text) => self.machine.on_message(generation, text),
            SocketEvent::Activity => self.machine.on_activity(generation),
            SocketEvent::Error(message) => self.machine.on_error(generation, message),
            SocketEvent::Close => self.machine.on_close(generation, now()),
        }
    }

    fn execute(&mut self) {
        // Senders must see the socket as open before anyone hears about it.
        self.sync_active();

        while let Some(action) = self.machine.poll_action() {
            match action {
                Action::Open { generation } => self.open(generation),
                Action::Close { generation } => self.close(generation),
                Action::Heartbeat { generation, token } => {
                    let active = self.shared.active();
                    if let Some(active) = active.as_ref().filter(|a| a.generation == generation) {
                        if let Err(e) = active.socket.send(token.as_str().to_string()) {
                            warn!(generation, error = %e, "failed to send heartbeat");
                        }
                    }
                }
                Action::Emit(event) => self.publish(event),
            }
        }
    }

    fn sync_active(&self) {
        let generation = self.machine.generation();
        let open = self.machine.is_open();
        if let Some(active) = self.shared.active().as_mut() {
            active.open = open && active.generation == generation;
        }
    }

    fn open(&mut self, generation: u64) {
        let sink = SocketEventSink::new(generation, self.socket_tx.clone());
        let socket = self.connector.open(self.shared.target.url(), sink);
        let previous = self.shared.active().replace(ActiveSocket {
            generation,
            socket,
            open: false,
        });
        if let Some(previous) = previous {
            previous.socket.close();
        }
    }

    fn close(&mut self, generation: u64) {
        let mut active = self.shared.active();
        if active.as_ref().is_some_and(|a| a.generation == generation) {
            if let Some(previous) = active.take() {
                previous.socket.close();
            }
        }
    }

    fn publish(&self, event: TransportEvent) {
        if let TransportEvent::StateChanged(state) = event {
            if state == TransportState::Connected {
                self.shared.has_ever_connected.store(true, Ordering::Release);
            }
            if state == TransportState::Destroyed {
                self.shared.destroyed.store(true, Ordering::Release);
            }
            self.shared.state.send_replace(state);
        }
        // No receivers is fine.
        let _ = self.shared.events.send(event);
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if let Some(active) = self.shared.active().take() {
            active.socket.close();
        }
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
