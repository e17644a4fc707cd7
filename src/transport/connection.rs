//! Connection state machine.
//!
//! [`ConnectionMachine`] owns every decision the transport makes: when to
//! open a socket, when to ping, when a silent peer is declared dead, and when
//! to retry. It performs no I/O. Callers feed it socket events and the
//! current time, read [`ConnectionMachine::next_deadline`] to know when to
//! call [`ConnectionMachine::poll`] again, and execute the [`Action`]s it
//! queues.
//!
//! Every socket gets a fresh generation number. Events and actions carry the
//! generation they belong to, so a late event from a superseded socket can
//! never act on its replacement.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::config::TransportConfig;
use super::frame::Heartbeat;

/// Transport lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    /// Created, `connect` not called yet.
    Idle,
    /// Opening a socket, never connected before.
    Connecting,
    /// Socket open.
    Connected,
    /// Lost a previously working connection, recovering.
    Reconnecting,
    /// Gave up, or disconnected on request. Needs an explicit `connect`.
    Disconnected,
    /// Torn down permanently.
    Destroyed,
}

/// Lifecycle notifications fanned out to transport observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A socket finished opening.
    Opened,
    /// The current socket is gone.
    Closed,
    /// The socket reported an error. A close follows.
    Error(String),
    /// The reconnect budget ran out. `Disconnected` follows.
    ReconnectExhausted {
        /// Attempts made since the last successful open.
        attempts: u32,
    },
    /// Application frame (heartbeat tokens are never forwarded).
    Message(String),
    /// The transport state changed.
    StateChanged(TransportState),
}

/// Work the driver must perform on behalf of the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Create a new socket for this generation.
    Open {
        /// Socket generation.
        generation: u64,
    },
    /// Close the socket of this generation.
    Close {
        /// Socket generation.
        generation: u64,
    },
    /// Send a heartbeat token on the socket of this generation.
    Heartbeat {
        /// Socket generation.
        generation: u64,
        /// Token to send.
        token: Heartbeat,
    },
    /// Deliver an event to observers.
    Emit(TransportEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketPhase {
    Absent,
    Opening,
    Open,
}

/// Sans-IO connection state machine.
#[derive(Debug)]
pub struct ConnectionMachine {
    config: TransportConfig,
    backoff: BackoffPolicy,
    state: TransportState,
    has_ever_connected: bool,
    generation: u64,
    socket: SocketPhase,
    reconnect_attempts: u32,
    heartbeat_paused: bool,

    connect_deadline: Option<Instant>,
    ping_at: Option<Instant>,
    pong_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,

    actions: VecDeque<Action>,
}

impl ConnectionMachine {
    /// Create an idle machine. The configuration is expected to be validated.
    pub fn new(config: TransportConfig) -> Self {
        let backoff = config.backoff();
        Self {
            config,
            backoff,
            state: TransportState::Idle,
            has_ever_connected: false,
            generation: 0,
            socket: SocketPhase::Absent,
            reconnect_attempts: 0,
            heartbeat_paused: false,
            connect_deadline: None,
            ping_at: None,
            pong_deadline: None,
            reconnect_at: None,
            actions: VecDeque::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Whether the transport has reached `Connected` at least once.
    pub fn has_ever_connected(&self) -> bool {
        self.has_ever_connected
    }

    /// Generation of the most recent socket.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the current socket is open.
    pub fn is_open(&self) -> bool {
        self.socket == SocketPhase::Open
    }

    /// Number of reconnects scheduled since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Whether the heartbeat is suspended.
    pub fn heartbeat_paused(&self) -> bool {
        self.heartbeat_paused
    }

    /// Whether `destroy` was called.
    pub fn is_destroyed(&self) -> bool {
        self.state == TransportState::Destroyed
    }

    /// Next queued action.
    pub fn poll_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    /// Earliest instant at which [`poll`](Self::poll) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.connect_deadline,
            self.pong_deadline,
            self.ping_at,
            self.reconnect_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Open a socket unless one is already opening or open.
    ///
    /// After the reconnect budget was exhausted this restores it.
    pub fn connect(&mut self, now: Instant) {
        if self.is_destroyed() {
            debug!("connect ignored, transport destroyed");
            return;
        }
        if self.socket != SocketPhase::Absent {
            debug!(state = ?self.state, "connect ignored, socket already active");
            return;
        }
        if self.state == TransportState::Disconnected {
            self.reconnect_attempts = 0;
        }
        self.reconnect_at = None;
        self.open_socket(now);
    }

    /// The socket of `generation` finished opening.
    pub fn on_open(&mut self, generation: u64, now: Instant) {
        if !self.is_current(generation) || self.socket != SocketPhase::Opening {
            return;
        }
        self.socket = SocketPhase::Open;
        self.connect_deadline = None;
        self.reconnect_attempts = 0;
        self.has_ever_connected = true;
        info!(generation, "connection open");
        self.set_state(TransportState::Connected);
        self.emit(TransportEvent::Opened);
        self.start_heartbeat(now);
    }

    /// Text arrived on the socket of `generation`.
    ///
    /// Any inbound traffic proves liveness. Heartbeat tokens are consumed
    /// here; everything else is forwarded as [`TransportEvent::Message`].
    pub fn on_message(&mut self, generation: u64, text: String) {
        if !self.is_current(generation) || self.socket != SocketPhase::Open {
            return;
        }
        self.pong_deadline = None;
        match Heartbeat::parse(&text) {
            Some(Heartbeat::Pong) => {}
            Some(Heartbeat::Ping) => self.actions.push_back(Action::Heartbeat {
                generation,
                token: Heartbeat::Pong,
            }),
            None => self.emit(TransportEvent::Message(text)),
        }
    }

    /// A control frame arrived on the socket of `generation`.
    pub fn on_activity(&mut self, generation: u64) {
        if self.is_current(generation) && self.socket == SocketPhase::Open {
            self.pong_deadline = None;
        }
    }

    /// The socket of `generation` reported an error.
    ///
    /// Errors are forwarded only. The close that follows drives recovery.
    pub fn on_error(&mut self, generation: u64, message: String) {
        if !self.is_current(generation) {
            return;
        }
        warn!(generation, error = %message, "socket error");
        self.emit(TransportEvent::Error(message));
    }

    /// The socket of `generation` closed.
    pub fn on_close(&mut self, generation: u64, now: Instant) {
        if !self.is_current(generation) {
            return;
        }
        self.socket_lost(now);
    }

    /// Fire every timer that is due at `now`.
    pub fn poll(&mut self, now: Instant) {
        if self.is_destroyed() {
            return;
        }

        if self.connect_deadline.is_some_and(|d| d <= now) {
            self.connect_deadline = None;
            if self.socket == SocketPhase::Opening {
                self.force_close(now, "connection timeout");
            }
        }

        if self.pong_deadline.is_some_and(|d| d <= now) {
            self.pong_deadline = None;
            if self.socket == SocketPhase::Open {
                self.force_close(now, "heartbeat timeout");
            }
        }

        if self.ping_at.is_some_and(|d| d <= now) {
            self.ping_at = None;
            if self.socket == SocketPhase::Open && !self.heartbeat_paused {
                self.send_ping(now);
            }
        }

        if self.reconnect_at.is_some_and(|d| d <= now) {
            self.reconnect_at = None;
            if self.socket == SocketPhase::Absent {
                debug!(attempt = self.reconnect_attempts, "reconnecting");
                self.open_socket(now);
            }
        }
    }

    /// Suspend liveness checks without touching the socket.
    pub fn pause_heartbeat(&mut self) {
        if self.is_destroyed() {
            return;
        }
        debug!("heartbeat paused");
        self.heartbeat_paused = true;
        self.ping_at = None;
        self.pong_deadline = None;
    }

    /// Resume liveness checks, pinging right away if connected.
    pub fn resume_heartbeat(&mut self, now: Instant) {
        if self.is_destroyed() {
            return;
        }
        debug!("heartbeat resumed");
        self.heartbeat_paused = false;
        if self.socket == SocketPhase::Open {
            self.send_ping(now);
        }
    }

    /// Retry soon, skipping the backoff delay.
    ///
    /// A connected transport keeps its socket and only resumes the
    /// heartbeat, which flushes out a stale connection quickly.
    pub fn immediate_reconnect(&mut self, now: Instant) {
        if self.is_destroyed() {
            return;
        }
        if self.socket == SocketPhase::Open {
            self.resume_heartbeat(now);
            return;
        }
        self.reconnect_attempts = 0;
        self.reconnect_at = Some(now + self.config.immediate_reconnect_delay);
        info!(
            delay_ms = self.config.immediate_reconnect_delay.as_millis() as u64,
            "immediate reconnect scheduled"
        );
    }

    /// Close the socket and stop retrying until `connect` is called.
    pub fn disconnect(&mut self) {
        if self.is_destroyed() {
            return;
        }
        self.reconnect_at = None;
        self.drop_socket();
        self.set_state(TransportState::Disconnected);
    }

    /// Tear down permanently.
    pub fn destroy(&mut self) {
        if self.is_destroyed() {
            return;
        }
        self.reconnect_at = None;
        self.drop_socket();
        self.set_state(TransportState::Destroyed);
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && !self.is_destroyed()
    }

    fn open_socket(&mut self, now: Instant) {
        self.generation += 1;
        self.socket = SocketPhase::Opening;
        self.connect_deadline = Some(now + self.config.connection_timeout);
        self.actions.push_back(Action::Open {
            generation: self.generation,
        });
        self.set_state(if self.has_ever_connected {
            TransportState::Reconnecting
        } else {
            TransportState::Connecting
        });
    }

    fn start_heartbeat(&mut self, now: Instant) {
        self.pong_deadline = None;
        self.ping_at = if self.heartbeat_paused {
            None
        } else {
            Some(now + self.config.ping_interval)
        };
    }

    fn send_ping(&mut self, now: Instant) {
        self.actions.push_back(Action::Heartbeat {
            generation: self.generation,
            token: Heartbeat::Ping,
        });
        self.pong_deadline = Some(now + self.config.pong_timeout);
        self.ping_at = Some(now + self.config.ping_interval);
    }

    fn clear_socket_timers(&mut self) {
        self.connect_deadline = None;
        self.ping_at = None;
        self.pong_deadline = None;
    }

    fn drop_socket(&mut self) {
        self.clear_socket_timers();
        if self.socket != SocketPhase::Absent {
            self.socket = SocketPhase::Absent;
            self.actions.push_back(Action::Close {
                generation: self.generation,
            });
            self.emit(TransportEvent::Closed);
        }
    }

    fn force_close(&mut self, now: Instant, reason: &'static str) {
        warn!(generation = self.generation, reason, "closing connection");
        self.actions.push_back(Action::Close {
            generation: self.generation,
        });
        self.socket_lost(now);
    }

    // Idempotent per disconnection episode: the first of close, forced
    // close or timeout wins, later reports find the socket already absent.
    fn socket_lost(&mut self, now: Instant) {
        if self.socket == SocketPhase::Absent {
            return;
        }
        self.socket = SocketPhase::Absent;
        self.clear_socket_timers();
        self.emit(TransportEvent::Closed);
        self.schedule_reconnect(now);
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        if self.reconnect_at.is_some() {
            return;
        }
        if let Some(max) = self.config.max_reconnect_attempts {
            if self.reconnect_attempts >= max {
                warn!(attempts = self.reconnect_attempts, "reconnect attempts exhausted");
                self.emit(TransportEvent::ReconnectExhausted {
                    attempts: self.reconnect_attempts,
                });
                self.set_state(TransportState::Disconnected);
                return;
            }
        }

        let delay = self.backoff.delay(self.reconnect_attempts);
        self.reconnect_attempts += 1;
        self.reconnect_at = Some(now + delay);
        info!(
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );

        if self.has_ever_connected {
            self.set_state(TransportState::Reconnecting);
        }
    }

    fn set_state(&mut self, state: TransportState) {
        if self.state == state {
            return;
        }
        debug!(from = ?self.state, to = ?state, "transport state");
        self.state = state;
        self.emit(TransportEvent::StateChanged(state));
    }

    fn emit(&mut self, event: TransportEvent) {
        self.actions.push_back(Action::Emit(event));
    }
}
