//! Scriptable connector for driver tests.

use std::sync::{Arc, Mutex};

use super::socket::{Connector, Socket, SocketEvent, SocketEventSink};
use crate::core::TransportError;

#[derive(Debug, Default)]
struct MockSocketState {
    open: bool,
    closed: bool,
    sent: Vec<String>,
}

/// Test side handle to one created socket.
#[derive(Debug, Clone)]
pub(crate) struct MockSocket {
    url: String,
    events: SocketEventSink,
    state: Arc<Mutex<MockSocketState>>,
}

impl MockSocket {
    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    /// Simulate a finished handshake.
    pub(crate) fn accept(&self) {
        self.state.lock().unwrap().open = true;
        self.events.emit(SocketEvent::Open);
    }

    /// Simulate an inbound text frame.
    pub(crate) fn receive(&self, text: &str) {
        self.events.emit(SocketEvent::Message(text.to_string()));
    }

    /// Simulate an inbound protocol level ping.
    pub(crate) fn control_frame(&self) {
        self.events.emit(SocketEvent::Activity);
    }

    /// Simulate the peer going away.
    pub(crate) fn drop_connection(&self) {
        self.state.lock().unwrap().open = false;
        self.events.emit(SocketEvent::Error("connection reset".into()));
        self.events.emit(SocketEvent::Close);
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl Socket for MockSocket {
    fn send(&self, text: String) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.open || state.closed {
            return Err(TransportError::NotOpen);
        }
        state.sent.push(text);
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.open = false;
        state.closed = true;
    }
}

/// Connector that records every socket it creates.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockConnector {
    sockets: Arc<Mutex<Vec<MockSocket>>>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn created(&self) -> usize {
        self.sockets.lock().unwrap().len()
    }

    pub(crate) fn socket(&self, index: usize) -> MockSocket {
        self.sockets.lock().unwrap()[index].clone()
    }

    pub(crate) fn last(&self) -> MockSocket {
        self.sockets
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no socket created")
    }
}

impl Connector for MockConnector {
    fn open(&self, url: &str, events: SocketEventSink) -> Arc<dyn Socket> {
        let socket = MockSocket {
            url: url.to_string(),
            events,
            state: Arc::new(Mutex::new(MockSocketState::default())),
        };
        self.sockets.lock().unwrap().push(socket.clone());
        Arc::new(socket)
    }
}
