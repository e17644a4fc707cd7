//! Socket seam between the transport driver and the network.
//!
//! A [`Connector`] creates sockets the way a browser creates a `WebSocket`:
//! `open` returns immediately and progress is reported later through the
//! [`SocketEventSink`]. Every sink is stamped with the generation of the
//! socket it belongs to.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::core::TransportError;

/// Something that happened on a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Handshake finished, frames may flow.
    Open,
    /// Inbound text frame.
    Message(String),
    /// Inbound control frame. Proves liveness, carries nothing.
    Activity,
    /// Socket level error. A `Close` follows.
    Error(String),
    /// Socket is gone.
    Close,
}

/// Reports events for one socket generation back to the driver.
#[derive(Debug, Clone)]
pub struct SocketEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, SocketEvent)>,
}

impl SocketEventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, SocketEvent)>) -> Self {
        Self { generation, tx }
    }

    /// Generation this sink reports for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event. Silently dropped once the driver is gone.
    pub fn emit(&self, event: SocketEvent) {
        let _ = self.tx.send((self.generation, event));
    }
}

/// An open or opening connection.
pub trait Socket: Send + Sync {
    /// Queue a text frame. Fails if the socket is not open.
    fn send(&self, text: String) -> Result<(), TransportError>;

    /// Start closing. Must be safe to call more than once.
    fn close(&self);
}

/// Factory for sockets.
pub trait Connector: Send + Sync + 'static {
    /// Begin opening a socket to `url`.
    fn open(&self, url: &str, events: SocketEventSink) -> Arc<dyn Socket>;
}

#[cfg(feature = "websocket")]
pub use self::ws::{WsConnector, WsSocket};

#[cfg(feature = "websocket")]
mod ws {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio::sync::mpsc;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, trace};

    use super::{Connector, Socket, SocketEvent, SocketEventSink};
    use crate::core::TransportError;

    /// Upper bound for the closing handshake before the socket is dropped.
    const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

    /// Connector over tokio-tungstenite.
    #[derive(Debug, Clone, Default)]
    pub struct WsConnector;

    impl WsConnector {
        /// Create a connector.
        pub fn new() -> Self {
            Self
        }
    }

    /// Socket handle backed by a pump task.
    #[derive(Debug)]
    pub struct WsSocket {
        outbound: mpsc::UnboundedSender<Message>,
        open: Arc<AtomicBool>,
        shutdown: CancellationToken,
    }

    impl Socket for WsSocket {
        fn send(&self, text: String) -> Result<(), TransportError> {
            if !self.open.load(Ordering::Acquire) {
                return Err(TransportError::NotOpen);
            }
            self.outbound
                .send(Message::Text(text.into()))
                .map_err(|_| TransportError::NotOpen)
        }

        fn close(&self) {
            self.open.store(false, Ordering::Release);
            self.shutdown.cancel();
        }
    }

    impl Connector for WsConnector {
        fn open(&self, url: &str, events: SocketEventSink) -> Arc<dyn Socket> {
            let (outbound, outbound_rx) = mpsc::unbounded_channel();
            let open = Arc::new(AtomicBool::new(false));
            let shutdown = CancellationToken::new();

            tokio::spawn(pump(
                url.to_string(),
                events,
                outbound_rx,
                Arc::clone(&open),
                shutdown.clone(),
            ));

            Arc::new(WsSocket {
                outbound,
                open,
                shutdown,
            })
        }
    }

    async fn pump(
        url: String,
        events: SocketEventSink,
        mut outbound: mpsc::UnboundedReceiver<Message>,
        open: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) {
        let generation = events.generation();
        debug!(generation, url = %url, "opening websocket");

        let connected = tokio::select! {
            _ = shutdown.cancelled() => {
                events.emit(SocketEvent::Close);
                return;
            }
            result = connect_async(url.as_str()) => result,
        };

        let (ws, _response) = match connected {
            Ok(pair) => pair,
            Err(e) => {
                events.emit(SocketEvent::Error(e.to_string()));
                events.emit(SocketEvent::Close);
                return;
            }
        };

        open.store(true, Ordering::Release);
        events.emit(SocketEvent::Open);

        let (mut sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, sink.send(Message::Close(None))).await;
                    break;
                }
                Some(message) = outbound.recv() => {
                    if let Err(e) = sink.send(message).await {
                        events.emit(SocketEvent::Error(e.to_string()));
                        break;
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => events.emit(SocketEvent::Message(text.as_str().to_owned())),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => events.emit(SocketEvent::Message(text)),
                        Err(_) => trace!(generation, "dropping non-utf8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!(generation, ?frame, "peer closed websocket");
                        break;
                    }
                    // Protocol level ping/pong is answered by tungstenite.
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => events.emit(SocketEvent::Activity),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        events.emit(SocketEvent::Error(e.to_string()));
                        break;
                    }
                    None => break,
                },
            }
        }

        open.store(false, Ordering::Release);
        events.emit(SocketEvent::Close);
    }
}
