//! # Zaparoo Link
//!
//! Connection layer between a companion app and a Zaparoo Core device.
//!
//! Zaparoo Core speaks JSON-RPC over a WebSocket on the local network.
//! Phones sleep, switch WiFi networks and move out of range, so the link
//! treats the connection as something to keep alive rather than something
//! that simply exists:
//!
//! - **Liveness**: plain-text `ping`/`pong` heartbeat; any inbound traffic
//!   counts as proof the peer is alive
//! - **Recovery**: reconnect with capped exponential backoff, plus an
//!   immediate retry when the app knows the network came back
//! - **Calls**: request ids, timeouts, cancellation, and a queue that replays
//!   calls made while disconnected in their original order
//! - **Status**: a debounced, UI-facing connection state so short blips
//!   never flicker
//!
//! ## Feature Flags
//!
//! - `websocket` (default): [`WsConnector`](transport::WsConnector) over
//!   tokio-tungstenite
//! - `status` (default): [`status`] container and the
//!   [`DeviceLink`](client::DeviceLink) facade
//!
//! ## Modules
//!
//! - [`core`]: Constants, errors and device addresses (always included)
//! - [`transport`]: Codec, connection state machine and tokio driver
//! - [`client`]: Request router and device link
//! - [`status`]: Application connection status (requires `status` feature)
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use zaparoo_link::prelude::*;
//!
//! # async fn run() -> Result<(), LinkError> {
//! let link = DeviceLink::websocket(LinkConfig::default(), Arc::new(MemoryAddressStore::new()))?;
//! link.connect_to("192.168.1.20")?;
//!
//! // Queued until the socket opens, then sent.
//! let outcome = link.call("version", None, None).await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Transport layer
pub mod transport;

// Request routing and device link
pub mod client;

// Application connection status (feature-gated)
#[cfg(feature = "status")]
#[cfg_attr(docsrs, doc(cfg(feature = "status")))]
pub mod status;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    pub use crate::transport::{
        Connector, Socket, Transport, TransportConfig, TransportEvent, TransportState,
    };

    #[cfg(feature = "websocket")]
    pub use crate::transport::WsConnector;

    pub use crate::client::{CallOutcome, FrameSink, Router, RouterConfig, TrackedCall, WriteRequest};

    #[cfg(feature = "status")]
    pub use crate::client::{DeviceLink, LinkConfig};

    #[cfg(feature = "status")]
    pub use crate::status::{AppStatus, ConnectionStatus, LinkState, ServerEvent, StatusStore};
}

// Re-export commonly used items at crate root
pub use self::core::{CallError, LinkError, Target, TransportError};

pub use client::{CallOutcome, Router};
pub use transport::{Transport, TransportConfig, TransportState};

#[cfg(feature = "status")]
pub use client::DeviceLink;
