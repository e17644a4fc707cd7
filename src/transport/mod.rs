//! Zaparoo Link - Transport Layer
//!
//! This module owns the single persistent connection to a Zaparoo Core
//! device. It provides:
//!
//! - **Frame encoding/decoding**: [`encode_request`], [`decode_frame`] and the
//!   [`Heartbeat`] sentinels
//! - **Connection state machine**: [`ConnectionMachine`], sans-IO, with
//!   heartbeat, connection timeout and reconnect bookkeeping
//! - **Backoff**: [`reconnect_delay`] as a pure function
//! - **Driver**: [`Transport`], a tokio task running the machine over a
//!   [`Connector`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Router / Status                  │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   frames, heartbeat, backoff, driver    │
//! ├─────────────────────────────────────────┤
//! │         WebSocket (Connector)           │
//! └─────────────────────────────────────────┘
//! ```

pub mod backoff;
mod config;
mod connection;
mod driver;
mod frame;
#[cfg(test)]
pub(crate) mod mock;
mod socket;

pub use backoff::{BackoffPolicy, reconnect_delay};
pub use config::TransportConfig;
pub use connection::{Action, ConnectionMachine, TransportEvent, TransportState};
pub use driver::Transport;
pub use frame::*;
pub use socket::*;
