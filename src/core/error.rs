//! Error types for the Zaparoo link.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the connection transport.
///
/// Connection loss is never reported through this type; it shows up as a
/// state transition. Only direct sends can fail synchronously.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No socket is open right now.
    #[error("connection not open")]
    NotOpen,

    /// The transport was destroyed and accepts no more work.
    #[error("transport destroyed")]
    Destroyed,

    /// The socket refused the frame.
    #[error("send failed: {0}")]
    Send(String),
}

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Inbound text was not valid JSON.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Valid JSON that is not a recognizable envelope.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(&'static str),

    /// Outbound params could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Errors a single call can fail with.
///
/// Cancellation is not an error; it resolves with
/// [`CallOutcome::Cancelled`](crate::client::CallOutcome::Cancelled).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CallError {
    /// The call outlived its deadline.
    #[error("request {method} timed out after {after:?}")]
    Timeout {
        /// Method of the timed out call.
        method: String,
        /// Configured request timeout.
        after: Duration,
    },

    /// The device answered with a JSON-RPC error.
    #[error("remote error {code}: {message}")]
    Remote {
        /// JSON-RPC error code.
        code: i64,
        /// Server supplied message.
        message: String,
    },

    /// The frame could not be handed to the transport.
    #[error("send failed: {0}")]
    Send(#[from] TransportError),

    /// A queued frame failed to send while the queue was flushed.
    #[error("queued request could not be sent on reconnect: {0}")]
    FlushFailed(String),

    /// The router was reset while the call was in flight.
    #[error("router reset")]
    Reset,

    /// The request could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Invalid configuration values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A duration that must be positive was zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// The pong timeout does not fit inside the ping interval.
    #[error("pong timeout must be shorter than the ping interval")]
    PongTimeoutTooLong,

    /// The backoff multiplier is below one or not finite.
    #[error("reconnect backoff multiplier must be a finite value >= 1.0")]
    InvalidMultiplier,

    /// The reconnect cap is below the base reconnect interval.
    #[error("max reconnect interval must be >= the reconnect interval")]
    InvalidReconnectCap,
}

/// Errors parsing a device address.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// Nothing to connect to.
    #[error("device address is empty")]
    Empty,

    /// The port part is not a valid port number.
    #[error("invalid port in {0:?}")]
    InvalidPort(String),

    /// URL scheme other than ws/wss.
    #[error("unsupported scheme in {0:?}")]
    UnsupportedScheme(String),
}

/// Errors from address persistence backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Top-level link errors.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Address error.
    #[error("address error: {0}")]
    Address(#[from] AddressError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Call error.
    #[error("call error: {0}")]
    Call(#[from] CallError),

    /// No device has been selected yet.
    #[error("no device address configured")]
    NoDevice,
}
