//! Link constants and configuration defaults.
//!
//! Protocol tokens are fixed by Zaparoo Core. Timing values are only
//! defaults; every one of them can be overridden through configuration.

use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// JSON-RPC version tag carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Heartbeat token sent by the client.
pub const PING: &str = "ping";

/// Heartbeat token expected in reply.
pub const PONG: &str = "pong";

/// Method used for hardware tag writes.
pub const METHOD_WRITE: &str = "readers.write";

/// Method used to abort an in-flight tag write on the device.
pub const METHOD_WRITE_CANCEL: &str = "readers.write.cancel";

// =============================================================================
// DEVICE ADDRESS
// =============================================================================

/// Zaparoo Core API port.
pub const DEFAULT_PORT: u16 = 7497;

/// Zaparoo Core API path.
pub const DEFAULT_API_PATH: &str = "/api/v0.1";

// =============================================================================
// TIMING - TRANSPORT
// =============================================================================

/// Interval between heartbeat pings while connected.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

/// How long to wait for any inbound traffic after a ping.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a socket may stay half-open before it is abandoned.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Base reconnect delay.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Multiplier applied to the reconnect delay per failed attempt.
pub const DEFAULT_RECONNECT_BACKOFF_MULTIPLIER: f64 = 1.5;

/// Upper bound for the reconnect delay.
pub const DEFAULT_MAX_RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

/// Fixed delay used by `immediate_reconnect`.
pub const DEFAULT_IMMEDIATE_RECONNECT_DELAY: Duration = Duration::from_millis(100);

// =============================================================================
// TIMING - ROUTER AND STATUS
// =============================================================================

/// Deadline for a single request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Window during which a dropped connection is still reported as connected.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

// =============================================================================
// CHANNELS
// =============================================================================

/// Capacity of the transport event fan-out.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the router notification fan-out.
pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 128;
