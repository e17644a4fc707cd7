//! Zaparoo Link - Client Library
//!
//! Request routing over a transport, and the [`DeviceLink`] facade tying
//! transport, router and status together.

#[cfg(feature = "status")]
mod link;
mod router;

#[cfg(feature = "status")]
pub use link::{DeviceLink, LinkConfig};
pub use router::{CallOutcome, FrameSink, Router, RouterConfig, TrackedCall, WriteRequest};
