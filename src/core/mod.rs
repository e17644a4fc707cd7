//! Zaparoo Link - Core types, constants and errors.
//!
//! This module has no I/O of its own. It defines the configuration defaults,
//! the error taxonomy shared by every layer, and the device address model.

mod address;
mod constants;
mod error;

pub use address::*;
pub use constants::*;
pub use error::*;
