//! Zaparoo Link - Application Connection Status
//!
//! Translates raw transport state into the categories a UI shows, debounces
//! short drops with a grace period, and folds unsolicited server events
//! (scanned tokens, playback, indexing progress, readers) into one
//! [`AppStatus`] held by a [`StatusStore`].

mod connection;
mod events;
mod store;

pub use connection::{ConnectionStatus, GracePeriod, LinkState};
pub use events::{IndexingStatus, PlayingMedia, ReaderInfo, ServerEvent, TokenInfo};
pub use store::{AppStatus, StatusStore};
