//! User-facing connection status and the grace-period debouncer.
//!
//! [`GracePeriod`] is sans-IO like the transport's connection machine: it is
//! fed state changes and the current time, and reports when it next needs
//! to be polled.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

/// Connection category shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Connected to the device.
    Connected,
    /// First connection attempt in progress.
    Connecting,
    /// Recovering a lost connection.
    Reconnecting,
    /// Not connected and not trying.
    Disconnected,
    /// Gave up after an error.
    Error,
}

impl LinkState {
    fn is_drop(self) -> bool {
        matches!(self, Self::Reconnecting | Self::Disconnected)
    }
}

/// Snapshot of the connection as the UI should render it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// Whether to present the device as connected.
    pub connected: bool,
    /// Committed state.
    pub state: LinkState,
    /// Last error message, set with [`LinkState::Error`].
    pub error: Option<String>,
    /// A drop was observed and the grace window is running.
    pub pending_disconnection: bool,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            connected: false,
            state: LinkState::Disconnected,
            error: None,
            pending_disconnection: false,
        }
    }
}

#[derive(Debug)]
struct PendingDrop {
    state: LinkState,
    error: Option<String>,
}

/// Defers showing a dropped connection for a fixed window.
///
/// `Connected`, `Error` and `Connecting` commit immediately and cancel any
/// running window. `Reconnecting` and `Disconnected` received while the
/// committed state is `Connected` start (or restart) the window instead;
/// the drop only commits once [`poll`](Self::poll) runs past the deadline.
#[derive(Debug)]
pub struct GracePeriod {
    window: Duration,
    status: ConnectionStatus,
    pending: Option<PendingDrop>,
    deadline: Option<Instant>,
}

impl GracePeriod {
    /// Create a debouncer with the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            status: ConnectionStatus::default(),
            pending: None,
            deadline: None,
        }
    }

    /// Current visible status.
    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// When the running window expires, if one is running.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Feed a new state.
    pub fn apply(&mut self, state: LinkState, error: Option<String>, now: Instant) {
        if state.is_drop() && self.status.state == LinkState::Connected {
            debug!(?state, window_ms = self.window.as_millis() as u64, "grace period started");
            self.pending = Some(PendingDrop { state, error });
            self.deadline = Some(now + self.window);
            self.status.pending_disconnection = true;
            return;
        }
        if self.deadline.is_some() && state == LinkState::Connected {
            debug!("connection recovered within grace period");
        }
        self.commit(state, error);
    }

    /// Commit a deferred drop once the window has passed.
    ///
    /// Returns whether the visible status changed.
    pub fn poll(&mut self, now: Instant) -> bool {
        if !self.deadline.is_some_and(|d| d <= now) {
            return false;
        }
        match self.pending.take() {
            Some(PendingDrop { state, error }) => {
                debug!(?state, "grace period expired");
                self.commit(state, error);
                true
            }
            None => {
                self.deadline = None;
                false
            }
        }
    }

    /// Drop any running window and show `Disconnected` right away.
    pub fn reset(&mut self) {
        self.commit(LinkState::Disconnected, None);
    }

    fn commit(&mut self, state: LinkState, error: Option<String>) {
        self.pending = None;
        self.deadline = None;
        self.status = ConnectionStatus {
            connected: state == LinkState::Connected,
            state,
            error,
            pending_disconnection: false,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(2000);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn connected(t0: Instant) -> GracePeriod {
        let mut grace = GracePeriod::new(WINDOW);
        grace.apply(LinkState::Connecting, None, t0);
        grace.apply(LinkState::Connected, None, t0);
        grace
    }

    #[test]
    fn test_blip_inside_window_never_shows() {
        let t0 = Instant::now();
        let mut grace = connected(t0);

        grace.apply(LinkState::Reconnecting, None, t0);
        assert!(grace.status().connected);
        assert!(grace.status().pending_disconnection);
        assert_eq!(grace.status().state, LinkState::Connected);

        for step in (100..2000).step_by(100) {
            assert!(!grace.poll(t0 + ms(step)));
            assert!(grace.status().connected);
        }

        grace.apply(LinkState::Connected, None, t0 + ms(1500));
        assert!(!grace.poll(t0 + ms(10_000)));
        assert!(grace.status().connected);
        assert!(!grace.status().pending_disconnection);
        assert_eq!(grace.deadline(), None);
    }

    #[test]
    fn test_drop_commits_after_window() {
        let t0 = Instant::now();
        let mut grace = connected(t0);

        grace.apply(LinkState::Reconnecting, None, t0);
        assert!(!grace.poll(t0 + ms(1999)));
        assert!(grace.poll(t0 + ms(2000)));
        assert_eq!(
            grace.status(),
            &ConnectionStatus {
                connected: false,
                state: LinkState::Reconnecting,
                error: None,
                pending_disconnection: false,
            }
        );
    }

    #[test]
    fn test_second_drop_restarts_window() {
        let t0 = Instant::now();
        let mut grace = connected(t0);

        grace.apply(LinkState::Reconnecting, None, t0);
        grace.apply(LinkState::Disconnected, None, t0 + ms(1500));
        assert_eq!(grace.deadline(), Some(t0 + ms(3500)));
        assert!(!grace.poll(t0 + ms(2000)));
        assert!(grace.poll(t0 + ms(3500)));
        assert_eq!(grace.status().state, LinkState::Disconnected);
    }

    #[test]
    fn test_reset_skips_window() {
        let t0 = Instant::now();
        let mut grace = connected(t0);
        grace.apply(LinkState::Reconnecting, None, t0);
        grace.reset();
        assert_eq!(grace.status(), &ConnectionStatus::default());
        assert_eq!(grace.deadline(), None);
        assert!(!grace.poll(t0 + ms(10_000)));
    }

    #[test]
    fn test_drop_without_prior_connection_is_immediate() {
        let t0 = Instant::now();
        let mut grace = GracePeriod::new(WINDOW);
        grace.apply(LinkState::Connecting, None, t0);
        grace.apply(LinkState::Disconnected, None, t0);
        assert_eq!(grace.status().state, LinkState::Disconnected);
        assert_eq!(grace.deadline(), None);
    }

    #[test]
    fn test_error_and_connecting_cancel_window() {
        let t0 = Instant::now();
        let mut grace = connected(t0);
        grace.apply(LinkState::Reconnecting, None, t0);
        grace.apply(LinkState::Error, Some("connection refused".into()), t0 + ms(10));
        assert_eq!(grace.deadline(), None);
        assert!(!grace.status().connected);
        assert_eq!(grace.status().error.as_deref(), Some("connection refused"));

        let mut grace = connected(t0);
        grace.apply(LinkState::Disconnected, None, t0);
        grace.apply(LinkState::Connecting, None, t0 + ms(10));
        assert_eq!(grace.deadline(), None);
        assert_eq!(grace.status().state, LinkState::Connecting);
        assert!(!grace.status().connected);
    }
}
