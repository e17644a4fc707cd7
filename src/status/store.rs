//! Application status container.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::connection::{ConnectionStatus, GracePeriod, LinkState};
use super::events::{IndexingStatus, PlayingMedia, ReaderInfo, ServerEvent, TokenInfo};
use crate::client::Router;
use crate::transport::{Transport, TransportEvent, TransportState};

/// Everything the UI renders about the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    /// Connection status.
    pub connection: ConnectionStatus,
    /// Token currently on a reader.
    pub active_token: Option<TokenInfo>,
    /// Most recently scanned token, kept after removal.
    pub last_token: Option<TokenInfo>,
    /// Media currently playing.
    pub playing: Option<PlayingMedia>,
    /// Media database indexing progress.
    pub indexing: IndexingStatus,
    /// Attached readers.
    pub readers: Vec<ReaderInfo>,
}

impl AppStatus {
    /// Fold one server event into the status.
    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::TokenAdded(token) => {
                self.active_token = Some(token.clone());
                self.last_token = Some(token.clone());
            }
            ServerEvent::TokenRemoved => self.active_token = None,
            ServerEvent::MediaStarted(media) => self.playing = Some(media.clone()),
            ServerEvent::MediaStopped => self.playing = None,
            ServerEvent::Indexing(indexing) => self.indexing = indexing.clone(),
            ServerEvent::ReaderAdded(reader) => {
                self.readers.retain(|r| r.path != reader.path);
                self.readers.push(reader.clone());
            }
            ServerEvent::ReaderRemoved(reader) => self.readers.retain(|r| r.path != reader.path),
            ServerEvent::Unknown(method) => debug!(method = %method, "ignoring notification"),
        }
    }
}

struct GraceSlot {
    machine: GracePeriod,
    timer: Option<JoinHandle<()>>,
}

struct StoreInner {
    status: watch::Sender<AppStatus>,
    grace: Mutex<GraceSlot>,
}

impl StoreInner {
    fn grace(&self) -> MutexGuard<'_, GraceSlot> {
        self.grace.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, connection: &ConnectionStatus) {
        self.status.send_if_modified(|status| {
            if status.connection == *connection {
                return false;
            }
            status.connection = connection.clone();
            true
        });
    }

    fn expire_grace(&self) {
        let mut slot = self.grace();
        slot.timer = None;
        if slot.machine.poll(Instant::now().into_std()) {
            self.publish(slot.machine.status());
        }
    }
}

/// Explicit, shareable state container for [`AppStatus`].
///
/// Clones share the same state. Readers take a [`snapshot`](Self::snapshot)
/// or [`subscribe`](Self::subscribe) to changes.
#[derive(Clone)]
pub struct StatusStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for StatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusStore")
            .field("status", &*self.inner.status.borrow())
            .finish()
    }
}

impl StatusStore {
    /// Create a store using `grace_period` to debounce drops.
    pub fn new(grace_period: Duration) -> Self {
        let (status, _) = watch::channel(AppStatus::default());
        Self {
            inner: Arc::new(StoreInner {
                status,
                grace: Mutex::new(GraceSlot {
                    machine: GracePeriod::new(grace_period),
                    timer: None,
                }),
            }),
        }
    }

    /// Current status.
    pub fn snapshot(&self) -> AppStatus {
        self.inner.status.borrow().clone()
    }

    /// Current connection status.
    pub fn connection(&self) -> ConnectionStatus {
        self.inner.status.borrow().connection.clone()
    }

    /// Watch for changes.
    pub fn subscribe(&self) -> watch::Receiver<AppStatus> {
        self.inner.status.subscribe()
    }

    /// Record a connection state, debouncing drops from `Connected`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn set_connection_state_with_grace_period(&self, state: LinkState, error: Option<String>) {
        let mut slot = self.inner.grace();
        slot.machine.apply(state, error, Instant::now().into_std());

        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        if let Some(deadline) = slot.machine.deadline() {
            let store = Arc::downgrade(&self.inner);
            slot.timer = Some(tokio::spawn(expire_at(store, Instant::from_std(deadline))));
        }
        self.inner.publish(slot.machine.status());
    }

    /// Show `Disconnected` immediately, skipping the grace period.
    ///
    /// Used when the transport is torn down on purpose.
    pub fn reset_connection(&self) {
        let mut slot = self.inner.grace();
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        slot.machine.reset();
        self.inner.publish(slot.machine.status());
    }

    /// Fold a server event into the status.
    pub fn apply_event(&self, event: &ServerEvent) {
        self.inner.status.send_modify(|status| status.apply(event));
    }

    /// Follow `transport` and record its state.
    ///
    /// A transport that runs out of reconnect attempts is shown as
    /// [`LinkState::Error`] with the last socket error. The task ends when
    /// the transport is destroyed.
    pub fn track_transport(&self, transport: &Transport) -> JoinHandle<()> {
        let mut events = transport.subscribe();
        let store = self.clone();
        if let Some(state) = link_state(transport.state()) {
            store.set_connection_state_with_grace_period(state, None);
        }
        tokio::spawn(async move {
            let mut last_error = None;
            let mut exhausted = false;
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "status fell behind transport events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                match event {
                    TransportEvent::Error(message) => last_error = Some(message),
                    TransportEvent::Opened => last_error = None,
                    TransportEvent::ReconnectExhausted { .. } => exhausted = true,
                    TransportEvent::StateChanged(TransportState::Destroyed) => break,
                    TransportEvent::StateChanged(TransportState::Disconnected) => {
                        let error = last_error.take();
                        if std::mem::take(&mut exhausted) {
                            let error = error.unwrap_or_else(|| "reconnect attempts exhausted".to_string());
                            store.set_connection_state_with_grace_period(LinkState::Error, Some(error));
                        } else {
                            store.set_connection_state_with_grace_period(LinkState::Disconnected, None);
                        }
                    }
                    TransportEvent::StateChanged(state) => {
                        if let Some(state) = link_state(state) {
                            store.set_connection_state_with_grace_period(state, None);
                        }
                    }
                    _ => {}
                }
            }
        })
    }

    /// Follow unsolicited notifications from `router`.
    pub fn track_notifications(&self, router: &Router) -> JoinHandle<()> {
        let mut notifications = router.subscribe_notifications();
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(notification) => {
                        store.apply_event(&ServerEvent::from_notification(&notification));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "status fell behind notifications");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

fn link_state(state: TransportState) -> Option<LinkState> {
    match state {
        TransportState::Connecting => Some(LinkState::Connecting),
        TransportState::Connected => Some(LinkState::Connected),
        TransportState::Reconnecting => Some(LinkState::Reconnecting),
        TransportState::Disconnected => Some(LinkState::Disconnected),
        TransportState::Idle | TransportState::Destroyed => None,
    }
}

async fn expire_at(store: Weak<StoreInner>, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
    if let Some(store) = store.upgrade() {
        store.expire_grace();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Target;
    use crate::transport::TransportConfig;
    use crate::transport::mock::MockConnector;
    use serde_json::json;

    const GRACE: Duration = Duration::from_millis(2000);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_hides_short_drop() {
        let store = StatusStore::new(GRACE);
        let mut rx = store.subscribe();
        store.set_connection_state_with_grace_period(LinkState::Connected, None);
        let _ = rx.borrow_and_update();

        store.set_connection_state_with_grace_period(LinkState::Reconnecting, None);
        for _ in 0..15 {
            tokio::time::advance(ms(100)).await;
            assert!(store.connection().connected);
        }
        store.set_connection_state_with_grace_period(LinkState::Connected, None);

        tokio::time::advance(ms(5000)).await;
        settle().await;
        let connection = store.connection();
        assert!(connection.connected);
        assert!(!connection.pending_disconnection);
        assert!(rx.borrow_and_update().connection.connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_expiry_commits_drop() {
        let store = StatusStore::new(GRACE);
        store.set_connection_state_with_grace_period(LinkState::Connected, None);
        store.set_connection_state_with_grace_period(LinkState::Reconnecting, None);
        assert!(store.connection().pending_disconnection);

        tokio::time::advance(ms(1999)).await;
        settle().await;
        assert!(store.connection().connected);

        tokio::time::advance(ms(1)).await;
        settle().await;
        let connection = store.connection();
        assert!(!connection.connected);
        assert_eq!(connection.state, LinkState::Reconnecting);
        assert!(!connection.pending_disconnection);
    }

    #[tokio::test]
    async fn test_server_events_update_status() {
        let store = StatusStore::new(GRACE);
        let token = TokenInfo {
            uid: "04aa".into(),
            ..TokenInfo::default()
        };
        store.apply_event(&ServerEvent::TokenAdded(token.clone()));
        store.apply_event(&ServerEvent::MediaStarted(PlayingMedia {
            system_id: "SNES".into(),
            ..PlayingMedia::default()
        }));
        store.apply_event(&ServerEvent::TokenRemoved);

        let status = store.snapshot();
        assert_eq!(status.active_token, None);
        assert_eq!(status.last_token, Some(token));
        assert_eq!(status.playing.map(|m| m.system_id), Some("SNES".to_string()));

        let reader = ReaderInfo {
            driver: "pn532".into(),
            path: "/dev/ttyUSB0".into(),
            connected: true,
        };
        store.apply_event(&ServerEvent::ReaderAdded(reader.clone()));
        store.apply_event(&ServerEvent::ReaderAdded(reader.clone()));
        assert_eq!(store.snapshot().readers.len(), 1);
        store.apply_event(&ServerEvent::ReaderRemoved(reader));
        assert!(store.snapshot().readers.is_empty());
        store.apply_event(&ServerEvent::MediaStopped);
        assert_eq!(store.snapshot().playing, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracks_transport_through_blip() {
        let connector = MockConnector::new();
        let transport = Transport::spawn(
            Target::parse("10.0.0.2").unwrap(),
            TransportConfig::default(),
            Arc::new(connector.clone()),
        )
        .unwrap();
        let store = StatusStore::new(GRACE);
        let _tracker = store.track_transport(&transport);

        transport.connect();
        settle().await;
        assert_eq!(store.connection().state, LinkState::Connecting);
        connector.last().accept();
        settle().await;
        assert!(store.connection().connected);

        connector.last().drop_connection();
        settle().await;
        assert!(store.connection().connected);
        assert!(store.connection().pending_disconnection);

        // Reconnect at 1s lands inside the grace window.
        tokio::time::advance(ms(1000)).await;
        settle().await;
        connector.last().accept();
        settle().await;
        tokio::time::advance(ms(5000)).await;
        settle().await;
        let connection = store.connection();
        assert!(connection.connected);
        assert!(!connection.pending_disconnection);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gave_up_after_error_shows_error() {
        let connector = MockConnector::new();
        let transport = Transport::spawn(
            Target::parse("10.0.0.2").unwrap(),
            TransportConfig::default().with_max_reconnect_attempts(Some(0)),
            Arc::new(connector.clone()),
        )
        .unwrap();
        let store = StatusStore::new(GRACE);
        let _tracker = store.track_transport(&transport);

        transport.connect();
        settle().await;
        connector.last().accept();
        settle().await;
        connector.last().drop_connection();
        settle().await;

        let connection = store.connection();
        assert!(!connection.connected);
        assert_eq!(connection.state, LinkState::Error);
        assert_eq!(connection.error.as_deref(), Some("connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_disconnect_after_error_is_not_an_error() {
        let connector = MockConnector::new();
        let transport = Transport::spawn(
            Target::parse("10.0.0.2").unwrap(),
            TransportConfig::default(),
            Arc::new(connector.clone()),
        )
        .unwrap();
        let store = StatusStore::new(GRACE);
        let _tracker = store.track_transport(&transport);

        transport.connect();
        settle().await;
        connector.last().accept();
        settle().await;
        connector.last().drop_connection();
        settle().await;
        assert_eq!(transport.state(), TransportState::Reconnecting);

        transport.disconnect();
        settle().await;
        tokio::time::advance(GRACE).await;
        settle().await;
        let connection = store.connection();
        assert_eq!(connection.state, LinkState::Disconnected);
        assert_eq!(connection.error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_connection_skips_grace_period() {
        let store = StatusStore::new(GRACE);
        store.set_connection_state_with_grace_period(LinkState::Connected, None);
        store.set_connection_state_with_grace_period(LinkState::Disconnected, None);
        assert!(store.connection().connected);

        store.reset_connection();
        assert_eq!(store.connection(), ConnectionStatus::default());

        tokio::time::advance(ms(5000)).await;
        settle().await;
        assert_eq!(store.connection(), ConnectionStatus::default());
    }

    #[tokio::test]
    async fn test_tracks_router_notifications() {
        let router = Router::default();
        let store = StatusStore::new(GRACE);
        let _tracker = store.track_notifications(&router);
        let mut rx = store.subscribe();

        router.handle_message(
            &json!({"jsonrpc": "2.0", "method": "media.started", "params": {"systemId": "NES"}})
                .to_string(),
        );
        rx.changed().await.unwrap();
        assert_eq!(
            rx.borrow().playing.as_ref().map(|m| m.system_id.as_str()),
            Some("NES")
        );
    }
}
