//! Device link facade.
//!
//! [`DeviceLink`] is what an application holds: one router, one status
//! store, and at most one live transport. Switching devices destroys the
//! old transport and resets the router before the new one is created.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::router::{CallOutcome, Router, RouterConfig};
use crate::core::{
    AddressStore, CallError, ConfigError, DEFAULT_GRACE_PERIOD, LinkError, Target,
    get_device_address, set_device_address,
};
use crate::status::StatusStore;
use crate::transport::{Connector, Transport, TransportConfig};

/// Configuration for a [`DeviceLink`].
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    /// Transport settings.
    pub transport: TransportConfig,
    /// Router settings.
    pub router: RouterConfig,
    /// How long a dropped connection is still shown as connected.
    pub grace_period: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            router: RouterConfig::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl LinkConfig {
    /// Set the transport settings.
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Set the router settings.
    pub fn with_router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    /// Set the grace period.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Check the configuration invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport.validate()?;
        self.router.validate()?;
        if self.grace_period.is_zero() {
            return Err(ConfigError::ZeroDuration("grace_period"));
        }
        Ok(())
    }
}

struct ActiveTransport {
    transport: Transport,
    tracker: JoinHandle<()>,
}

impl ActiveTransport {
    fn shutdown(self, status: &StatusStore) {
        self.tracker.abort();
        self.transport.destroy();
        status.reset_connection();
    }
}

/// Connection to one Zaparoo Core device at a time.
pub struct DeviceLink {
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    addresses: Arc<dyn AddressStore>,
    router: Router,
    status: StatusStore,
    active: Mutex<Option<ActiveTransport>>,
    notifications: JoinHandle<()>,
}

impl std::fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("transport", &self.transport())
            .field("router", &self.router)
            .finish()
    }
}

impl DeviceLink {
    /// Create a link. Must be called from within a tokio runtime.
    pub fn new(
        config: LinkConfig,
        connector: Arc<dyn Connector>,
        addresses: Arc<dyn AddressStore>,
    ) -> Result<Self, LinkError> {
        config.validate()?;
        let router = Router::new(config.router.clone());
        let status = StatusStore::new(config.grace_period);
        let notifications = status.track_notifications(&router);
        Ok(Self {
            config,
            connector,
            addresses,
            router,
            status,
            active: Mutex::new(None),
            notifications,
        })
    }

    /// Create a link dialing over WebSocket.
    #[cfg(feature = "websocket")]
    pub fn websocket(config: LinkConfig, addresses: Arc<dyn AddressStore>) -> Result<Self, LinkError> {
        Self::new(config, Arc::new(crate::transport::WsConnector::new()), addresses)
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveTransport>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The call router.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The status store.
    pub fn status(&self) -> &StatusStore {
        &self.status
    }

    /// The live transport, if any.
    pub fn transport(&self) -> Option<Transport> {
        self.active().as_ref().map(|active| active.transport.clone())
    }

    /// Connect to the stored device address.
    pub fn connect(&self) -> Result<Transport, LinkError> {
        let address = get_device_address(self.addresses.as_ref());
        if address.trim().is_empty() {
            return Err(LinkError::NoDevice);
        }
        self.connect_to(&address)
    }

    /// Connect to `address` and remember it.
    ///
    /// Reuses the live transport when it already targets the same device.
    pub fn connect_to(&self, address: &str) -> Result<Transport, LinkError> {
        let target = Target::parse(address)?;
        let mut active = self.active();

        if let Some(current) = active.as_ref() {
            if current.transport.target() == &target && !current.transport.is_destroyed() {
                current.transport.connect();
                return Ok(current.transport.clone());
            }
        }

        if let Some(previous) = active.take() {
            info!(from = %previous.transport.target(), to = %target, "switching device");
            previous.shutdown(&self.status);
            self.router.reset();
        }

        let transport = Transport::spawn(target, self.config.transport.clone(), Arc::clone(&self.connector))?;
        self.router.attach(&transport);
        let tracker = self.status.track_transport(&transport);
        set_device_address(self.addresses.as_ref(), address);
        transport.connect();
        debug!(address = %transport.target(), "transport created");

        *active = Some(ActiveTransport {
            transport: transport.clone(),
            tracker,
        });
        Ok(transport)
    }

    /// Issue a call through the router.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<CancellationToken>,
    ) -> Result<CallOutcome, CallError> {
        self.router.call(method, params, cancel).await
    }

    /// Suspend heartbeat checks, e.g. while the app is backgrounded.
    pub fn pause_heartbeat(&self) {
        if let Some(transport) = self.transport() {
            transport.pause_heartbeat();
        }
    }

    /// Resume heartbeat checks.
    pub fn resume_heartbeat(&self) {
        if let Some(transport) = self.transport() {
            transport.resume_heartbeat();
        }
    }

    /// Retry now, e.g. when the app returns to the foreground.
    pub fn immediate_reconnect(&self) {
        if let Some(transport) = self.transport() {
            transport.immediate_reconnect();
        }
    }

    /// Close the connection without forgetting the device.
    pub fn disconnect(&self) {
        if let Some(transport) = self.transport() {
            transport.disconnect();
        }
    }

    /// Destroy the transport and fail every pending call.
    pub fn shutdown(&self) {
        let active = self.active().take();
        if let Some(active) = active {
            active.shutdown(&self.status);
        }
        self.router.reset();
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.shutdown();
        self.notifications.abort();
    }
}
