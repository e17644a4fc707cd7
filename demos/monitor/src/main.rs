//! Zaparoo Core connection monitor.
//!
//! Connects to a device, logs every status change and server event, and asks
//! the device for its version once connected.
//!
//!   ZAPAROO_ADDRESS=192.168.1.20 cargo run -p zaparoo-monitor
//!
//! Log verbosity comes from `ZAPAROO_LOG`, then `RUST_LOG`, then `info`.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use zaparoo_link::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("ZAPAROO_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).context("invalid log filter")?)
        .init();

    let address = std::env::var("ZAPAROO_ADDRESS").context("set ZAPAROO_ADDRESS to the device address")?;

    let store: Arc<dyn AddressStore> = Arc::new(MemoryAddressStore::new());
    set_device_address(store.as_ref(), &address);

    let link = DeviceLink::websocket(LinkConfig::default(), store)?;
    let transport = link.connect()?;
    tracing::info!(target_url = %transport.target(), "connecting");

    let mut status = link.status().subscribe();
    let mut asked_version = false;
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                tracing::info!(status = %serde_json::to_string(&snapshot)?, "status");

                if snapshot.connection.connected && !asked_version {
                    asked_version = true;
                    match link.call("version", None, None).await {
                        Ok(outcome) => tracing::info!(?outcome, "version"),
                        Err(e) => tracing::warn!(error = %e, "version call failed"),
                    }
                }
                if !snapshot.connection.connected {
                    asked_version = false;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    link.shutdown();
    Ok(())
}
