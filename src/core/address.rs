//! Device address resolution and persistence.
//!
//! A [`Target`] is resolved once per transport and never changes afterwards.
//! Persistence is best-effort: callers use [`get_device_address`] and
//! [`set_device_address`], which log failures instead of returning them.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::constants::{DEFAULT_API_PATH, DEFAULT_PORT};
use super::error::{AddressError, StoreError};

/// A resolved device endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    url: String,
}

impl Target {
    /// Parse a user supplied address.
    ///
    /// Accepts `host`, `host:port`, `[v6]`, `[v6]:port` or a full
    /// `ws://`/`wss://` URL. Bare hosts get the Zaparoo Core port and API path.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AddressError::Empty);
        }

        if let Some((scheme, _)) = input.split_once("://") {
            return match scheme {
                "ws" | "wss" => Ok(Self {
                    url: input.to_string(),
                }),
                _ => Err(AddressError::UnsupportedScheme(input.to_string())),
            };
        }

        let (host, port) = split_host_port(input)?;
        if host.is_empty() {
            return Err(AddressError::Empty);
        }
        Ok(Self {
            url: format!("ws://{host}:{port}{DEFAULT_API_PATH}"),
        })
    }

    /// The WebSocket URL to dial.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

fn split_host_port(input: &str) -> Result<(&str, u16), AddressError> {
    // Bracketed IPv6, with or without port.
    if input.starts_with('[') {
        let Some(end) = input.find(']') else {
            return Err(AddressError::InvalidPort(input.to_string()));
        };
        let host = &input[..=end];
        let rest = &input[end + 1..];
        return match rest.strip_prefix(':') {
            Some(port) => Ok((host, parse_port(input, port)?)),
            None if rest.is_empty() => Ok((host, DEFAULT_PORT)),
            None => Err(AddressError::InvalidPort(input.to_string())),
        };
    }

    match input.rsplit_once(':') {
        // More than one colon without brackets is a bare IPv6 literal.
        Some((host, _)) if host.contains(':') => Ok((input, DEFAULT_PORT)),
        Some((host, port)) => Ok((host, parse_port(input, port)?)),
        None => Ok((input, DEFAULT_PORT)),
    }
}

fn parse_port(input: &str, port: &str) -> Result<u16, AddressError> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(AddressError::InvalidPort(input.to_string())),
        Ok(port) => Ok(port),
    }
}

/// Storage for the last chosen device address.
pub trait AddressStore: Send + Sync {
    /// Load the stored address, if any.
    fn load(&self) -> Result<Option<String>, StoreError>;

    /// Persist an address.
    fn store(&self, address: &str) -> Result<(), StoreError>;
}

/// Read the stored device address. Failures are logged and read as empty.
pub fn get_device_address(store: &dyn AddressStore) -> String {
    match store.load() {
        Ok(address) => address.unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "failed to load device address");
            String::new()
        }
    }
}

/// Persist the device address. Failures are logged and swallowed.
pub fn set_device_address(store: &dyn AddressStore, address: &str) {
    if let Err(e) = store.store(address) {
        warn!(error = %e, address, "failed to persist device address");
    }
}

/// In-memory address store.
#[derive(Debug, Default)]
pub struct MemoryAddressStore {
    address: Mutex<Option<String>>,
}

impl MemoryAddressStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl AddressStore for MemoryAddressStore {
    fn load(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .address
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn store(&self, address: &str) -> Result<(), StoreError> {
        *self.address.lock().unwrap_or_else(|e| e.into_inner()) = Some(address.to_string());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredAddress {
    address: String,
}

/// Address store backed by a small JSON file.
#[derive(Debug, Clone)]
pub struct FileAddressStore {
    path: PathBuf,
}

impl FileAddressStore {
    /// Create a store persisting to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AddressStore for FileAddressStore {
    fn load(&self) -> Result<Option<String>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let stored: StoredAddress = serde_json::from_str(&content)?;
        Ok(Some(stored.address))
    }

    fn store(&self, address: &str) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string(&StoredAddress {
            address: address.to_string(),
        })?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}
