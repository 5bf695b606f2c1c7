//! OS keychain storage for the cache encryption keys

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bridge_traits::{
    error::{BridgeError, Result},
    storage::SecureStore,
};
use keyring::Entry;
use tracing::{debug, warn};

const DEFAULT_SERVICE: &str = "query-cache";

/// `SecureStore` backed by the platform keychain (Keychain on macOS,
/// Credential Manager on Windows, Secret Service on Linux).
///
/// The keychain only holds strings, so secrets are stored base64-encoded.
pub struct KeyringSecureStore {
    service_name: String,
}

impl KeyringSecureStore {
    pub fn new() -> Self {
        Self::with_service_name(DEFAULT_SERVICE)
    }

    /// Separate service names keep independent caches from sharing keys.
    pub fn with_service_name(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service_name, key).map_err(keyring_error)
    }

    /// Raw stored string, `None` when the credential does not exist.
    fn read_encoded(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(encoded) => Ok(Some(encoded)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(keyring_error(e)),
        }
    }
}

impl Default for KeyringSecureStore {
    fn default() -> Self {
        Self::new()
    }
}

fn keyring_error(e: keyring::Error) -> BridgeError {
    BridgeError::OperationFailed(format!("Keyring error: {}", e))
}

#[async_trait]
impl SecureStore for KeyringSecureStore {
    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entry(key)?
            .set_password(&STANDARD.encode(value))
            .map_err(keyring_error)?;
        debug!(service = %self.service_name, key, "Secret saved to keychain");
        Ok(())
    }

    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(encoded) = self.read_encoded(key)? else {
            return Ok(None);
        };
        STANDARD.decode(encoded.as_bytes()).map(Some).map_err(|e| {
            warn!(key, error = %e, "Keychain entry is not valid base64");
            BridgeError::OperationFailed(format!("Corrupt keychain entry {}: {}", key, e))
        })
    }

    async fn delete_secret(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(keyring_error(e)),
        }
    }

    async fn has_secret(&self, key: &str) -> Result<bool> {
        Ok(self.read_encoded(key)?.is_some())
    }
}
