//! File-backed key-value storage using Tokio

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::KeyValueStore,
};
use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const RECORD_EXTENSION: &str = "rec";

/// One file per key under a root directory
///
/// File names are the SHA-256 of the key so arbitrary key strings are safe on
/// every filesystem. Each file stores `[u32 BE key length][key][value]` so that
/// keys can be listed without a separate index. Writes go to a temporary file
/// first and are renamed into place.
pub struct FileKeyValueStore {
    root: PathBuf,
}

impl FileKeyValueStore {
    /// Store under the platform data directory
    pub fn new() -> Self {
        let root = dirs::data_dir()
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".local")
                    .join("share")
            })
            .join("query-cache");

        Self { root }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.root
            .join(format!("{}.{}", hex::encode(digest), RECORD_EXTENSION))
    }

    async fn ensure_root(&self) -> Result<()> {
        if fs::metadata(&self.root).await.is_err() {
            fs::create_dir_all(&self.root).await?;
            debug!(path = ?self.root, "Created storage directory");
        }
        Ok(())
    }

    fn encode_record(key: &str, value: &[u8]) -> Result<Bytes> {
        let key_len = u32::try_from(key.len())
            .map_err(|_| BridgeError::OperationFailed("Key too long".to_string()))?;
        let mut buf = BytesMut::with_capacity(4 + key.len() + value.len());
        buf.put_u32(key_len);
        buf.put_slice(key.as_bytes());
        buf.put_slice(value);
        Ok(buf.freeze())
    }

    fn decode_record(raw: Bytes) -> Result<(String, Bytes)> {
        if raw.len() < 4 {
            return Err(BridgeError::OperationFailed(
                "Record shorter than header".to_string(),
            ));
        }
        let key_len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        if raw.len() < 4 + key_len {
            return Err(BridgeError::OperationFailed(
                "Record truncated inside key".to_string(),
            ));
        }
        let key = std::str::from_utf8(&raw[4..4 + key_len])
            .map_err(|e| BridgeError::OperationFailed(format!("Invalid key encoding: {}", e)))?
            .to_string();
        Ok((key, raw.slice(4 + key_len..)))
    }

    async fn read_record(path: &Path) -> Result<Option<(String, Bytes)>> {
        match fs::read(path).await {
            Ok(raw) => Self::decode_record(Bytes::from(raw)).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BridgeError::Io(e)),
        }
    }
}

impl Default for FileKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn read(&self, key: &str) -> Result<Option<Bytes>> {
        match Self::read_record(&self.path_for(key)).await? {
            Some((stored_key, value)) if stored_key == key => Ok(Some(value)),
            Some((stored_key, _)) => {
                warn!(key, stored_key = %stored_key, "Record key mismatch, ignoring");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, value: Bytes) -> Result<()> {
        self.ensure_root().await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, Self::encode_record(key, &value)?).await?;
        fs::rename(&tmp, &path).await?;
        debug!(key, bytes = value.len(), "Wrote record");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BridgeError::Io(e)),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BridgeError::Io(e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some((key, _))) if key.starts_with(prefix) => keys.push(key),
                Ok(_) => {}
                Err(e) => warn!(path = ?path, error = %e, "Skipping unreadable record"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}
