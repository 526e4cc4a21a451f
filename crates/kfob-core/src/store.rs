//! Persistence for the token's entity set.
//!
//! The whole token persists as one [`TokenRecord`], written atomically after
//! every committed operation. The session-scoped "PIN verified" flag is
//! never part of the record, so reopening a token starts a new session.
//!
//! Two stores are provided: [`MemoryStore`] for tests and [`FileStore`],
//! which writes JSON with byte fields hex-encoded.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroize;

use crate::pairing::PairingState;

/// Current on-disk record version.
pub const RECORD_VERSION: u32 = 1;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::OperationFailed(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

// ============================================================================
// Data Models
// ============================================================================

/// Hex encoding for optional byte fields.
mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(d)?;
        text.map(|t| hex::decode(t).map_err(<D::Error as serde::de::Error>::custom))
            .transpose()
    }
}

/// Identity fields; `None` means the field's set flag is false.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    #[serde(default, with = "hex_opt")]
    pub serial_number: Option<Vec<u8>>,
    #[serde(default, with = "hex_opt")]
    pub unique_id: Option<Vec<u8>>,
    #[serde(default, with = "hex_opt")]
    pub display_name: Option<Vec<u8>>,
}

/// PIN credential minus the session flag.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(default, with = "hex_opt")]
    pub pin: Option<Vec<u8>>,
    pub try_limit: u8,
    pub tries_remaining: u8,
    pub blocked: bool,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("pin", &self.pin.as_ref().map(|_| "[REDACTED]"))
            .field("try_limit", &self.try_limit)
            .field("tries_remaining", &self.tries_remaining)
            .field("blocked", &self.blocked)
            .finish()
    }
}

impl Drop for CredentialRecord {
    fn drop(&mut self) {
        self.pin.zeroize();
    }
}

/// Pairing progress and every secret the handshake produced.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingRecord {
    pub state: PairingState,
    #[serde(default, with = "hex_opt")]
    pub key_scalar: Option<Vec<u8>>,
    #[serde(default, with = "hex_opt")]
    pub session_key: Option<Vec<u8>>,
    #[serde(default)]
    pub secret_confirmed: bool,
    #[serde(default, with = "hex_opt")]
    pub seed_x: Option<Vec<u8>>,
    #[serde(default, with = "hex_opt")]
    pub seed_y: Option<Vec<u8>>,
    #[serde(default, with = "hex_opt")]
    pub ble_seed: Option<Vec<u8>>,
    #[serde(default, with = "hex_opt")]
    pub pair_key: Option<Vec<u8>>,
}

impl fmt::Debug for PairingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let present = |v: &Option<Vec<u8>>| v.is_some();
        f.debug_struct("PairingRecord")
            .field("state", &self.state)
            .field("key_scalar", &present(&self.key_scalar))
            .field("session_key", &present(&self.session_key))
            .field("secret_confirmed", &self.secret_confirmed)
            .field("seed_x", &present(&self.seed_x))
            .field("seed_y", &present(&self.seed_y))
            .field("ble_seed", &present(&self.ble_seed))
            .field("pair_key", &present(&self.pair_key))
            .finish()
    }
}

impl Drop for PairingRecord {
    fn drop(&mut self) {
        self.key_scalar.zeroize();
        self.session_key.zeroize();
        self.seed_x.zeroize();
        self.seed_y.zeroize();
        self.ble_seed.zeroize();
        self.pair_key.zeroize();
    }
}

/// Everything the token persists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub version: u32,
    pub identity: IdentityRecord,
    pub credential: CredentialRecord,
    pub pairing: PairingRecord,
}

impl Default for TokenRecord {
    fn default() -> Self {
        Self {
            version: RECORD_VERSION,
            identity: IdentityRecord::default(),
            credential: CredentialRecord::default(),
            pairing: PairingRecord::default(),
        }
    }
}

impl TokenRecord {
    fn check_version(self) -> Result<Self, StoreError> {
        if self.version != RECORD_VERSION {
            return Err(StoreError::DataCorruption(format!(
                "unsupported record version {}",
                self.version
            )));
        }
        Ok(self)
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Storage abstraction for the token record.
pub trait Store: Send + Sync {
    /// Load the persisted record.
    ///
    /// # Returns
    /// * `Ok(Some(record))` if a record exists
    /// * `Ok(None)` for a factory-fresh token
    /// * `Err(StoreError)` if the record cannot be read or decoded
    fn load(&self) -> Result<Option<TokenRecord>, StoreError>;

    /// Replace the persisted record.
    ///
    /// Either the whole record is written or nothing is.
    fn save(&self, record: &TokenRecord) -> Result<(), StoreError>;

    /// Remove the persisted record. Succeeds if none exists.
    fn clear(&self) -> Result<(), StoreError>;
}

impl<T: Store + ?Sized> Store for Arc<T> {
    fn load(&self) -> Result<Option<TokenRecord>, StoreError> {
        (**self).load()
    }

    fn save(&self, record: &TokenRecord) -> Result<(), StoreError> {
        (**self).save(record)
    }

    fn clear(&self) -> Result<(), StoreError> {
        (**self).clear()
    }
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// In-memory store for tests and simulations.
#[derive(Debug, Default)]
pub struct MemoryStore {
    record: Mutex<Option<TokenRecord>>,
    saves: AtomicUsize,
    fail_next_save: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make the next `save` fail, simulating a write error.
    pub fn fail_next_save(&self) {
        self.fail_next_save.store(true, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Result<Option<TokenRecord>, StoreError> {
        self.load()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<TokenRecord>>, StoreError> {
        self.record
            .lock()
            .map_err(|_| StoreError::OperationFailed("store lock poisoned".into()))
    }
}

impl Store for MemoryStore {
    fn load(&self) -> Result<Option<TokenRecord>, StoreError> {
        Ok(self.lock()?.clone())
    }

    fn save(&self, record: &TokenRecord) -> Result<(), StoreError> {
        if self.fail_next_save.swap(false, Ordering::SeqCst) {
            return Err(StoreError::OperationFailed("injected write failure".into()));
        }
        *self.lock()? = Some(record.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.lock()? = None;
        Ok(())
    }
}

// ============================================================================
// File Store
// ============================================================================

/// JSON file store. Saves go to a sibling temp file that is then renamed over
/// the record, so a crash mid-write never leaves a torn record.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Store for FileStore {
    fn load(&self) -> Result<Option<TokenRecord>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: TokenRecord = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::DataCorruption(e.to_string()))?;
        record.check_version().map(Some)
    }

    fn save(&self, record: &TokenRecord) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut json = serde_json::to_vec_pretty(record)?;
        let tmp = self.temp_path();
        let written = fs::write(&tmp, &json);
        json.zeroize();
        written?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), state = %record.pairing.state, "token record saved");
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_record() -> TokenRecord {
        let mut pairing = PairingRecord::default();
        pairing.state = PairingState::SeedXStored;
        pairing.session_key = Some(vec![0xAB; 24]);
        pairing.secret_confirmed = true;
        pairing.seed_x = Some(vec![0xCD; 24]);

        TokenRecord {
            identity: IdentityRecord {
                serial_number: Some(vec![1u8; 16]),
                unique_id: None,
                display_name: Some(b"fob".to_vec()),
            },
            credential: CredentialRecord {
                pin: Some(vec![1, 2, 3, 4, 5, 6]),
                try_limit: 5,
                tries_remaining: 4,
                blocked: false,
            },
            pairing,
            ..TokenRecord::default()
        }
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.load().unwrap(), None);
        store.save(&sample_record()).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample_record()));
        assert_eq!(store.save_count(), 1);
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_memory_store_injected_failure() {
        let store = MemoryStore::new();
        store.fail_next_save();
        assert!(store.save(&sample_record()).is_err());
        assert_eq!(store.load().unwrap(), None);
        store.save(&sample_record()).unwrap();
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("state").join("token.json"));
        assert_eq!(store.load().unwrap(), None);

        store.save(&sample_record()).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample_record()));
        assert!(!store.temp_path().exists());

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
        store.clear().unwrap();
    }

    #[test]
    fn test_file_store_hex_encodes_bytes() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("token.json"));
        store.save(&sample_record()).unwrap();
        let text = fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("\"cdcdcdcd"));
        assert!(text.contains("\"SeedXStored\""));
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("token.json"));
        fs::write(store.path(), b"{not json").unwrap();
        assert!(matches!(store.load(), Err(StoreError::DataCorruption(_))));
    }

    #[test]
    fn test_file_store_rejects_unknown_version() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("token.json"));
        let mut rec = sample_record();
        rec.version = 99;
        store.save(&rec).unwrap();
        assert!(matches!(store.load(), Err(StoreError::DataCorruption(_))));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let dbg = format!("{:?}", sample_record());
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("205")); // 0xCD
        assert!(!dbg.contains("171")); // 0xAB
    }
}
