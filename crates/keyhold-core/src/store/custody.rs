//! Custody of the per-user storage key that seals `devices.private_key`.
//!
//! The database never holds the raw X25519 scalar. Each user's secret is
//! sealed with AES-256-GCM under a 32-byte storage key that lives outside
//! the database file: in the OS keyring in production, in process memory
//! for tests. Copying the database alone yields nothing usable.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use keyring::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::random::random_array;
use crate::store::error::StoreError;

pub const STORAGE_KEY_LEN: usize = 32;
const KEYRING_SERVICE: &str = "keyhold";

pub type StorageKey = Zeroizing<[u8; STORAGE_KEY_LEN]>;

/// Which custody backend a store uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CustodyKind {
    #[default]
    OsKeyring,
    /// Keys vanish with the process. Tests and throwaway sessions only.
    Ephemeral,
}

/// Holds storage keys outside the database. Calls may block (keyring IPC);
/// the store runs them on the blocking pool.
pub trait KeyCustody: Send + Sync {
    fn name(&self) -> &'static str;

    fn load(&self, user_id: &str) -> Result<Option<StorageKey>, StoreError>;

    /// Return the existing key or create and persist a new one. Two
    /// concurrent callers must end up with the same key.
    fn load_or_create(&self, user_id: &str) -> Result<StorageKey, StoreError>;

    /// Deleting a key that does not exist is not an error.
    fn delete(&self, user_id: &str) -> Result<(), StoreError>;
}

pub(crate) fn custody_for(kind: CustodyKind, db_path: &Path) -> Arc<dyn KeyCustody> {
    match kind {
        CustodyKind::OsKeyring => Arc::new(OsKeyring::for_database(db_path)),
        CustodyKind::Ephemeral => Arc::new(EphemeralCustody::new()),
    }
}

// ── OS keyring ────────────────────────────────────────────────────────────────

/// Storage keys in the platform credential store (Secret Service, Keychain,
/// Credential Manager). Entries are scoped to one database file so two
/// stores on the same machine never share a key.
pub struct OsKeyring {
    scope: String,
    // Serializes load-or-create; the keyring itself has no compare-and-set.
    lock: Mutex<()>,
}

impl OsKeyring {
    pub fn for_database(db_path: &Path) -> Self {
        // Not canonicalize(): the file may not exist yet on first use.
        let absolute = std::path::absolute(db_path).unwrap_or_else(|_| db_path.to_path_buf());
        let digest = blake3::hash(absolute.to_string_lossy().as_bytes());
        Self {
            scope: hex::encode(&digest.as_bytes()[..8]),
            lock: Mutex::new(()),
        }
    }

    fn account(&self, user_id: &str) -> String {
        format!("device-key:{}:{user_id}", self.scope)
    }

    fn entry(&self, user_id: &str) -> Result<Entry, StoreError> {
        Entry::new(KEYRING_SERVICE, &self.account(user_id))
            .map_err(|e| StoreError::Custody(format!("keyring init: {e}")))
    }

    fn read(&self, entry: &Entry) -> Result<Option<StorageKey>, StoreError> {
        let encoded = match entry.get_password() {
            Ok(encoded) => Zeroizing::new(encoded),
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => return Err(StoreError::Custody(format!("load storage key: {e}"))),
        };
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| StoreError::Custody(format!("decode storage key: {e}")))?,
        );
        let key: [u8; STORAGE_KEY_LEN] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Custody("storage key has the wrong length".into()))?;
        Ok(Some(Zeroizing::new(key)))
    }
}

impl KeyCustody for OsKeyring {
    fn name(&self) -> &'static str {
        "os-keyring"
    }

    fn load(&self, user_id: &str) -> Result<Option<StorageKey>, StoreError> {
        self.read(&self.entry(user_id)?)
    }

    fn load_or_create(&self, user_id: &str) -> Result<StorageKey, StoreError> {
        let _guard = self.lock.lock();
        let entry = self.entry(user_id)?;
        if let Some(key) = self.read(&entry)? {
            return Ok(key);
        }
        let key = Zeroizing::new(random_array::<STORAGE_KEY_LEN>()?);
        let encoded = Zeroizing::new(STANDARD.encode(&key[..]));
        entry
            .set_password(&encoded)
            .map_err(|e| StoreError::Custody(format!("store storage key: {e}")))?;
        debug!(user_id, "created storage key in OS keyring");
        Ok(key)
    }

    fn delete(&self, user_id: &str) -> Result<(), StoreError> {
        match self.entry(user_id)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Custody(format!("delete storage key: {e}"))),
        }
    }
}

// ── In memory ─────────────────────────────────────────────────────────────────

/// Process-local custody. Clone the `Arc` to let several stores (a simulated
/// restart, say) share the same keys.
#[derive(Default)]
pub struct EphemeralCustody {
    keys: Mutex<HashMap<String, StorageKey>>,
}

impl EphemeralCustody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn KeyCustody> {
        Arc::new(Self::new())
    }
}

impl KeyCustody for EphemeralCustody {
    fn name(&self) -> &'static str {
        "ephemeral"
    }

    fn load(&self, user_id: &str) -> Result<Option<StorageKey>, StoreError> {
        Ok(self.keys.lock().get(user_id).cloned())
    }

    fn load_or_create(&self, user_id: &str) -> Result<StorageKey, StoreError> {
        let mut keys = self.keys.lock();
        if let Some(key) = keys.get(user_id) {
            return Ok(key.clone());
        }
        let key = Zeroizing::new(random_array::<STORAGE_KEY_LEN>()?);
        keys.insert(user_id.to_owned(), key.clone());
        Ok(key)
    }

    fn delete(&self, user_id: &str) -> Result<(), StoreError> {
        self.keys.lock().remove(user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_keys_are_stable_per_user() {
        let custody = EphemeralCustody::new();
        assert!(custody.load("u1").unwrap().is_none());

        let a = custody.load_or_create("u1").unwrap();
        assert_eq!(*a, *custody.load_or_create("u1").unwrap());
        assert_eq!(*a, *custody.load("u1").unwrap().unwrap());
        assert_ne!(*a, *custody.load_or_create("u2").unwrap());

        custody.delete("u1").unwrap();
        custody.delete("u1").unwrap();
        assert!(custody.load("u1").unwrap().is_none());
    }

    #[test]
    fn keyring_accounts_are_scoped_per_database() {
        let dir = tempfile::tempdir().unwrap();
        let a = OsKeyring::for_database(&dir.path().join("a.db"));
        let b = OsKeyring::for_database(&dir.path().join("b.db"));
        let a_again = OsKeyring::for_database(&dir.path().join("a.db"));

        assert_ne!(a.account("u1"), b.account("u1"));
        assert_eq!(a.account("u1"), a_again.account("u1"));
        assert!(a.account("u1").ends_with(":u1"));
    }

    #[test]
    fn custody_kind_parses_kebab_case() {
        let kind: CustodyKind = serde_json::from_str("\"os-keyring\"").unwrap();
        assert_eq!(kind, CustodyKind::OsKeyring);
        let kind: CustodyKind = serde_json::from_str("\"ephemeral\"").unwrap();
        assert_eq!(kind, CustodyKind::Ephemeral);
    }
}
