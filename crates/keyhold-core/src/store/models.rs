//! Database row models and the records built from them.

use std::fmt;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{PrivateKeyHandle, PublicKey};
use crate::store::error::StoreError;

/// `private_key` holds the sealed secret (JSON `AeadBox` bytes), or the raw
/// 32-byte scalar on rows written before sealing.
#[derive(sqlx::FromRow)]
pub(crate) struct DeviceRow {
    pub user_id: String,
    pub device_id: String,
    pub device_uuid: Option<String>,
    pub public_key: String,
    pub private_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Drop for DeviceRow {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.private_key);
    }
}

/// The device's key-agreement identity for one user.
///
/// Not `Clone`, not `Serialize`: the private half only leaves this struct
/// through crate-private paths (sealing for the row and for bundles).
pub struct DeviceRecord {
    pub user_id: String,
    /// Short stable id derived from the public key.
    pub device_id: String,
    pub device_uuid: Option<Uuid>,
    pub public_key: PublicKey,
    private_key: PrivateKeyHandle,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceRecord {
    pub fn new(user_id: impl Into<String>, private_key: PrivateKeyHandle) -> Self {
        let public_key = private_key.public_key();
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            device_id: device_id_for(&public_key),
            device_uuid: None,
            public_key,
            private_key,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_device_uuid(mut self, device_uuid: Uuid) -> Self {
        self.device_uuid = Some(device_uuid);
        self
    }

    pub fn private_key(&self) -> &PrivateKeyHandle {
        &self.private_key
    }

    pub(crate) fn into_private_key(self) -> PrivateKeyHandle {
        self.private_key
    }

    pub(crate) fn private_key_bytes(&self) -> Zeroizing<[u8; 32]> {
        self.private_key.secret_bytes()
    }

    /// `secret` is the row's private key after unsealing.
    pub(crate) fn try_from_row(row: &DeviceRow, secret: &[u8]) -> Result<Self, StoreError> {
        let private_key = PrivateKeyHandle::from_secret_bytes(secret)
            .map_err(|e| StoreError::corrupt(&row.user_id, format!("private key: {e}")))?;
        let public_key = PublicKey::from_base64(&row.public_key)
            .map_err(|e| StoreError::corrupt(&row.user_id, format!("public key: {e}")))?;
        if private_key.public_key() != public_key {
            return Err(StoreError::corrupt(
                &row.user_id,
                "public key does not match private key",
            ));
        }
        let device_uuid = row
            .device_uuid
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|e| StoreError::corrupt(&row.user_id, format!("device uuid: {e}")))?;

        Ok(Self {
            user_id: row.user_id.clone(),
            device_id: row.device_id.clone(),
            device_uuid,
            public_key,
            private_key,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("device_uuid", &self.device_uuid)
            .field("public_key", &self.public_key)
            .field("private_key", &self.private_key)
            .finish()
    }
}

/// First 8 bytes of SHA-256 over the public key, hex.
pub fn device_id_for(public_key: &PublicKey) -> String {
    let digest = Sha256::digest(public_key.as_bytes());
    hex::encode(&digest[..8])
}

/// "Remember this device" material: an encrypted bundle and the key that
/// unwraps it, both stored locally.
pub struct RememberedBundle {
    pub user_id: String,
    pub backup_key: Zeroizing<String>,
    pub bundle_json: String,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for RememberedBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RememberedBundle")
            .field("user_id", &self.user_id)
            .field("backup_key", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct RememberedRow {
    pub user_id: String,
    pub backup_key: String,
    pub bundle_json: String,
    pub created_at: DateTime<Utc>,
}

impl From<RememberedRow> for RememberedBundle {
    fn from(row: RememberedRow) -> Self {
        Self {
            user_id: row.user_id,
            backup_key: Zeroizing::new(row.backup_key),
            bundle_json: row.bundle_json,
            created_at: row.created_at,
        }
    }
}

/// PIN- and recovery-wrapped bundles as stored. The store treats both as
/// opaque JSON.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct WrappedBundles {
    pub user_id: String,
    pub pin_bundle: String,
    pub recovery_bundle: String,
    pub updated_at: DateTime<Utc>,
}

/// Everything one enrollment persists, written in a single transaction.
#[derive(Debug)]
pub struct EnrollmentWrite<'a> {
    pub device: &'a DeviceRecord,
    pub pin_bundle: &'a str,
    pub recovery_bundle: &'a str,
    /// `None` leaves any existing remembered bundle untouched.
    pub remembered: Option<&'a RememberedBundle>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyAgreementPair;

    #[test]
    fn device_id_is_stable_and_short() {
        let pair = KeyAgreementPair::generate().unwrap();
        let a = device_id_for(&pair.public);
        assert_eq!(a.len(), 16);
        assert_eq!(a, device_id_for(&pair.public));
    }

    #[test]
    fn record_debug_hides_private_key() {
        let record = DeviceRecord::new("u1", KeyAgreementPair::generate().unwrap().into_private());
        let shown = format!("{record:?}");
        assert!(shown.contains("<redacted>"));
        let secret_hex = hex::encode(*record.private_key_bytes());
        assert!(!shown.contains(&secret_hex));
    }
}
