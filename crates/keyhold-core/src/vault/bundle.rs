//! Encrypted identity bundles
//!
//! One plaintext payload (the device key pair plus metadata) is sealed up to
//! three times: under the PIN key, under the recovery wrap key, and
//! optionally under a remembered-device key. Each seal binds the wrapping
//! kind and the user id as associated data.
//!
//! Stored form (JSON):
//!   {
//!     "version": 1,
//!     "wrapping": { "kdf": "pbkdf2-sha256", "salt": b64url, "iterations": n }
//!               | { "kdf": "recovery-key" } | { "kdf": "remembered" },
//!     "sealed": { "ciphertext": b64url, "nonce": b64url }
//!   }

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{aead, AeadBox, CryptoError, PrivateKeyHandle, PublicKey};
use crate::store::DeviceRecord;

pub const BUNDLE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kdf", rename_all = "kebab-case")]
pub enum Wrapping {
    #[serde(rename = "pbkdf2-sha256")]
    Pbkdf2Sha256 { salt: String, iterations: u32 },
    RecoveryKey,
    Remembered,
}

impl Wrapping {
    pub fn pbkdf2(salt: &[u8], iterations: u32) -> Self {
        Self::Pbkdf2Sha256 {
            salt: URL_SAFE_NO_PAD.encode(salt),
            iterations,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Wrapping::Pbkdf2Sha256 { .. } => "pin",
            Wrapping::RecoveryKey => "recovery",
            Wrapping::Remembered => "remembered",
        }
    }
}

/// A sealed bundle. Safe to hand to any transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBundle {
    pub version: u32,
    pub wrapping: Wrapping,
    pub sealed: AeadBox,
}

impl EncryptedBundle {
    pub fn to_json(&self) -> Result<String, CryptoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self, CryptoError> {
        let bundle: Self = serde_json::from_str(s)?;
        if bundle.version != BUNDLE_VERSION {
            return Err(CryptoError::InvalidKey(format!(
                "unsupported bundle version {}",
                bundle.version
            )));
        }
        Ok(bundle)
    }

    /// Salt and iteration count of a PIN bundle.
    pub fn pin_params(&self) -> Option<(Vec<u8>, u32)> {
        match &self.wrapping {
            Wrapping::Pbkdf2Sha256 { salt, iterations } => URL_SAFE_NO_PAD
                .decode(salt)
                .ok()
                .map(|salt| (salt, *iterations)),
            _ => None,
        }
    }

    /// Decrypt and parse. Anything short of a well-formed payload for
    /// `user_id` is `AuthenticationFailed`.
    pub(crate) fn open(&self, user_id: &str, key: &[u8; 32]) -> Result<BundlePayload, CryptoError> {
        let aad = associated_data(&self.wrapping, user_id);
        let plaintext = aead::decrypt(key, &self.sealed, aad.as_bytes())?;
        let payload: BundlePayload =
            serde_json::from_slice(&plaintext).map_err(|_| CryptoError::AuthenticationFailed)?;
        if payload.user_id != user_id || payload.version != BUNDLE_VERSION {
            return Err(CryptoError::AuthenticationFailed);
        }
        Ok(payload)
    }
}

fn associated_data(wrapping: &Wrapping, user_id: &str) -> String {
    format!("keyhold:bundle:v{BUNDLE_VERSION}:{}:{user_id}", wrapping.label())
}

/// Plaintext inside every bundle. Field order is the canonical JSON order.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(crate) struct BundlePayload {
    #[zeroize(skip)]
    pub version: u32,
    #[zeroize(skip)]
    pub user_id: String,
    #[zeroize(skip)]
    pub device_id: String,
    #[zeroize(skip)]
    pub device_uuid: Uuid,
    #[zeroize(skip)]
    pub public_key: String,
    secret_key: String,
    #[zeroize(skip)]
    pub salt: String,
    #[zeroize(skip)]
    pub iterations: u32,
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
}

impl BundlePayload {
    pub(crate) fn new(
        record: &DeviceRecord,
        device_uuid: Uuid,
        salt: &[u8],
        iterations: u32,
    ) -> Self {
        let secret = record.private_key_bytes();
        Self {
            version: BUNDLE_VERSION,
            user_id: record.user_id.clone(),
            device_id: record.device_id.clone(),
            device_uuid,
            public_key: record.public_key.to_base64(),
            secret_key: URL_SAFE_NO_PAD.encode(&secret[..]),
            salt: URL_SAFE_NO_PAD.encode(salt),
            iterations,
            created_at: record.created_at,
        }
    }

    /// Rebuild the private key handle, checking it against the recorded
    /// public key.
    pub(crate) fn private_key(&self) -> Result<PrivateKeyHandle, CryptoError> {
        let secret = Zeroizing::new(
            URL_SAFE_NO_PAD
                .decode(&self.secret_key)
                .map_err(|_| CryptoError::AuthenticationFailed)?,
        );
        let handle = PrivateKeyHandle::from_secret_bytes(&secret)
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        let recorded =
            PublicKey::from_base64(&self.public_key).map_err(|_| CryptoError::AuthenticationFailed)?;
        if handle.public_key() != recorded {
            return Err(CryptoError::AuthenticationFailed);
        }
        Ok(handle)
    }

    /// Rebuild the device record this payload was sealed from.
    pub(crate) fn device_record(&self) -> Result<DeviceRecord, CryptoError> {
        let mut record =
            DeviceRecord::new(self.user_id.clone(), self.private_key()?).with_device_uuid(self.device_uuid);
        record.created_at = self.created_at;
        Ok(record)
    }

    pub(crate) fn seal(&self, wrapping: Wrapping, key: &[u8; 32]) -> Result<EncryptedBundle, CryptoError> {
        let plaintext = Zeroizing::new(serde_json::to_vec(self)?);
        let aad = associated_data(&wrapping, &self.user_id);
        let sealed = aead::encrypt(key, &plaintext, aad.as_bytes())?;
        Ok(EncryptedBundle {
            version: BUNDLE_VERSION,
            wrapping,
            sealed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyAgreementPair;

    fn payload(user_id: &str) -> BundlePayload {
        let record = DeviceRecord::new(user_id, KeyAgreementPair::generate().unwrap().into_private());
        BundlePayload::new(&record, Uuid::new_v4(), &[7u8; 16], 1_000)
    }

    #[test]
    fn seal_then_open_recovers_the_key_pair() {
        let p = payload("u1");
        let key = [3u8; 32];
        let bundle = p.seal(Wrapping::pbkdf2(&[7u8; 16], 1_000), &key).unwrap();

        let json = bundle.to_json().unwrap();
        let opened = EncryptedBundle::from_json(&json)
            .unwrap()
            .open("u1", &key)
            .unwrap();
        assert_eq!(opened.public_key, p.public_key);
        assert_eq!(
            opened.private_key().unwrap().public_key(),
            p.private_key().unwrap().public_key()
        );
        assert_eq!(bundle.pin_params(), Some((vec![7u8; 16], 1_000)));
    }

    #[test]
    fn bundle_is_bound_to_user_and_wrapping() {
        let p = payload("u1");
        let key = [3u8; 32];
        let bundle = p.seal(Wrapping::RecoveryKey, &key).unwrap();

        assert!(matches!(
            bundle.open("u2", &key),
            Err(CryptoError::AuthenticationFailed)
        ));

        let mut relabelled = bundle.clone();
        relabelled.wrapping = Wrapping::Remembered;
        assert!(matches!(
            relabelled.open("u1", &key),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn serialized_bundle_contains_no_secret() {
        let p = payload("u1");
        let secret = p.secret_key.clone();
        let json = p
            .seal(Wrapping::Remembered, &[1u8; 32])
            .unwrap()
            .to_json()
            .unwrap();
        assert!(!json.contains(&secret));
        assert!(json.contains("\"kdf\":\"remembered\""));
    }

    #[test]
    fn unknown_version_rejected() {
        let p = payload("u1");
        let mut bundle = p.seal(Wrapping::RecoveryKey, &[1u8; 32]).unwrap();
        bundle.version = 99;
        let json = serde_json::to_string(&bundle).unwrap();
        assert!(EncryptedBundle::from_json(&json).is_err());
    }

    #[test]
    fn pin_params_absent_on_other_wrappings() {
        let bundle = payload("u1").seal(Wrapping::RecoveryKey, &[1u8; 32]).unwrap();
        assert_eq!(bundle.pin_params(), None);
    }
}
