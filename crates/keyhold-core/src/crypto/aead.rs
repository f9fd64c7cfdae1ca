//! Authenticated Encryption with Associated Data
//!
//! Uses AES-256-GCM (96-bit nonce).
//! Key size: 32 bytes.  Nonce: 12 bytes (random, generated per call).  Tag: 16 bytes.
//!
//! Callers never supply a nonce. `encrypt` draws a fresh one from the OS RNG
//! on every call, so nonce reuse under one key cannot be expressed through
//! this API.
//!
//! Box wire format (JSON):
//!   { "ciphertext": b64url(ciphertext || tag), "nonce": b64url(nonce) }

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{error::CryptoError, random::random_array};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Ciphertext plus the nonce it was sealed with, both base64url.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AeadBox {
    pub ciphertext: String,
    pub nonce: String,
}

/// Encrypt `plaintext` under a 32-byte key with a freshly generated nonce.
/// `aad` — additional associated data (authenticated but not encrypted).
pub fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> Result<AeadBox, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce_bytes: [u8; NONCE_LEN] = random_array()?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    Ok(AeadBox {
        ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
        nonce: URL_SAFE_NO_PAD.encode(nonce_bytes),
    })
}

/// Decrypt and verify a box.
///
/// A malformed box (bad base64, short nonce, truncated tag) is reported as
/// `AuthenticationFailed`, the same as a tag mismatch.
pub fn decrypt(
    key: &[u8; KEY_LEN],
    sealed: &AeadBox,
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let nonce_bytes = URL_SAFE_NO_PAD
        .decode(&sealed.nonce)
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(CryptoError::AuthenticationFailed);
    }
    let ciphertext = URL_SAFE_NO_PAD
        .decode(&sealed.ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::AuthenticationFailed);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload { msg: &ciphertext, aad },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    Ok(Zeroizing::new(plaintext))
}
