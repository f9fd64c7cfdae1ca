//! Key derivation functions
//!
//! `derive_pin_key` — PBKDF2-HMAC-SHA256, turns a short user PIN plus a random
//!   salt into the 32-byte key that wraps the device bundle.
//!
//! `hkdf_expand` / `derive_subkey` — HKDF-SHA256, used for every key derived
//!   from high-entropy input (recovery key, ECDH output).

use std::fmt;

use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{error::CryptoError, random::random_array};

/// Production default. Tunable through configuration.
pub const DEFAULT_PIN_ITERATIONS: u32 = 600_000;
/// Lowest iteration count accepted outside of tests.
pub const MIN_PIN_ITERATIONS: u32 = 100_000;
/// Bundles claiming more iterations than this are treated as corrupt.
pub const MAX_PIN_ITERATIONS: u32 = 10_000_000;

pub const SALT_LEN: usize = 16;
pub const PIN_KEY_LEN: usize = 32;

// ── Domain-separation labels ──────────────────────────────────────────────────

pub const LABEL_RECOVERY_WRAP: &[u8] = b"keyhold:recovery-wrap:v1";
pub const LABEL_REMEMBERED_WRAP: &[u8] = b"keyhold:remembered-wrap:v1";
pub const LABEL_PAIRWISE: &[u8] = b"keyhold:pairwise:v1";

// ── PIN key (PBKDF2) ──────────────────────────────────────────────────────────

/// 32-byte key derived from a PIN. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PinKey([u8; PIN_KEY_LEN]);

impl PinKey {
    pub fn as_bytes(&self) -> &[u8; PIN_KEY_LEN] {
        &self.0
    }
}

impl PartialEq for PinKey {
    fn eq(&self, other: &Self) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
    }
}

impl Eq for PinKey {}

impl fmt::Debug for PinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PinKey(<redacted>)")
    }
}

/// Derive the bundle wrapping key from a PIN.
///
/// Deterministic in (pin, salt, iterations); the vault relies on this to
/// re-derive the same key at unlock time.
pub fn derive_pin_key(pin: &str, salt: &[u8], iterations: u32) -> Result<PinKey, CryptoError> {
    if iterations == 0 {
        return Err(CryptoError::KeyDerivation(
            "PBKDF2 iteration count must be non-zero".into(),
        ));
    }
    let mut key = PinKey([0u8; PIN_KEY_LEN]);
    pbkdf2_hmac::<Sha256>(pin.as_bytes(), salt, iterations, &mut key.0);
    Ok(key)
}

/// Generate a fresh random salt for a first enrollment or a PIN change.
pub fn generate_salt() -> Result<[u8; SALT_LEN], CryptoError> {
    random_array()
}

// ── HKDF-SHA256 ───────────────────────────────────────────────────────────────

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive a 32-byte subkey from high-entropy input under a domain label.
pub fn derive_subkey(ikm: &[u8], label: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf_expand(ikm, None, label, &mut key[..])?;
    Ok(key)
}
