//! Device key-agreement keys
//!
//! Each *device* holds one X25519 key pair. The public half is exportable as
//! base64url and is what peers receive from the directory service. The
//! private half is a [`PrivateKeyHandle`]: a capability that can derive a
//! shared key with a peer, and nothing else. It has no byte export, no
//! `Serialize` impl and a redacted `Debug`; the only code that touches the raw
//! scalar is crate-private (the identity store when persisting, the vault when
//! sealing a bundle).
//!
//! Shared keys
//! -----------
//! `derive_shared_key` runs X25519 and then HKDF-SHA256 over the raw shared
//! secret. Both public keys are bound into the HKDF info in sorted order, so
//! A·B and B·A produce the same key. The raw ECDH output is never used as a
//! key directly.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::crypto::{
    aead::{self, AeadBox},
    error::CryptoError,
    kdf::{hkdf_expand, LABEL_PAIRWISE},
    random::random_array,
};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SECRET_KEY_LEN: usize = 32;
pub const SHARED_KEY_LEN: usize = 32;

// ── Public key ────────────────────────────────────────────────────────────────

/// 32-byte X25519 public key, base64url-encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "Public key must be {PUBLIC_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD.decode(s.trim())?;
        Self::from_bytes(&bytes)
    }

    /// Human-readable fingerprint: BLAKE3 of the public key, truncated to
    /// 20 bytes, hex-encoded in groups of 4 for display.
    ///
    /// Example: "a1b2 c3d4 e5f6 7890 abcd ef01 2345 6789 0abc def0"
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        let hex = hex::encode(&hash.as_bytes()[..20]);
        hex.as_bytes()
            .chunks(4)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

// ── Private key handle ────────────────────────────────────────────────────────

/// Opaque handle to the device's X25519 secret. Zeroized on drop (the inner
/// `StaticSecret` clears itself).
pub struct PrivateKeyHandle {
    secret: StaticSecret,
    public: PublicKey,
}

impl PrivateKeyHandle {
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Derive the pairwise symmetric key shared with `remote`.
    pub fn derive_shared_key(&self, remote: &PublicKey) -> Result<SharedKey, CryptoError> {
        derive_shared_key(self, remote)
    }

    /// Raw scalar, for the identity store and bundle sealing only.
    pub(crate) fn secret_bytes(&self) -> Zeroizing<[u8; SECRET_KEY_LEN]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub(crate) fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: Zeroizing<[u8; SECRET_KEY_LEN]> = Zeroizing::new(
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("Device secret must be 32 bytes".into()))?,
        );
        let secret = StaticSecret::from(*arr);
        let public = PublicKey(X25519Public::from(&secret).to_bytes());
        Ok(Self { secret, public })
    }
}

impl fmt::Debug for PrivateKeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKeyHandle")
            .field("public", &self.public)
            .field("secret", &"<redacted>")
            .finish()
    }
}

// ── Key pair ──────────────────────────────────────────────────────────────────

/// A freshly generated device key pair.
#[derive(Debug)]
pub struct KeyAgreementPair {
    pub public: PublicKey,
    pub private: PrivateKeyHandle,
}

impl KeyAgreementPair {
    pub fn generate() -> Result<Self, CryptoError> {
        let seed: Zeroizing<[u8; SECRET_KEY_LEN]> = Zeroizing::new(random_array()?);
        let private = PrivateKeyHandle::from_secret_bytes(seed.as_slice())?;
        Ok(Self {
            public: private.public_key(),
            private,
        })
    }

    pub fn into_private(self) -> PrivateKeyHandle {
        self.private
    }
}

// ── Shared key ────────────────────────────────────────────────────────────────

/// Pairwise symmetric key. Never persisted; zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct SharedKey([u8; SHARED_KEY_LEN]);

impl SharedKey {
    pub fn as_bytes(&self) -> &[u8; SHARED_KEY_LEN] {
        &self.0
    }

    /// Encrypt a message body for the peer this key was derived with.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<AeadBox, CryptoError> {
        aead::encrypt(&self.0, plaintext, aad)
    }

    /// Decrypt a message body sealed by the peer.
    pub fn open(&self, sealed: &AeadBox, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        aead::decrypt(&self.0, sealed, aad)
    }

    /// Short hex digest for out-of-band comparison. Reveals nothing useful
    /// about the key itself.
    pub fn fingerprint(&self) -> String {
        let digest = blake3::keyed_hash(&self.0, b"keyhold:shared-key-fingerprint");
        hex::encode(&digest.as_bytes()[..8])
    }
}

impl PartialEq for SharedKey {
    fn eq(&self, other: &Self) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
    }
}

impl Eq for SharedKey {}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(<redacted>)")
    }
}

/// X25519 + HKDF-SHA256. Symmetric in its two parties.
pub fn derive_shared_key(
    local: &PrivateKeyHandle,
    remote: &PublicKey,
) -> Result<SharedKey, CryptoError> {
    let shared = local
        .secret
        .diffie_hellman(&X25519Public::from(*remote.as_bytes()));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey(
            "peer public key is a low-order point".into(),
        ));
    }

    let (first, second) = if local.public <= *remote {
        (local.public, *remote)
    } else {
        (*remote, local.public)
    };
    let mut info = Vec::with_capacity(LABEL_PAIRWISE.len() + 2 * PUBLIC_KEY_LEN);
    info.extend_from_slice(LABEL_PAIRWISE);
    info.extend_from_slice(first.as_bytes());
    info.extend_from_slice(second.as_bytes());

    let mut key = SharedKey([0u8; SHARED_KEY_LEN]);
    hkdf_expand(shared.as_bytes(), Some(LABEL_PAIRWISE), &info, &mut key.0)?;
    Ok(key)
}
