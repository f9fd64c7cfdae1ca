//! Cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Higher layers never see algorithm parameters; they get opaque newtypes.
//!
//! # Module layout
//! - `random`    — OS CSPRNG access with a typed failure
//! - `aead`      — AES-256-GCM encrypt/decrypt with per-call random nonces
//! - `kdf`       — PBKDF2 PIN keys, HKDF subkeys, domain labels
//! - `keys`      — X25519 device keys, opaque private handle, shared keys
//! - `recovery`  — recovery key generation and display encoding
//! - `error`     — crypto error type

pub mod aead;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod random;
pub mod recovery;

pub use aead::AeadBox;
pub use error::CryptoError;
pub use keys::{derive_shared_key, KeyAgreementPair, PrivateKeyHandle, PublicKey, SharedKey};
pub use recovery::{format_recovery_key, parse_recovery_key, RecoveryKey};
