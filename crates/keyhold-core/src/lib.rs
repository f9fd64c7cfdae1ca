//! keyhold-core — client-side E2EE key management
//!
//! One X25519 identity per (user, installation), kept in a local SQLite
//! store, protected by a short PIN and an independent recovery key, and used
//! to derive pairwise session keys with peers.
//!
//! # Module layout
//! - `crypto`   — AES-256-GCM, PBKDF2/HKDF, X25519 keys, recovery key encoding
//! - `store`    — SQLite identity store (device records, bundles, device uuid)
//!                and custody of the key sealing the device secret
//! - `vault`    — PIN enrollment, unlock, recovery
//! - `session`  — pairwise session key derivation
//! - `config`   — runtime configuration
//! - `paths`    — default on-disk locations
//! - `error`    — public error taxonomy

pub mod config;
pub mod crypto;
pub mod error;
pub mod paths;
pub mod session;
pub mod store;
pub mod vault;

pub use config::Config;
pub use error::{Error, UserContext};
pub use session::{derive_session_key, derive_session_key_for_user, SessionKey};
pub use store::{CustodyKind, DeviceRecord, IdentityStore, KeyCustody, StoreError};
pub use vault::{
    EncryptedBundle, EnrollmentOutcome, EnrollmentState, PinVault, RecoveredIdentity,
    UnlockedIdentity,
};
