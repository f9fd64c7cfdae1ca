//! Local identity store
//!
//! SQLite via sqlx, one row per user in each table:
//! - `devices`          — public key, sealed private key, device id, uuid
//! - `bundles`          — "remember this device" bundle and its unwrap key
//! - `wrapped_bundles`  — PIN- and recovery-wrapped identity bundles
//! - `device_uuids`     — stable per-user device uuid
//!
//! The private key column is sealed under a per-user storage key held by a
//! [`KeyCustody`] backend outside the database (see `custody`).
//!
//! Callers never see sqlx types. Engine errors surface as [`StoreError`].
//! Schema changes go through the SQL files in `migrations/`, run on first
//! open.

mod bundles;
pub mod custody;
mod db;
mod devices;
pub mod error;
pub mod models;

pub use custody::{CustodyKind, EphemeralCustody, KeyCustody, OsKeyring};
pub use db::{IdentityStore, DEFAULT_BUSY_TIMEOUT};
pub use error::StoreError;
pub use models::{DeviceRecord, EnrollmentWrite, RememberedBundle, WrappedBundles};

#[cfg(test)]
pub(crate) fn test_store(path: impl Into<std::path::PathBuf>) -> IdentityStore {
    IdentityStore::with_options(path, DEFAULT_BUSY_TIMEOUT, EphemeralCustody::shared())
}
