//! Runtime configuration.
//!
//! Layered: built-in defaults, then an optional JSON file, then environment
//! overrides (`KEYHOLD_DB`, `KEYHOLD_PIN_ITERATIONS`). Call
//! [`Config::validate`] before handing the result to the vault.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::kdf::{DEFAULT_PIN_ITERATIONS, MAX_PIN_ITERATIONS, MIN_PIN_ITERATIONS};
use crate::error::Error;
use crate::paths;
use crate::store::CustodyKind;

pub const ENV_DATABASE: &str = "KEYHOLD_DB";
pub const ENV_PIN_ITERATIONS: &str = "KEYHOLD_PIN_ITERATIONS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: PathBuf,
    /// PBKDF2 iterations for newly written PIN bundles. Existing bundles
    /// keep the count they were written with.
    pub pin_iterations: u32,
    /// Permit iteration counts below the production floor. Tests only.
    pub allow_weak_kdf: bool,
    pub busy_timeout_ms: u64,
    /// Where the storage key sealing the device private key is kept.
    pub key_custody: CustodyKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: paths::default_database_path()
                .unwrap_or_else(|_| PathBuf::from(paths::DATABASE_FILE)),
            pin_iterations: DEFAULT_PIN_ITERATIONS,
            allow_weak_kdf: false,
            busy_timeout_ms: 5_000,
            key_custody: CustodyKind::OsKeyring,
        }
    }
}

impl Config {
    /// Defaults, then `file` (or the default config file when it exists),
    /// then environment overrides.
    pub fn load(file: Option<&Path>) -> Result<Self, Error> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => match paths::default_config_path() {
                Ok(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        let config = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Small-iteration config on an explicit database path with in-memory
    /// key custody, for tests and local experiments.
    pub fn for_testing(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            pin_iterations: 1_000,
            allow_weak_kdf: true,
            key_custody: CustodyKind::Ephemeral,
            ..Self::default()
        }
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), Error> {
        if let Some(db) = lookup(ENV_DATABASE).filter(|v| !v.is_empty()) {
            self.database_path = PathBuf::from(db);
        }
        if let Some(raw) = lookup(ENV_PIN_ITERATIONS) {
            self.pin_iterations = raw
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{ENV_PIN_ITERATIONS} is not a number: {raw:?}")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.pin_iterations == 0 {
            return Err(Error::Config("pin_iterations must be non-zero".into()));
        }
        if self.pin_iterations > MAX_PIN_ITERATIONS {
            return Err(Error::Config(format!(
                "pin_iterations {} exceeds the maximum of {MAX_PIN_ITERATIONS}",
                self.pin_iterations
            )));
        }
        if self.pin_iterations < MIN_PIN_ITERATIONS {
            if !self.allow_weak_kdf {
                return Err(Error::Config(format!(
                    "pin_iterations {} is below the minimum of {MIN_PIN_ITERATIONS}",
                    self.pin_iterations
                )));
            }
            warn!(
                pin_iterations = self.pin_iterations,
                "weak PIN key derivation enabled; never use this outside tests"
            );
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("database_path is empty".into()));
        }
        Ok(())
    }
}
