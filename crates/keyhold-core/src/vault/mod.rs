//! PIN vault
//!
//! Turns a short PIN into protection for the device identity:
//!
//! - `enable_with_pin`   — derive the PIN key, load or create the X25519 pair,
//!                          seal it under the PIN and a fresh recovery key,
//!                          persist atomically
//! - `unlock_with_pin`   — re-derive the PIN key and open the PIN bundle
//! - `unlock_remembered` — open the remembered-device bundle, no PIN
//! - `recover_with_key`  — open the recovery bundle, then `set_new_pin`
//!
//! There is no PIN hash anywhere: the AEAD tag on the PIN bundle is the only
//! check. A wrong PIN, a wrong recovery key and a damaged bundle all surface
//! as [`Error::AuthenticationFailed`], and every PIN attempt costs the same
//! PBKDF2 work whether or not the stored bundle could be parsed.

mod bundle;
mod inflight;
mod state;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::Config;
use crate::crypto::{
    kdf::{self, PinKey, LABEL_REMEMBERED_WRAP, MAX_PIN_ITERATIONS, SALT_LEN},
    random::{random_array, random_bytes},
    CryptoError, KeyAgreementPair, PrivateKeyHandle, PublicKey, RecoveryKey,
};
use crate::error::Error;
use crate::session::{self, SessionKey};
use crate::store::{DeviceRecord, EnrollmentWrite, IdentityStore, RememberedBundle, StoreError};

pub use bundle::{EncryptedBundle, Wrapping, BUNDLE_VERSION};
pub use state::EnrollmentState;

use bundle::BundlePayload;
use inflight::SingleFlight;
use state::Machine;

pub const PIN_MIN_LEN: usize = 4;
pub const PIN_MAX_LEN: usize = 12;
const REMEMBERED_KEY_LEN: usize = 32;

/// 4 to 12 ASCII digits.
pub fn validate_pin(pin: &str) -> Result<(), Error> {
    let len_ok = (PIN_MIN_LEN..=PIN_MAX_LEN).contains(&pin.len());
    if len_ok && pin.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(Error::InvalidPin)
    }
}

/// Result of a successful enrollment. The recovery key is here exactly once;
/// nothing persists it in the clear.
#[derive(Debug, Clone)]
pub struct EnrollmentOutcome {
    pub user_id: String,
    pub device_uuid: Uuid,
    pub public_key: PublicKey,
    pub recovery_key: RecoveryKey,
    pub pin_bundle: EncryptedBundle,
    pub recovery_bundle: EncryptedBundle,
    pub remembered: bool,
    pub state: EnrollmentState,
}

/// A device identity opened by PIN, recovery key or remembered bundle.
#[derive(Debug)]
pub struct UnlockedIdentity {
    pub user_id: String,
    pub device_id: String,
    pub device_uuid: Uuid,
    pub public_key: PublicKey,
    private_key: PrivateKeyHandle,
}

impl UnlockedIdentity {
    fn from_record(record: DeviceRecord, device_uuid: Uuid) -> Self {
        Self {
            user_id: record.user_id.clone(),
            device_id: record.device_id.clone(),
            device_uuid,
            public_key: record.public_key,
            private_key: record.into_private_key(),
        }
    }

    pub fn private_key(&self) -> &PrivateKeyHandle {
        &self.private_key
    }

    /// Pairwise key with the peer whose base64 public key is given.
    pub fn session_key(&self, peer_public_b64: &str) -> Result<SessionKey, Error> {
        session::derive_from_handle(&self.private_key, peer_public_b64)
    }
}

/// Identity opened with the recovery key, waiting for a new PIN.
#[derive(Debug)]
pub struct RecoveredIdentity {
    identity: UnlockedIdentity,
    created_at: chrono::DateTime<Utc>,
}

impl RecoveredIdentity {
    pub fn identity(&self) -> &UnlockedIdentity {
        &self.identity
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }
}

type EnrollmentResult = Result<EnrollmentOutcome, Error>;

/// Cheap to clone (Arc internally).
#[derive(Clone)]
pub struct PinVault {
    inner: Arc<VaultInner>,
}

struct VaultInner {
    store: IdentityStore,
    pin_iterations: u32,
    /// Keyed digests of (pin, remember) identify an enrollment request
    /// without holding the PIN in the single-flight table.
    request_key: [u8; 32],
    enrollments: SingleFlight<blake3::Hash, EnrollmentResult>,
    /// Highest iteration count read from a stored PIN bundle so far. A PIN
    /// attempt never costs less than this or the configured count.
    cost_floor: AtomicU32,
    /// Total PBKDF2 iterations run by this vault.
    kdf_work: AtomicU64,
}

impl PinVault {
    pub fn new(store: IdentityStore, config: &Config) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(VaultInner {
                store,
                pin_iterations: config.pin_iterations,
                request_key: random_array()?,
                enrollments: SingleFlight::new(),
                cost_floor: AtomicU32::new(0),
                kdf_work: AtomicU64::new(0),
            }),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::new(IdentityStore::from_config(config), config)
    }

    pub fn store(&self) -> &IdentityStore {
        &self.inner.store
    }

    // ── Enrollment ───────────────────────────────────────────────────────────

    /// Enroll (or re-enroll) `user_id` under `pin`.
    ///
    /// Re-enrollment keeps the existing key pair and PIN salt and issues a
    /// new recovery key. Concurrent calls for the same user with the same PIN
    /// and `remember` share the first call's run and its outcome; a
    /// concurrent call asking for something else gets
    /// [`Error::EnrollmentInProgress`]. With `remember == false` an existing
    /// remembered bundle is left as it is.
    pub async fn enable_with_pin(
        &self,
        user_id: &str,
        pin: &str,
        remember: bool,
    ) -> EnrollmentResult {
        validate_pin(pin)?;
        let inner = Arc::clone(&self.inner);
        let owned_user = user_id.to_owned();
        let request = blake3::Hasher::new_keyed(&self.inner.request_key)
            .update(pin.as_bytes())
            .update(&[u8::from(remember)])
            .finalize();
        let pin = Zeroizing::new(pin.to_owned());
        self.inner
            .enrollments
            .run(user_id, request, move || async move {
                let mut machine = Machine::new(&owned_user);
                let result = enroll(&inner, &mut machine, &owned_user, pin, remember).await;
                if let Err(e) = &result {
                    machine.fail(e);
                }
                result
            })
            .await
            .unwrap_or_else(|| {
                info!(user_id, "enrollment with different parameters already running");
                Err(Error::EnrollmentInProgress)
            })
    }

    // ── Unlock ───────────────────────────────────────────────────────────────

    pub async fn unlock_with_pin(&self, user_id: &str, pin: &str) -> Result<UnlockedIdentity, Error> {
        validate_pin(pin)?;
        let store = &self.inner.store;
        let bundles = store
            .get_wrapped_bundles(user_id)
            .await?
            .ok_or(Error::IdentityMissing)?;

        let parsed = EncryptedBundle::from_json(&bundles.pin_bundle)
            .ok()
            .and_then(|b| b.pin_params().map(|params| (b, params)))
            .filter(|(_, (salt, iterations))| {
                salt.len() == SALT_LEN && (1..=MAX_PIN_ITERATIONS).contains(iterations)
            });

        let pin = Zeroizing::new(pin.to_owned());
        let cost = self.inner.attempt_cost(parsed.as_ref().map(|(_, (_, n))| *n));
        let Some((bundle, (salt, iterations))) = parsed else {
            warn!(user_id, "stored PIN bundle is malformed");
            let _ = self
                .inner
                .derive_pin_key(pin, vec![0u8; SALT_LEN], cost, cost)
                .await;
            return Err(Error::AuthenticationFailed);
        };

        let key = self.inner.derive_pin_key(pin, salt, iterations, cost).await?;
        let payload = bundle.open(user_id, key.as_bytes()).map_err(|e| {
            info!(user_id, "PIN unlock rejected");
            Error::from(e)
        })?;
        let identity = self.identity_from_payload(&payload).await?;
        info!(user_id, "unlocked with PIN");
        Ok(identity)
    }

    pub async fn unlock_remembered(&self, user_id: &str) -> Result<UnlockedIdentity, Error> {
        let remembered = self
            .inner
            .store
            .get_remembered_bundle(user_id)
            .await?
            .ok_or(Error::IdentityMissing)?;

        let backup_key = Zeroizing::new(
            URL_SAFE_NO_PAD
                .decode(remembered.backup_key.as_bytes())
                .map_err(|_| Error::AuthenticationFailed)?,
        );
        let wrap_key = kdf::derive_subkey(&backup_key, LABEL_REMEMBERED_WRAP)?;
        let bundle = EncryptedBundle::from_json(&remembered.bundle_json)
            .map_err(|_| Error::AuthenticationFailed)?;
        if bundle.wrapping != Wrapping::Remembered {
            return Err(Error::AuthenticationFailed);
        }
        let payload = bundle.open(user_id, &wrap_key)?;
        let identity = self.identity_from_payload(&payload).await?;
        info!(user_id, "unlocked with remembered device");
        Ok(identity)
    }

    // ── Recovery ─────────────────────────────────────────────────────────────

    /// Open the recovery bundle. Follow with [`PinVault::set_new_pin`].
    pub async fn recover_with_key(
        &self,
        user_id: &str,
        recovery_key: &str,
    ) -> Result<RecoveredIdentity, Error> {
        let recovery_key = RecoveryKey::parse(recovery_key)?;
        let bundles = self
            .inner
            .store
            .get_wrapped_bundles(user_id)
            .await?
            .ok_or(Error::IdentityMissing)?;

        let bundle = EncryptedBundle::from_json(&bundles.recovery_bundle)
            .map_err(|_| Error::AuthenticationFailed)?;
        if bundle.wrapping != Wrapping::RecoveryKey {
            return Err(Error::AuthenticationFailed);
        }
        let payload = bundle
            .open(user_id, &*recovery_key.wrap_key()?)
            .map_err(|e| {
                info!(user_id, "recovery key rejected");
                Error::from(e)
            })?;

        let record = payload.device_record()?;
        info!(user_id, "identity recovered");
        Ok(RecoveredIdentity {
            identity: UnlockedIdentity::from_record(record, payload.device_uuid),
            created_at: payload.created_at,
        })
    }

    /// Re-wrap a recovered identity under `new_pin`. Key material is not
    /// rotated; the recovery key stays valid.
    pub async fn set_new_pin(
        &self,
        recovered: RecoveredIdentity,
        new_pin: &str,
    ) -> Result<UnlockedIdentity, Error> {
        validate_pin(new_pin)?;
        let store = &self.inner.store;
        let RecoveredIdentity {
            identity,
            created_at,
        } = recovered;
        let user_id = identity.user_id.clone();
        let device_uuid = identity.device_uuid;

        let mut record = DeviceRecord::new(user_id.clone(), identity.private_key)
            .with_device_uuid(device_uuid);
        record.created_at = created_at;

        let salt = kdf::generate_salt()?;
        let iterations = self.inner.pin_iterations;
        let key = self
            .inner
            .derive_pin_key(Zeroizing::new(new_pin.to_owned()), salt.to_vec(), iterations, iterations)
            .await?;
        let payload = BundlePayload::new(&record, device_uuid, &salt, iterations);
        let pin_bundle = payload
            .seal(Wrapping::pbkdf2(&salt, iterations), key.as_bytes())?
            .to_json()?;

        let restore = match store.get_device(&user_id).await {
            Ok(existing) => existing.is_none(),
            Err(StoreError::Corrupt { reason, .. }) => {
                warn!(user_id = %user_id, reason, "device row unreadable; rewriting it from the recovered identity");
                true
            }
            Err(e) => return Err(e.into()),
        };
        store
            .update_pin_bundle(&user_id, &pin_bundle, restore.then_some(&record))
            .await?;
        info!(user_id = %user_id, restored_device = restore, "PIN reset after recovery");
        Ok(UnlockedIdentity::from_record(record, device_uuid))
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Drop the remembered bundle; the PIN and recovery key keep working.
    pub async fn forget_device(&self, user_id: &str) -> Result<(), Error> {
        self.inner.store.clear_remembered_bundle(user_id).await?;
        info!(user_id, "remembered device forgotten");
        Ok(())
    }

    /// Remove the identity of `user_id` from this device. The device uuid
    /// is kept.
    pub async fn sign_out(&self, user_id: &str) -> Result<(), Error> {
        self.inner.store.sign_out(user_id).await?;
        Ok(())
    }

    pub async fn is_enrolled(&self, user_id: &str) -> Result<bool, Error> {
        Ok(self
            .inner
            .store
            .get_wrapped_bundles(user_id)
            .await?
            .is_some())
    }

    /// Build the unlocked identity, restoring the device row if it has gone
    /// missing since the bundle was written or can no longer be unsealed
    /// (storage key lost from custody).
    async fn identity_from_payload(&self, payload: &BundlePayload) -> Result<UnlockedIdentity, Error> {
        let store = &self.inner.store;
        let record = payload.device_record()?;
        let stored = match store.get_device(&payload.user_id).await {
            Ok(stored) => stored,
            Err(StoreError::Corrupt { reason, .. }) => {
                warn!(user_id = %payload.user_id, reason, "device row unreadable; rewriting it from the bundle");
                None
            }
            Err(e) => return Err(e.into()),
        };
        let device_uuid = match stored {
            Some(stored) if stored.public_key == record.public_key => {
                stored.device_uuid.unwrap_or(payload.device_uuid)
            }
            Some(_) => {
                warn!(user_id = %payload.user_id, "device row key differs from bundle; using the bundle identity");
                payload.device_uuid
            }
            None => {
                store.set_device(&record).await?;
                info!(user_id = %payload.user_id, "restored device row from bundle");
                payload.device_uuid
            }
        };
        Ok(UnlockedIdentity::from_record(record, device_uuid))
    }
}

async fn enroll(
    inner: &VaultInner,
    machine: &mut Machine<'_>,
    user_id: &str,
    pin: Zeroizing<String>,
    remember: bool,
) -> EnrollmentResult {
    let store = &inner.store;

    // Reuse the salt of an existing PIN bundle; otherwise a fresh one.
    let existing_salt = store
        .get_wrapped_bundles(user_id)
        .await?
        .and_then(|b| EncryptedBundle::from_json(&b.pin_bundle).ok())
        .and_then(|b| b.pin_params())
        .map(|(salt, _)| salt)
        .filter(|salt| salt.len() == SALT_LEN);
    let salt = match existing_salt {
        Some(salt) => salt,
        None => kdf::generate_salt()?.to_vec(),
    };
    let iterations = inner.pin_iterations;

    machine.advance(EnrollmentState::DerivingKey);
    let pin_key = inner
        .derive_pin_key(pin, salt.clone(), iterations, iterations)
        .await?;

    let record = match store.get_device(user_id).await? {
        Some(existing) => existing,
        None => {
            let pair = KeyAgreementPair::generate()?;
            let uuid = store.device_uuid(user_id).await;
            DeviceRecord::new(user_id, pair.into_private()).with_device_uuid(uuid)
        }
    };
    let device_uuid = match record.device_uuid {
        Some(uuid) => uuid,
        None => store.device_uuid(user_id).await,
    };
    machine.advance(EnrollmentState::IdentityReady);

    let payload = BundlePayload::new(&record, device_uuid, &salt, iterations);
    let pin_bundle = payload.seal(Wrapping::pbkdf2(&salt, iterations), pin_key.as_bytes())?;
    let recovery_key = RecoveryKey::generate()?;
    let recovery_bundle = payload.seal(Wrapping::RecoveryKey, &*recovery_key.wrap_key()?)?;
    let remembered = if remember {
        let backup_key = random_bytes(REMEMBERED_KEY_LEN)?;
        let wrap_key = kdf::derive_subkey(&backup_key, LABEL_REMEMBERED_WRAP)?;
        Some(RememberedBundle {
            user_id: user_id.to_owned(),
            backup_key: Zeroizing::new(URL_SAFE_NO_PAD.encode(&backup_key[..])),
            bundle_json: payload.seal(Wrapping::Remembered, &wrap_key)?.to_json()?,
            created_at: Utc::now(),
        })
    } else {
        None
    };
    machine.advance(EnrollmentState::BundleWrapped);

    let pin_json = pin_bundle.to_json()?;
    let recovery_json = recovery_bundle.to_json()?;
    store
        .commit_enrollment(EnrollmentWrite {
            device: &record,
            pin_bundle: &pin_json,
            recovery_bundle: &recovery_json,
            remembered: remembered.as_ref(),
        })
        .await?;
    machine.advance(EnrollmentState::Enrolled);

    info!(user_id, device_uuid = %device_uuid, remember, "device enrolled");
    Ok(EnrollmentOutcome {
        user_id: user_id.to_owned(),
        device_uuid,
        public_key: record.public_key,
        recovery_key,
        pin_bundle,
        recovery_bundle,
        remembered: remember,
        state: machine.state(),
    })
}

impl VaultInner {
    /// PBKDF2 work a PIN attempt must spend: the larger of the configured
    /// count and every stored count seen so far. An attempt against an
    /// unparseable bundle passes `None` and still pays the same.
    fn attempt_cost(&self, stored: Option<u32>) -> u32 {
        let floor = match stored {
            Some(n) => self.cost_floor.fetch_max(n, Ordering::Relaxed).max(n),
            None => self.cost_floor.load(Ordering::Relaxed),
        };
        floor.max(self.pin_iterations)
    }

    /// PBKDF2 off the async workers. When `cost` exceeds `iterations` the
    /// difference is burned on a throwaway derivation.
    async fn derive_pin_key(
        &self,
        pin: Zeroizing<String>,
        salt: Vec<u8>,
        iterations: u32,
        cost: u32,
    ) -> Result<PinKey, Error> {
        let padding = cost.saturating_sub(iterations);
        self.kdf_work
            .fetch_add(u64::from(iterations) + u64::from(padding), Ordering::Relaxed);
        tokio::task::spawn_blocking(move || {
            let key = kdf::derive_pin_key(&pin, &salt, iterations)?;
            if padding > 0 {
                kdf::derive_pin_key(&pin, &[0u8; SALT_LEN], padding)?;
            }
            Ok::<_, CryptoError>(key)
        })
        .await
        .map_err(|e| Error::PlatformCryptoUnavailable(format!("key derivation task failed: {e}")))?
        .map_err(Error::from)
    }
}
