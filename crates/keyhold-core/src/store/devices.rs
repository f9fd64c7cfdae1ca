//! Device records and the per-user device uuid.

use chrono::Utc;
use sqlx::SqliteConnection;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{aead, keys::SECRET_KEY_LEN, AeadBox, CryptoError};
use crate::store::{
    custody::StorageKey,
    db::IdentityStore,
    error::StoreError,
    models::{DeviceRecord, DeviceRow},
};

impl IdentityStore {
    /// The device uuid for `user_id`, created on first call and stable
    /// afterwards, including across sign-out.
    ///
    /// Storage failures are not fatal here: a fresh uuid is returned and a
    /// warning logged. The caller then gets a uuid that will not survive a
    /// restart, which only affects device labelling, never key material.
    pub async fn device_uuid(&self, user_id: &str) -> Uuid {
        match self.load_or_create_device_uuid(user_id).await {
            Ok(uuid) => uuid,
            Err(e) => {
                warn!(user_id, error = %e, "device uuid storage failed; using an ephemeral uuid");
                Uuid::new_v4()
            }
        }
    }

    async fn load_or_create_device_uuid(&self, user_id: &str) -> Result<Uuid, StoreError> {
        let pool = self.pool().await?;

        if let Some(existing) = select_device_uuid(&pool, user_id).await? {
            return Ok(existing);
        }

        // Two first callers may race; whoever inserts first wins and both
        // re-read the winner.
        sqlx::query(
            "INSERT INTO device_uuids (user_id, device_uuid, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(Uuid::new_v4().to_string())
        .bind(Utc::now())
        .execute(&pool)
        .await?;

        select_device_uuid(&pool, user_id)
            .await?
            .ok_or_else(|| StoreError::corrupt(user_id, "device uuid vanished after insert"))
    }

    /// Load the device record. Rows written before uuids were tracked get
    /// one here; rows still holding a plaintext private key are sealed.
    /// Both fixes are written back before the record is returned.
    pub async fn get_device(&self, user_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        let pool = self.pool().await?;
        let row: Option<DeviceRow> = sqlx::query_as(
            "SELECT user_id, device_id, device_uuid, public_key, private_key, created_at, updated_at \
             FROM devices WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let (secret, plaintext_row) = self.unseal_row(&row).await?;
        let mut record = DeviceRecord::try_from_row(&row, &secret)?;

        if plaintext_row {
            let sealed = self.seal_private_key(&record).await?;
            sqlx::query("UPDATE devices SET private_key = ? WHERE user_id = ?")
                .bind(&sealed)
                .bind(user_id)
                .execute(&pool)
                .await?;
            info!(user_id, "sealed plaintext private key on legacy device row");
        }

        if record.device_uuid.is_none() {
            let uuid = self.device_uuid(user_id).await;
            sqlx::query(
                "UPDATE devices SET device_uuid = ? WHERE user_id = ? AND device_uuid IS NULL",
            )
            .bind(uuid.to_string())
            .bind(user_id)
            .execute(&pool)
            .await?;
            info!(user_id, device_uuid = %uuid, "backfilled device uuid on legacy device row");
            record.device_uuid = Some(uuid);
        }

        Ok(Some(record))
    }

    /// Insert or replace the device record. Returns the uuid written, which is
    /// the record's own or, when it has none, the user's stored device uuid.
    pub async fn set_device(&self, record: &DeviceRecord) -> Result<Uuid, StoreError> {
        let uuid = match record.device_uuid {
            Some(uuid) => uuid,
            None => self.device_uuid(&record.user_id).await,
        };
        let sealed = self.seal_private_key(record).await?;
        let mut conn = self.pool().await?.acquire().await?;
        upsert_device(&mut conn, record, uuid, &sealed).await?;
        Ok(uuid)
    }

    /// Hard delete of the device record and its storage key.
    pub async fn clear_device(&self, user_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM devices WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool().await?)
            .await?;
        self.forget_storage_key(user_id).await;
        Ok(())
    }

    /// Seal the record's private key under the user's storage key, creating
    /// the key on first use.
    pub(crate) async fn seal_private_key(&self, record: &DeviceRecord) -> Result<Vec<u8>, StoreError> {
        let owned_user = record.user_id.clone();
        let key = self
            .custody(move |custody| custody.load_or_create(&owned_user))
            .await?;
        seal_secret(&key, record)
    }

    /// Drop the storage key after its row is gone. The row no longer
    /// exists, so a failure only leaves an orphaned key behind.
    pub(crate) async fn forget_storage_key(&self, user_id: &str) {
        let owned_user = user_id.to_owned();
        if let Err(e) = self.custody(move |custody| custody.delete(&owned_user)).await {
            warn!(user_id, error = %e, "could not delete storage key");
        }
    }

    /// The row's private key in the clear, and whether the row stored it
    /// that way.
    async fn unseal_row(&self, row: &DeviceRow) -> Result<(Zeroizing<Vec<u8>>, bool), StoreError> {
        if row.private_key.len() == SECRET_KEY_LEN {
            return Ok((Zeroizing::new(row.private_key.clone()), true));
        }
        let sealed: AeadBox = serde_json::from_slice(&row.private_key)
            .map_err(|_| StoreError::corrupt(&row.user_id, "private key is neither sealed nor raw"))?;

        let owned_user = row.user_id.clone();
        let key = self
            .custody(move |custody| custody.load(&owned_user))
            .await?
            .ok_or_else(|| StoreError::corrupt(&row.user_id, "storage key missing from custody"))?;
        let secret = aead::decrypt(&key, &sealed, private_key_aad(&row.user_id).as_bytes())
            .map_err(|_| StoreError::corrupt(&row.user_id, "private key does not open under the storage key"))?;
        Ok((secret, false))
    }
}

fn private_key_aad(user_id: &str) -> String {
    format!("keyhold:device-key:v1:{user_id}")
}

fn seal_secret(key: &StorageKey, record: &DeviceRecord) -> Result<Vec<u8>, StoreError> {
    let secret = record.private_key_bytes();
    let sealed = aead::encrypt(key, &secret[..], private_key_aad(&record.user_id).as_bytes())?;
    Ok(serde_json::to_vec(&sealed).map_err(CryptoError::from)?)
}

async fn select_device_uuid(
    pool: &sqlx::SqlitePool,
    user_id: &str,
) -> Result<Option<Uuid>, StoreError> {
    let stored: Option<String> =
        sqlx::query_scalar("SELECT device_uuid FROM device_uuids WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
    stored
        .map(|s| {
            Uuid::parse_str(&s)
                .map_err(|e| StoreError::corrupt(user_id, format!("device uuid: {e}")))
        })
        .transpose()
}

/// `sealed` comes from [`IdentityStore::seal_private_key`]; custody calls
/// cannot run inside the caller's transaction.
pub(crate) async fn upsert_device(
    conn: &mut SqliteConnection,
    record: &DeviceRecord,
    device_uuid: Uuid,
    sealed: &[u8],
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO devices \
         (user_id, device_id, device_uuid, public_key, private_key, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(user_id) DO UPDATE SET \
           device_id = excluded.device_id, \
           device_uuid = excluded.device_uuid, \
           public_key = excluded.public_key, \
           private_key = excluded.private_key, \
           updated_at = excluded.updated_at",
    )
    .bind(&record.user_id)
    .bind(&record.device_id)
    .bind(device_uuid.to_string())
    .bind(record.public_key.to_base64())
    .bind(sealed)
    .bind(record.created_at)
    .bind(Utc::now())
    .execute(conn)
    .await?;
    Ok(())
}
