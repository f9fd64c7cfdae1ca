//! Remembered and wrapped bundles, plus the multi-table writes.

use chrono::Utc;
use tracing::info;

use crate::store::{
    db::IdentityStore,
    devices::upsert_device,
    error::StoreError,
    models::{DeviceRecord, EnrollmentWrite, RememberedBundle, RememberedRow, WrappedBundles},
};

impl IdentityStore {
    // ── Remembered bundle ────────────────────────────────────────────────────

    pub async fn get_remembered_bundle(
        &self,
        user_id: &str,
    ) -> Result<Option<RememberedBundle>, StoreError> {
        let row: Option<RememberedRow> = sqlx::query_as(
            "SELECT user_id, backup_key, bundle_json, created_at FROM bundles WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool().await?)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn set_remembered_bundle(&self, bundle: &RememberedBundle) -> Result<(), StoreError> {
        let mut conn = self.pool().await?.acquire().await?;
        upsert_remembered(&mut conn, bundle).await
    }

    pub async fn clear_remembered_bundle(&self, user_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM bundles WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool().await?)
            .await?;
        Ok(())
    }

    // ── Wrapped bundles ──────────────────────────────────────────────────────

    pub async fn get_wrapped_bundles(
        &self,
        user_id: &str,
    ) -> Result<Option<WrappedBundles>, StoreError> {
        let row = sqlx::query_as(
            "SELECT user_id, pin_bundle, recovery_bundle, updated_at \
             FROM wrapped_bundles WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool().await?)
        .await?;
        Ok(row)
    }

    pub async fn clear_wrapped_bundles(&self, user_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM wrapped_bundles WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool().await?)
            .await?;
        Ok(())
    }

    // ── Multi-table writes ───────────────────────────────────────────────────

    /// Persist device record, both wrapped bundles and (optionally) the
    /// remembered bundle. All or nothing.
    pub async fn commit_enrollment(&self, write: EnrollmentWrite<'_>) -> Result<(), StoreError> {
        let user_id = write.device.user_id.as_str();
        let uuid = match write.device.device_uuid {
            Some(uuid) => uuid,
            None => self.device_uuid(user_id).await,
        };
        let sealed = self.seal_private_key(write.device).await?;

        let mut tx = self.pool().await?.begin().await?;
        upsert_device(&mut tx, write.device, uuid, &sealed).await?;
        sqlx::query(
            "INSERT INTO wrapped_bundles (user_id, pin_bundle, recovery_bundle, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET \
               pin_bundle = excluded.pin_bundle, \
               recovery_bundle = excluded.recovery_bundle, \
               updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(write.pin_bundle)
        .bind(write.recovery_bundle)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        if let Some(remembered) = write.remembered {
            upsert_remembered(&mut tx, remembered).await?;
        }
        tx.commit().await?;

        info!(
            user_id,
            remembered = write.remembered.is_some(),
            "enrollment committed"
        );
        Ok(())
    }

    /// Replace the PIN bundle after a recovery. If the device row was lost
    /// in the meantime it is restored in the same transaction.
    pub async fn update_pin_bundle(
        &self,
        user_id: &str,
        pin_bundle: &str,
        restore_device: Option<&DeviceRecord>,
    ) -> Result<(), StoreError> {
        let restore = match restore_device {
            Some(record) => {
                let uuid = match record.device_uuid {
                    Some(uuid) => uuid,
                    None => self.device_uuid(user_id).await,
                };
                Some((record, uuid, self.seal_private_key(record).await?))
            }
            None => None,
        };

        let mut tx = self.pool().await?.begin().await?;
        let updated = sqlx::query(
            "UPDATE wrapped_bundles SET pin_bundle = ?, updated_at = ? WHERE user_id = ?",
        )
        .bind(pin_bundle)
        .bind(Utc::now())
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::corrupt(user_id, "no wrapped bundles to update"));
        }
        if let Some((record, uuid, sealed)) = &restore {
            upsert_device(&mut tx, record, *uuid, sealed).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Remove the identity held for `user_id`: device row, wrapped and
    /// remembered bundles in one transaction, then the storage key. The
    /// device uuid belongs to the installation and is kept.
    pub async fn sign_out(&self, user_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool().await?.begin().await?;
        for table in ["devices", "wrapped_bundles", "bundles"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE user_id = ?"))
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        self.forget_storage_key(user_id).await;
        info!(user_id, "local identity removed");
        Ok(())
    }
}

async fn upsert_remembered(
    conn: &mut sqlx::SqliteConnection,
    bundle: &RememberedBundle,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO bundles (user_id, backup_key, bundle_json, created_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(user_id) DO UPDATE SET \
           backup_key = excluded.backup_key, \
           bundle_json = excluded.bundle_json, \
           created_at = excluded.created_at",
    )
    .bind(&bundle.user_id)
    .bind(bundle.backup_key.as_str())
    .bind(&bundle.bundle_json)
    .bind(bundle.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyAgreementPair;
    use crate::store::test_store;
    use zeroize::Zeroizing;

    fn new_record(user_id: &str) -> DeviceRecord {
        DeviceRecord::new(user_id, KeyAgreementPair::generate().unwrap().into_private())
    }

    fn remembered(user_id: &str, tag: &str) -> RememberedBundle {
        RememberedBundle {
            user_id: user_id.into(),
            backup_key: Zeroizing::new(format!("key-{tag}")),
            bundle_json: format!("{{\"tag\":\"{tag}\"}}"),
            created_at: Utc::now(),
        }
    }

    async fn open_store(dir: &tempfile::TempDir) -> IdentityStore {
        let store = test_store(dir.path().join("identity.db"));
        store.open().await.unwrap();
        store
    }

    #[tokio::test]
    async fn remembered_bundle_lifecycle_is_independent_of_device() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.set_device(&new_record("u1")).await.unwrap();
        store.set_remembered_bundle(&remembered("u1", "a")).await.unwrap();

        store.clear_remembered_bundle("u1").await.unwrap();
        assert!(store.get_remembered_bundle("u1").await.unwrap().is_none());
        assert!(store.get_device("u1").await.unwrap().is_some());

        store.set_remembered_bundle(&remembered("u1", "b")).await.unwrap();
        store.clear_device("u1").await.unwrap();
        let kept = store.get_remembered_bundle("u1").await.unwrap().unwrap();
        assert_eq!(kept.bundle_json, "{\"tag\":\"b\"}");
        assert_eq!(kept.backup_key.as_str(), "key-b");
    }

    #[tokio::test]
    async fn commit_enrollment_writes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let record = new_record("u1");
        let remember = remembered("u1", "r");

        store
            .commit_enrollment(EnrollmentWrite {
                device: &record,
                pin_bundle: "pin",
                recovery_bundle: "recovery",
                remembered: Some(&remember),
            })
            .await
            .unwrap();

        let device = store.get_device("u1").await.unwrap().unwrap();
        assert_eq!(device.public_key, record.public_key);
        assert_eq!(device.device_uuid, Some(store.device_uuid("u1").await));
        let wrapped = store.get_wrapped_bundles("u1").await.unwrap().unwrap();
        assert_eq!(wrapped.pin_bundle, "pin");
        assert_eq!(wrapped.recovery_bundle, "recovery");
        assert!(store.get_remembered_bundle("u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_enrollment_leaves_no_partial_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        sqlx::query("DROP TABLE wrapped_bundles")
            .execute(&store.pool().await.unwrap())
            .await
            .unwrap();

        let record = new_record("u1");
        let remember = remembered("u1", "r");
        let result = store
            .commit_enrollment(EnrollmentWrite {
                device: &record,
                pin_bundle: "pin",
                recovery_bundle: "recovery",
                remembered: Some(&remember),
            })
            .await;

        assert!(matches!(result, Err(StoreError::Database(_))));
        assert!(store.get_device("u1").await.unwrap().is_none());
        assert!(store.get_remembered_bundle("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_pin_bundle_requires_existing_bundles() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let err = store.update_pin_bundle("u1", "pin", None).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn update_pin_bundle_restores_a_missing_device() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let record = new_record("u1");
        store
            .commit_enrollment(EnrollmentWrite {
                device: &record,
                pin_bundle: "old",
                recovery_bundle: "recovery",
                remembered: None,
            })
            .await
            .unwrap();
        store.clear_device("u1").await.unwrap();

        store
            .update_pin_bundle("u1", "new", Some(&record))
            .await
            .unwrap();

        let wrapped = store.get_wrapped_bundles("u1").await.unwrap().unwrap();
        assert_eq!(wrapped.pin_bundle, "new");
        assert_eq!(wrapped.recovery_bundle, "recovery");
        let device = store.get_device("u1").await.unwrap().unwrap();
        assert_eq!(device.public_key, record.public_key);
    }

    #[tokio::test]
    async fn sign_out_removes_the_identity_for_the_user_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        for user in ["u1", "u2"] {
            let record = new_record(user);
            let remember = remembered(user, user);
            store
                .commit_enrollment(EnrollmentWrite {
                    device: &record,
                    pin_bundle: "pin",
                    recovery_bundle: "recovery",
                    remembered: Some(&remember),
                })
                .await
                .unwrap();
        }
        let u1_uuid = store.device_uuid("u1").await;
        let u2_uuid = store.device_uuid("u2").await;

        store.sign_out("u1").await.unwrap();

        assert!(store.get_device("u1").await.unwrap().is_none());
        assert!(store.get_wrapped_bundles("u1").await.unwrap().is_none());
        assert!(store.get_remembered_bundle("u1").await.unwrap().is_none());
        // The installation's uuid outlives the identity.
        assert_eq!(store.device_uuid("u1").await, u1_uuid);

        assert!(store.get_device("u2").await.unwrap().is_some());
        assert_eq!(store.device_uuid("u2").await, u2_uuid);
    }
}
