use std::sync::Arc;

use keyhold_core::{
    crypto::{aead, KeyAgreementPair},
    store::{EphemeralCustody, DEFAULT_BUSY_TIMEOUT},
    Config, Error, IdentityStore, KeyCustody, PinVault, UserContext,
};

fn open_vault(dir: &tempfile::TempDir) -> PinVault {
    PinVault::from_config(&Config::for_testing(dir.path().join("identity.db"))).unwrap()
}

/// A vault whose storage keys outlive it, the way the OS keyring outlives
/// a process.
fn open_vault_with(dir: &tempfile::TempDir, custody: Arc<dyn KeyCustody>) -> PinVault {
    let config = Config::for_testing(dir.path().join("identity.db"));
    let store = IdentityStore::with_options(&config.database_path, DEFAULT_BUSY_TIMEOUT, custody);
    PinVault::new(store, &config).unwrap()
}

#[tokio::test]
async fn enroll_unlock_recover_and_reset_pin() {
    let dir = tempfile::tempdir().unwrap();
    let vault = open_vault(&dir);

    let outcome = vault.enable_with_pin("u1", "424242", true).await.unwrap();

    let device = vault.store().get_device("u1").await.unwrap().unwrap();
    assert_eq!(device.device_uuid, Some(outcome.device_uuid));
    assert_eq!(device.public_key, outcome.public_key);
    let remembered = vault.store().get_remembered_bundle("u1").await.unwrap().unwrap();
    assert_eq!(remembered.user_id, "u1");
    assert!(!remembered.bundle_json.is_empty());

    let recovery = outcome.recovery_key.display_string();
    assert_eq!(recovery.split('-').count(), 16);
    assert!(recovery
        .chars()
        .all(|c| c == '-' || c.is_ascii_digit() || c.is_ascii_uppercase()));

    let unlocked = vault.unlock_with_pin("u1", "424242").await.unwrap();
    assert_eq!(unlocked.public_key, outcome.public_key);

    let err = vault.unlock_with_pin("u1", "111111").await.unwrap_err();
    assert_eq!(err, Error::AuthenticationFailed);
    assert_eq!(err.user_message(UserContext::Unlock), "incorrect PIN");

    let recovered = vault.recover_with_key("u1", &recovery).await.unwrap();
    vault.set_new_pin(recovered, "999999").await.unwrap();

    let after = vault.unlock_with_pin("u1", "999999").await.unwrap();
    assert_eq!(after.public_key, outcome.public_key);
    assert_eq!(after.device_uuid, outcome.device_uuid);

    // Remembered device survives the PIN reset.
    let remembered = vault.unlock_remembered("u1").await.unwrap();
    assert_eq!(remembered.public_key, outcome.public_key);
}

#[tokio::test]
async fn identity_survives_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let custody = EphemeralCustody::shared();

    let outcome = {
        let vault = open_vault_with(&dir, custody.clone());
        let outcome = vault.enable_with_pin("u1", "424242", false).await.unwrap();
        vault.store().close().await;
        outcome
    };

    let vault = open_vault_with(&dir, custody);
    let device = vault.store().get_device("u1").await.unwrap().unwrap();
    assert_eq!(device.public_key, outcome.public_key);
    let unlocked = vault.unlock_with_pin("u1", "424242").await.unwrap();
    assert_eq!(unlocked.public_key, outcome.public_key);
    assert_eq!(vault.store().device_uuid("u1").await, outcome.device_uuid);
}

#[tokio::test]
async fn two_devices_exchange_a_message() {
    let alice_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();
    let alice_vault = open_vault(&alice_dir);
    let bob_vault = open_vault(&bob_dir);

    alice_vault.enable_with_pin("alice", "1234", false).await.unwrap();
    bob_vault.enable_with_pin("bob", "5678", false).await.unwrap();
    let alice = alice_vault.unlock_with_pin("alice", "1234").await.unwrap();
    let bob = bob_vault.unlock_with_pin("bob", "5678").await.unwrap();

    // Public keys travel through the directory service as base64.
    let to_bob = alice.session_key(&bob.public_key.to_base64()).unwrap();
    let to_alice = keyhold_core::derive_session_key_for_user(
        bob_vault.store(),
        "bob",
        &alice.public_key.to_base64(),
    )
    .await
    .unwrap();

    let sealed = to_bob.seal(b"meet at noon").unwrap();
    assert_eq!(to_alice.open(&sealed).unwrap().as_slice(), b"meet at noon");
    assert_eq!(to_bob.fingerprint(), to_alice.fingerprint());

    // Raw helpers agree with the session wrapper.
    let raw = aead::encrypt(to_bob.shared_key().as_bytes(), b"ping", b"ctx").unwrap();
    let opened = aead::decrypt(to_alice.shared_key().as_bytes(), &raw, b"ctx").unwrap();
    assert_eq!(opened.as_slice(), b"ping");

    let stranger = KeyAgreementPair::generate().unwrap();
    let other = alice.session_key(&stranger.public.to_base64()).unwrap();
    assert_ne!(other.fingerprint(), to_bob.fingerprint());
}

#[tokio::test]
async fn sign_out_then_enroll_issues_a_new_key_on_the_same_device() {
    let dir = tempfile::tempdir().unwrap();
    let vault = open_vault(&dir);

    let first = vault.enable_with_pin("u1", "424242", true).await.unwrap();
    vault.sign_out("u1").await.unwrap();
    assert!(!vault.is_enrolled("u1").await.unwrap());

    assert!(vault.store().get_remembered_bundle("u1").await.unwrap().is_none());

    let second = vault.enable_with_pin("u1", "424242", false).await.unwrap();
    assert_ne!(first.public_key, second.public_key);
    assert_eq!(first.device_uuid, second.device_uuid);
}
