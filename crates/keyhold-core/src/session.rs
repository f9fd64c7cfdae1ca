//! Pairwise session keys
//!
//! Derived on demand from the local device key and a peer's public key. No
//! caching and no persistence: call again per conversation.

use zeroize::Zeroizing;

use crate::crypto::{kdf::LABEL_PAIRWISE, AeadBox, PrivateKeyHandle, PublicKey, SharedKey};
use crate::error::Error;
use crate::store::{DeviceRecord, IdentityStore};

/// Shared key bound to one (local, peer) pair. Messages sealed with it carry
/// both public keys as associated data, so a box cannot be replayed into a
/// different conversation that happens to share a key.
#[derive(Debug)]
pub struct SessionKey {
    key: SharedKey,
    aad: Vec<u8>,
}

impl SessionKey {
    fn new(key: SharedKey, local: PublicKey, peer: PublicKey) -> Self {
        let (first, second) = if local <= peer { (local, peer) } else { (peer, local) };
        let mut aad = Vec::with_capacity(LABEL_PAIRWISE.len() + 64);
        aad.extend_from_slice(LABEL_PAIRWISE);
        aad.extend_from_slice(first.as_bytes());
        aad.extend_from_slice(second.as_bytes());
        Self { key, aad }
    }

    pub fn shared_key(&self) -> &SharedKey {
        &self.key
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<AeadBox, Error> {
        Ok(self.key.seal(plaintext, &self.aad)?)
    }

    pub fn open(&self, sealed: &AeadBox) -> Result<Zeroizing<Vec<u8>>, Error> {
        Ok(self.key.open(sealed, &self.aad)?)
    }

    pub fn fingerprint(&self) -> String {
        self.key.fingerprint()
    }
}

/// Session key between the device in `record` and the peer.
pub fn derive_session_key(record: &DeviceRecord, peer_public_b64: &str) -> Result<SessionKey, Error> {
    derive_from_handle(record.private_key(), peer_public_b64)
}

/// As [`derive_session_key`], loading the device record first.
pub async fn derive_session_key_for_user(
    store: &IdentityStore,
    user_id: &str,
    peer_public_b64: &str,
) -> Result<SessionKey, Error> {
    let record = store
        .get_device(user_id)
        .await?
        .ok_or(Error::IdentityMissing)?;
    derive_session_key(&record, peer_public_b64)
}

pub(crate) fn derive_from_handle(
    local: &PrivateKeyHandle,
    peer_public_b64: &str,
) -> Result<SessionKey, Error> {
    let peer = PublicKey::from_base64(peer_public_b64)
        .map_err(|e| Error::InvalidKey(format!("peer public key: {e}")))?;
    let key = local.derive_shared_key(&peer)?;
    Ok(SessionKey::new(key, local.public_key(), peer))
}
