use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD tag mismatch or malformed box. Deliberately carries no detail:
    /// a wrong key and corrupted data must look identical to the caller.
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid recovery key: {0}")]
    InvalidRecoveryKey(String),

    #[error("Platform randomness unavailable: {0}")]
    PlatformUnavailable(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
