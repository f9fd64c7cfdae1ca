use thiserror::Error;

use crate::crypto::CryptoError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Corrupt row for user {user_id}: {reason}")]
    Corrupt { user_id: String, reason: String },

    #[error("Key custody error: {0}")]
    Custody(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl StoreError {
    pub(crate) fn corrupt(user_id: &str, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            user_id: user_id.to_owned(),
            reason: reason.into(),
        }
    }
}
