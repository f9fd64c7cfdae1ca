//! Public error taxonomy.
//!
//! Module errors (`CryptoError`, `StoreError`) keep their detail for logs;
//! everything crossing the crate boundary is one of these kinds. The enum is
//! `Clone` so a single in-flight enrollment can hand the same failure to every
//! caller awaiting it.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Wrong PIN, wrong recovery key, or a corrupted/tampered bundle. The
    /// three cases are indistinguishable on purpose.
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("local storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("no device identity is enrolled for this user")]
    IdentityMissing,

    #[error("platform cryptography unavailable: {0}")]
    PlatformCryptoUnavailable(String),

    #[error("PIN must be {min} to {max} digits", min = crate::vault::PIN_MIN_LEN, max = crate::vault::PIN_MAX_LEN)]
    InvalidPin,

    #[error("recovery key is malformed")]
    InvalidRecoveryKey,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Another enrollment with a different PIN or remember choice is
    /// running for this user. Nothing was applied for this call.
    #[error("an enrollment is already in progress for this user")]
    EnrollmentInProgress,
}

/// Which flow a user-facing message is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserContext {
    Enrollment,
    Unlock,
    Recovery,
}

impl Error {
    /// The single generic message shown to an end user. Never includes
    /// internal detail.
    pub fn user_message(&self, context: UserContext) -> &'static str {
        match (context, self) {
            (UserContext::Unlock, Error::AuthenticationFailed | Error::InvalidPin) => {
                "incorrect PIN"
            }
            (UserContext::Unlock, Error::IdentityMissing) => "this device is not set up yet",
            (
                UserContext::Recovery,
                Error::AuthenticationFailed | Error::InvalidRecoveryKey | Error::IdentityMissing,
            ) => "unable to recover",
            (_, Error::InvalidPin) => "PIN must be 4 to 12 digits",
            (_, Error::EnrollmentInProgress) => "setup is already in progress, please wait",
            (UserContext::Enrollment, _) => "unable to enable encryption",
            _ => "something went wrong, please try again",
        }
    }

    /// Stable short name for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::AuthenticationFailed => "authentication_failed",
            Error::StorageUnavailable(_) => "storage_unavailable",
            Error::IdentityMissing => "identity_missing",
            Error::PlatformCryptoUnavailable(_) => "platform_crypto_unavailable",
            Error::InvalidPin => "invalid_pin",
            Error::InvalidRecoveryKey => "invalid_recovery_key",
            Error::InvalidKey(_) => "invalid_key",
            Error::Config(_) => "config",
            Error::EnrollmentInProgress => "enrollment_in_progress",
        }
    }
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AuthenticationFailed => Error::AuthenticationFailed,
            CryptoError::PlatformUnavailable(msg) => Error::PlatformCryptoUnavailable(msg),
            CryptoError::InvalidRecoveryKey(_) => Error::InvalidRecoveryKey,
            CryptoError::AeadEncrypt => Error::PlatformCryptoUnavailable(e.to_string()),
            CryptoError::KeyDerivation(_)
            | CryptoError::InvalidKey(_)
            | CryptoError::Serialisation(_)
            | CryptoError::Base64Decode(_) => Error::InvalidKey(e.to_string()),
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Crypto(inner) => inner.into(),
            other => Error::StorageUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlock_failures_share_one_message() {
        assert_eq!(
            Error::AuthenticationFailed.user_message(UserContext::Unlock),
            "incorrect PIN"
        );
        assert_eq!(
            Error::InvalidPin.user_message(UserContext::Unlock),
            "incorrect PIN"
        );
    }

    #[test]
    fn recovery_failures_share_one_message() {
        for e in [
            Error::AuthenticationFailed,
            Error::InvalidRecoveryKey,
            Error::IdentityMissing,
        ] {
            assert_eq!(e.user_message(UserContext::Recovery), "unable to recover");
        }
    }

    #[test]
    fn storage_detail_never_reaches_the_user() {
        let e = Error::StorageUnavailable("disk I/O error at /secret/path".into());
        for ctx in [UserContext::Enrollment, UserContext::Unlock, UserContext::Recovery] {
            assert!(!e.user_message(ctx).contains("/secret/path"));
        }
    }

    #[test]
    fn concurrent_enrollment_has_its_own_message() {
        let e = Error::EnrollmentInProgress;
        assert_eq!(e.kind(), "enrollment_in_progress");
        assert_ne!(
            e.user_message(UserContext::Enrollment),
            Error::AuthenticationFailed.user_message(UserContext::Enrollment)
        );
    }

    #[test]
    fn custody_failure_is_storage_unavailable() {
        let e: Error = StoreError::Custody("keyring locked".into()).into();
        assert!(matches!(e, Error::StorageUnavailable(_)));
    }

    #[test]
    fn crypto_auth_failure_keeps_its_kind() {
        let e: Error = CryptoError::AuthenticationFailed.into();
        assert_eq!(e, Error::AuthenticationFailed);
        assert_eq!(e.kind(), "authentication_failed");
    }
}
