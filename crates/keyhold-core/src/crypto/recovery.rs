//! Recovery keys
//!
//! A recovery key is 32 random bytes shown to the user once, at enrollment,
//! as uppercase hex in dash-separated groups of four:
//!
//!   "9F3A-0C7E-…-41D2"   (16 groups)
//!
//! It never touches the PIN: the bundle wrap key is derived from the raw bytes
//! with HKDF under its own label.

use std::fmt;

use zeroize::Zeroizing;

use crate::crypto::{
    error::CryptoError,
    kdf::{derive_subkey, LABEL_RECOVERY_WRAP},
    random::random_bytes,
};

pub const RECOVERY_KEY_LEN: usize = 32;
const GROUP_LEN: usize = 4;

/// Format bytes as dash-grouped uppercase hex.
pub fn format_recovery_key(bytes: &[u8]) -> String {
    let hex = Zeroizing::new(hex::encode_upper(bytes));
    hex.as_bytes()
        .chunks(GROUP_LEN)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}

/// Exact inverse of [`format_recovery_key`]. Accepts lowercase and
/// surrounding whitespace; rejects anything else.
pub fn parse_recovery_key(s: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(CryptoError::InvalidRecoveryKey("empty".into()));
    }

    let groups: Vec<&str> = trimmed.split('-').collect();
    let last = groups.len() - 1;
    for (i, group) in groups.iter().enumerate() {
        let len_ok = if i == last {
            (1..=GROUP_LEN).contains(&group.len())
        } else {
            group.len() == GROUP_LEN
        };
        if !len_ok {
            return Err(CryptoError::InvalidRecoveryKey(format!(
                "group {} has {} characters",
                i + 1,
                group.len()
            )));
        }
        if !group.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CryptoError::InvalidRecoveryKey(format!(
                "group {} is not hexadecimal",
                i + 1
            )));
        }
    }

    let mut joined = Zeroizing::new(groups.concat());
    joined.make_ascii_uppercase();
    let bytes = hex::decode(joined.as_str())
        .map_err(|e| CryptoError::InvalidRecoveryKey(e.to_string()))?;
    Ok(Zeroizing::new(bytes))
}

/// Freshly generated or parsed recovery key.
#[derive(Clone)]
pub struct RecoveryKey(Zeroizing<Vec<u8>>);

impl RecoveryKey {
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self(random_bytes(RECOVERY_KEY_LEN)?))
    }

    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        let bytes = parse_recovery_key(s)?;
        if bytes.len() != RECOVERY_KEY_LEN {
            return Err(CryptoError::InvalidRecoveryKey(format!(
                "expected {RECOVERY_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// The one-time display string.
    pub fn display_string(&self) -> Zeroizing<String> {
        Zeroizing::new(format_recovery_key(&self.0))
    }

    /// Bundle wrap key. Independent of any PIN-derived key.
    pub(crate) fn wrap_key(&self) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        derive_subkey(&self.0, LABEL_RECOVERY_WRAP)
    }
}

impl PartialEq for RecoveryKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .fold(0u8, |diff, (a, b)| diff | (a ^ b))
                == 0
    }
}

impl Eq for RecoveryKey {}

impl fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoveryKey(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn parse_inverts_format_for_generated_length(bytes in any::<[u8; 32]>()) {
            let formatted = format_recovery_key(&bytes);
            let parsed = parse_recovery_key(&formatted).unwrap();
            prop_assert_eq!(parsed.as_slice(), &bytes[..]);
        }

        #[test]
        fn parse_inverts_format_for_any_length(
            bytes in proptest::collection::vec(any::<u8>(), 1..64)
        ) {
            let parsed = parse_recovery_key(&format_recovery_key(&bytes)).unwrap();
            prop_assert_eq!(parsed.as_slice(), bytes.as_slice());
        }
    }

    #[test]
    fn format_shape() {
        let formatted = format_recovery_key(&[0xab; RECOVERY_KEY_LEN]);
        let groups: Vec<&str> = formatted.split('-').collect();
        assert_eq!(groups.len(), 16);
        assert!(groups.iter().all(|g| *g == "ABAB"));
    }

    #[test]
    fn lowercase_and_whitespace_accepted() {
        let key = RecoveryKey::generate().unwrap();
        let shown = key.display_string();
        let typed = format!("  {}\n", shown.to_lowercase());
        assert_eq!(RecoveryKey::parse(&typed).unwrap(), key);
    }

    #[test]
    fn malformed_input_rejected() {
        for bad in ["", "ABCD-EFGH", "ABC-DEF0", "ABCD--1234", "ABCD-1234-"] {
            assert!(
                matches!(parse_recovery_key(bad), Err(CryptoError::InvalidRecoveryKey(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn wrong_length_rejected_by_recovery_key() {
        let short = format_recovery_key(&[1u8; 16]);
        assert!(matches!(
            RecoveryKey::parse(&short),
            Err(CryptoError::InvalidRecoveryKey(_))
        ));
    }

    #[test]
    fn wrap_key_is_stable_for_the_same_recovery_key() {
        let key = RecoveryKey::generate().unwrap();
        let reparsed = RecoveryKey::parse(&key.display_string()).unwrap();
        assert_eq!(*key.wrap_key().unwrap(), *reparsed.wrap_key().unwrap());
    }

    #[test]
    fn debug_is_redacted() {
        let key = RecoveryKey::generate().unwrap();
        assert_eq!(format!("{key:?}"), "RecoveryKey(<redacted>)");
    }
}
