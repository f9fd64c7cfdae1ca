//! OS-backed randomness.
//!
//! Every key, salt, nonce and uuid-independent secret in the crate comes from
//! here so that an unavailable platform RNG surfaces as a typed error instead
//! of a panic inside a dependency.

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::error::CryptoError;

/// `n` bytes from the operating system CSPRNG.
pub fn random_bytes(n: usize) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let mut out = Zeroizing::new(vec![0u8; n]);
    OsRng
        .try_fill_bytes(out.as_mut_slice())
        .map_err(|e| CryptoError::PlatformUnavailable(e.to_string()))?;
    Ok(out)
}

/// Fixed-size variant of [`random_bytes`] for keys, salts and nonces.
pub fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut out = [0u8; N];
    OsRng
        .try_fill_bytes(&mut out)
        .map_err(|e| CryptoError::PlatformUnavailable(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_requested_length() {
        assert_eq!(random_bytes(0).unwrap().len(), 0);
        assert_eq!(random_bytes(48).unwrap().len(), 48);
    }

    #[test]
    fn consecutive_draws_differ() {
        let a: [u8; 32] = random_array().unwrap();
        let b: [u8; 32] = random_array().unwrap();
        assert_ne!(a, b);
    }
}
