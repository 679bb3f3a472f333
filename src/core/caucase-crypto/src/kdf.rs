//! Key derivation (HKDF-SHA256, RFC 5869).

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::aead::KEY_SIZE;
use crate::error::CryptoError;

/// Derives `length` bytes of key material from `ikm`.
pub fn derive_key(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    length: usize,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if length == 0 || length > 255 * 32 {
        return Err(CryptoError::InvalidInput(format!(
            "unsupported HKDF-SHA256 output length {length}"
        )));
    }

    let mut okm = Zeroizing::new(vec![0u8; length]);
    Hkdf::<Sha256>::new(salt, ikm)
        .expand(info, &mut okm)
        .map_err(|_| CryptoError::InvalidInput("HKDF expansion failed".to_string()))?;
    Ok(okm)
}

/// Derives the AES-256 key-encryption key for one envelope recipient from an
/// ECDH shared secret, bound to the ephemeral public key that produced it.
pub fn derive_wrapping_key(
    shared_secret: &[u8],
    ephemeral_public_key: &[u8],
    context: &[u8],
) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let okm = derive_key(shared_secret, Some(ephemeral_public_key), context, KEY_SIZE)?;
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&okm);
    Ok(key)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_length_rejected() {
        assert!(derive_key(b"ikm", None, b"info", 0).is_err());
    }

    #[test]
    fn test_wrapping_key_depends_on_ephemeral_key() {
        let a = derive_wrapping_key(b"shared", b"eph-a", b"ctx").unwrap();
        let b = derive_wrapping_key(b"shared", b"eph-b", b"ctx").unwrap();
        assert_ne!(*a, *b);
    }

    #[test]
    fn test_hkdf_rfc5869_test_vector() {
        let ikm = hex::decode("0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b").unwrap();
        let salt = hex::decode("000102030405060708090a0b0c").unwrap();
        let info = hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap();

        let okm = derive_key(&ikm, Some(&salt), &info, 42).unwrap();

        let expected = hex::decode(
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865",
        )
        .unwrap();
        assert_eq!(&*okm, &expected);
    }
}
