//! Randomness, always drawn from the OS generator.

use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::aead::{KEY_SIZE, NONCE_SIZE};

fn fill<const N: usize>(buf: &mut [u8; N]) {
    OsRng.fill_bytes(buf);
}

/// A fresh AES-256 key.
pub fn generate_key() -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    fill(&mut *key);
    key
}

/// A fresh GCM nonce. Never reuse one under the same key.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    fill(&mut nonce);
    nonce
}
