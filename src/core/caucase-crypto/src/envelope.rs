//! Multi-recipient backup envelopes.
//!
//! One random data key encrypts the payload once; the data key is then
//! wrapped separately for every recipient with ECIES (ephemeral P-256 ECDH,
//! HKDF-SHA256, AES-256-GCM). Any single recipient private key opens it.
//!
//! ## Format
//!
//! ```text
//! MAGIC || header length (u32, big endian) || header JSON || AES-256-GCM(payload)
//! ```
//!
//! The header is authenticated as associated data of the payload encryption,
//! so recipient entries cannot be swapped or stripped unnoticed.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use p256::ecdh::{diffie_hellman, EphemeralSecret};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::aead;
use crate::error::CryptoError;
use crate::kdf::derive_wrapping_key;
use crate::keys::{DataKey, PrivateKey, PublicKey};

/// Leading bytes of every envelope.
pub const MAGIC: &[u8] = b"CAUCASE-BACKUP\x01";

const WRAP_CONTEXT: &[u8] = b"caucase-backup-v1";
const PAYLOAD_CIPHER: &str = "aes-256-gcm";

/// A party able to open the envelope.
#[derive(Debug, Clone)]
pub struct Recipient {
    /// Serial of the certificate the public key was taken from.
    pub serial: u64,
    /// Recipient public key.
    pub public_key: PublicKey,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    cipher: String,
    recipients: Vec<RecipientEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecipientEntry {
    serial: u64,
    key_id: String,
    ephemeral_public_key: String,
    wrapped_key: String,
}

/// Encrypts `payload` so that any one of `recipients` can decrypt it.
pub fn seal_envelope(payload: &[u8], recipients: &[Recipient]) -> Result<Vec<u8>, CryptoError> {
    if recipients.is_empty() {
        return Err(CryptoError::InvalidInput(
            "an envelope needs at least one recipient".to_string(),
        ));
    }

    let data_key = DataKey::generate();
    let mut entries = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        let key_id = recipient.public_key.key_id()?;
        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let ephemeral_public = PublicKey::from_sec1(&ephemeral.public_key().to_sec1_bytes())?;
        let ephemeral_sec1 = ephemeral_public.to_sec1();

        let shared = ephemeral.diffie_hellman(recipient.public_key.as_p256());
        let kek = derive_wrapping_key(
            shared.raw_secret_bytes().as_slice(),
            &ephemeral_sec1,
            WRAP_CONTEXT,
        )?;
        let wrapped = aead::encrypt(&*kek, data_key.as_bytes(), key_id.as_bytes())?;

        entries.push(RecipientEntry {
            serial: recipient.serial,
            key_id,
            ephemeral_public_key: BASE64.encode(ephemeral_sec1),
            wrapped_key: BASE64.encode(wrapped),
        });
    }

    let header = serde_json::to_vec(&Header {
        cipher: PAYLOAD_CIPHER.to_string(),
        recipients: entries,
    })
    .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    let header_len = u32::try_from(header.len())
        .map_err(|_| CryptoError::InvalidInput("too many recipients".to_string()))?;

    let body = aead::encrypt(data_key.as_bytes(), payload, &header)?;

    let mut envelope = Vec::with_capacity(MAGIC.len() + 4 + header.len() + body.len());
    envelope.extend_from_slice(MAGIC);
    envelope.extend_from_slice(&header_len.to_be_bytes());
    envelope.extend_from_slice(&header);
    envelope.extend_from_slice(&body);
    Ok(envelope)
}

/// Decrypts an envelope with one recipient's private key.
pub fn open_envelope(envelope: &[u8], key: &PrivateKey) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let (header_bytes, header, body) = split(envelope)?;

    let key_id = key.public_key().key_id()?;
    let entry = header
        .recipients
        .iter()
        .find(|entry| entry.key_id == key_id)
        .ok_or_else(|| CryptoError::NotARecipient(key_id.clone()))?;

    let ephemeral_sec1 = decode_b64(&entry.ephemeral_public_key)?;
    let ephemeral = PublicKey::from_sec1(&ephemeral_sec1)?;
    let shared = diffie_hellman(
        key.as_p256().to_nonzero_scalar(),
        ephemeral.as_p256().as_affine(),
    );
    let kek = derive_wrapping_key(
        shared.raw_secret_bytes().as_slice(),
        &ephemeral_sec1,
        WRAP_CONTEXT,
    )?;
    let data_key = DataKey::from_bytes(&aead::decrypt(
        &*kek,
        &decode_b64(&entry.wrapped_key)?,
        key_id.as_bytes(),
    )?)?;

    aead::decrypt(data_key.as_bytes(), body, header_bytes)
}

/// Lists the certificate serials an envelope was sealed for.
pub fn envelope_recipients(envelope: &[u8]) -> Result<Vec<u64>, CryptoError> {
    let (_, header, _) = split(envelope)?;
    Ok(header.recipients.iter().map(|entry| entry.serial).collect())
}

fn split(envelope: &[u8]) -> Result<(&[u8], Header, &[u8]), CryptoError> {
    let rest = envelope
        .strip_prefix(MAGIC)
        .ok_or_else(|| CryptoError::InvalidInput("not a caucase backup".to_string()))?;
    if rest.len() < 4 {
        return Err(CryptoError::InvalidInput("truncated envelope".to_string()));
    }
    let (len, rest) = rest.split_at(4);
    let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
    if rest.len() < len {
        return Err(CryptoError::InvalidInput("truncated envelope".to_string()));
    }
    let (header_bytes, body) = rest.split_at(len);

    let header: Header = serde_json::from_slice(header_bytes)
        .map_err(|e| CryptoError::InvalidInput(format!("bad envelope header: {e}")))?;
    if header.cipher != PAYLOAD_CIPHER {
        return Err(CryptoError::InvalidInput(format!(
            "unsupported cipher {}",
            header.cipher
        )));
    }
    Ok((header_bytes, header, body))
}

fn decode_b64(value: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64
        .decode(value)
        .map_err(|e| CryptoError::InvalidInput(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use rcgen::{KeyPair, PublicKeyData, PKCS_ECDSA_P256_SHA256};

    fn holder(serial: u64) -> (Recipient, PrivateKey) {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let recipient = Recipient {
            serial,
            public_key: PublicKey::from_spki_der(&key_pair.subject_public_key_info()).unwrap(),
        };
        let private = PrivateKey::from_pkcs8_pem(&key_pair.serialize_pem()).unwrap();
        (recipient, private)
    }

    #[test]
    fn test_every_recipient_can_open() {
        let holders: Vec<_> = (1..=3).map(holder).collect();
        let recipients: Vec<_> = holders.iter().map(|(r, _)| r.clone()).collect();

        let envelope = seal_envelope(b"database dump", &recipients).unwrap();

        for (_, key) in &holders {
            assert_eq!(&*open_envelope(&envelope, key).unwrap(), b"database dump");
        }
        assert_eq!(envelope_recipients(&envelope).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_outsider_cannot_open() {
        let (recipient, _) = holder(1);
        let (_, outsider) = holder(2);

        let envelope = seal_envelope(b"database dump", &[recipient]).unwrap();

        assert!(matches!(
            open_envelope(&envelope, &outsider),
            Err(CryptoError::NotARecipient(_))
        ));
    }

    #[test]
    fn test_no_recipients_rejected() {
        assert!(seal_envelope(b"dump", &[]).is_err());
    }

    #[test]
    fn test_tampered_header_rejected() {
        let (recipient, key) = holder(7);
        let mut envelope = seal_envelope(b"dump", &[recipient]).unwrap();
        // "serial":7 -> "serial":8
        let pos = envelope
            .windows(10)
            .position(|w| w == b"\"serial\":7")
            .unwrap();
        envelope[pos + 9] = b'8';

        assert!(open_envelope(&envelope, &key).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        let (_, key) = holder(1);
        assert!(open_envelope(b"not a backup at all", &key).is_err());
    }
}
