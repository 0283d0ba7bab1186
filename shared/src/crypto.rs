//! HMAC signing and the encrypt-then-MAC registration envelope

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("envelope is not <ciphertext>|<signature>")]
    Format,
    #[error("invalid encoding: {0}")]
    Encoding(String),
    #[error("invalid key material")]
    Key,
    #[error("signature mismatch")]
    Signature,
    #[error("ciphertext could not be decrypted")]
    Decrypt,
}

fn keyed_mac(key: &[u8]) -> Result<HmacSha256, CryptoError> {
    <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::Key)
}

/// Lowercase hex HMAC-SHA256 of `message`.
pub fn sign_hex(message: &str, secret: &[u8]) -> Result<String, CryptoError> {
    let mut mac = keyed_mac(secret)?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a hex HMAC in constant time. Undecodable hex or a tag of the
/// wrong length fails closed.
pub fn verify_hex(message: &str, signature_hex: &str, secret: &[u8]) -> Result<(), CryptoError> {
    let signature =
        hex::decode(signature_hex).map_err(|e| CryptoError::Encoding(e.to_string()))?;
    let mut mac = keyed_mac(secret)?;
    mac.update(message.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| CryptoError::Signature)
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Keys for the envelope profile, both derived from one shared secret.
#[derive(Clone)]
pub struct EnvelopeKeys {
    cipher_key: [u8; 32],
    mac_key: Vec<u8>,
}

impl EnvelopeKeys {
    pub fn derive(secret: &str) -> Self {
        let cipher_key: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        let mac_key = format!("HMAC_{secret}").into_bytes();
        Self {
            cipher_key,
            mac_key,
        }
    }
}

impl std::fmt::Debug for EnvelopeKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EnvelopeKeys(..)")
    }
}

/// Encrypts `plaintext` under a fresh random IV and signs the base64 text.
///
/// Output: `base64(iv || ciphertext)|base64(hmac)`.
pub fn seal(plaintext: &[u8], keys: &EnvelopeKeys) -> Result<String, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new_from_slices(&keys.cipher_key, &iv)
        .map_err(|_| CryptoError::Key)?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut combined = Vec::with_capacity(IV_LEN + ciphertext.len());
    combined.extend_from_slice(&iv);
    combined.extend_from_slice(&ciphertext);
    let encoded = STANDARD.encode(&combined);

    let mut mac = keyed_mac(&keys.mac_key)?;
    mac.update(encoded.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!("{encoded}|{signature}"))
}

/// Verifies the signature over the base64 ciphertext, then decrypts.
///
/// Nothing is decoded or decrypted before the signature check passes.
pub fn open(envelope: &str, keys: &EnvelopeKeys) -> Result<Vec<u8>, CryptoError> {
    let (encoded, signature) = envelope.split_once('|').ok_or(CryptoError::Format)?;
    if signature.contains('|') {
        return Err(CryptoError::Format);
    }

    let signature = STANDARD
        .decode(signature)
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    let mut mac = keyed_mac(&keys.mac_key)?;
    mac.update(encoded.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| CryptoError::Signature)?;

    let combined = STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    if combined.len() < IV_LEN + BLOCK_LEN || (combined.len() - IV_LEN) % BLOCK_LEN != 0 {
        return Err(CryptoError::Decrypt);
    }

    let (iv, ciphertext) = combined.split_at(IV_LEN);
    Aes256CbcDec::new_from_slices(&keys.cipher_key, iv)
        .map_err(|_| CryptoError::Key)?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify_hex() {
        let signature = sign_hex("host-a|7777|8|1700000000", b"secret").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(verify_hex("host-a|7777|8|1700000000", &signature, b"secret").is_ok());
    }

    #[test]
    fn test_verify_hex_rejects_other_message_or_secret() {
        let signature = sign_hex("host-a|7777|8|1700000000", b"secret").unwrap();

        assert_eq!(
            verify_hex("host-a|7777|9|1700000000", &signature, b"secret"),
            Err(CryptoError::Signature)
        );
        assert_eq!(
            verify_hex("host-a|7777|8|1700000000", &signature, b"other"),
            Err(CryptoError::Signature)
        );
    }

    #[test]
    fn test_verify_hex_fails_closed_on_bad_encoding_and_length() {
        let signature = sign_hex("payload", b"secret").unwrap();

        assert!(matches!(
            verify_hex("payload", "zz", b"secret"),
            Err(CryptoError::Encoding(_))
        ));
        assert_eq!(
            verify_hex("payload", &signature[..62], b"secret"),
            Err(CryptoError::Signature)
        );
        assert_eq!(verify_hex("payload", "", b"secret"), Err(CryptoError::Signature));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"MY_SECRET_TOKEN", b"MY_SECRET_TOKEN"));
        assert!(!constant_time_eq(b"MY_SECRET_TOKEN", b"MY_SECRET_TOKEM"));
        assert!(!constant_time_eq(b"MY_SECRET_TOKEN", b"MY_SECRET"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_envelope_roundtrip_various_sizes() {
        let keys = EnvelopeKeys::derive("CHANGE_ME");

        for size in [0usize, 1, 15, 16, 17, 255, 1024] {
            let payload: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
            let envelope = seal(&payload, &keys).unwrap();
            assert_eq!(open(&envelope, &keys).unwrap(), payload);
        }
    }

    #[test]
    fn test_envelope_uses_fresh_iv() {
        let keys = EnvelopeKeys::derive("CHANGE_ME");
        let first = seal(b"REGISTER|host|7777|8|1", &keys).unwrap();
        let second = seal(b"REGISTER|host|7777|8|1", &keys).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_envelope_tampering_fails_closed() {
        let keys = EnvelopeKeys::derive("CHANGE_ME");
        let envelope = seal(b"REGISTER|host-a|7777|8|1700000000", &keys).unwrap();
        let bytes = envelope.as_bytes();

        for index in 0..bytes.len() {
            let mut tampered = bytes.to_vec();
            tampered[index] = if tampered[index] == b'A' { b'B' } else { b'A' };
            let Ok(text) = String::from_utf8(tampered) else {
                continue;
            };
            if text == envelope {
                continue;
            }
            assert!(
                open(&text, &keys).is_err(),
                "tampered byte {} was accepted",
                index
            );
        }
    }

    #[test]
    fn test_envelope_wrong_secret() {
        let envelope = seal(b"HEARTBEAT|host-a|7777|8|1", &EnvelopeKeys::derive("a")).unwrap();
        assert_eq!(
            open(&envelope, &EnvelopeKeys::derive("b")),
            Err(CryptoError::Signature)
        );
    }

    #[test]
    fn test_envelope_format_errors() {
        let keys = EnvelopeKeys::derive("CHANGE_ME");
        assert_eq!(open("no-separator", &keys), Err(CryptoError::Format));
        assert_eq!(open("a|b|c", &keys), Err(CryptoError::Format));
        assert!(matches!(open("abc|***", &keys), Err(CryptoError::Encoding(_))));
    }

    #[test]
    fn test_signed_but_truncated_ciphertext_is_rejected() {
        let keys = EnvelopeKeys::derive("CHANGE_ME");
        let encoded = STANDARD.encode([7u8; IV_LEN + 3]);
        let mut mac = keyed_mac(&keys.mac_key).unwrap();
        mac.update(encoded.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        assert_eq!(
            open(&format!("{encoded}|{signature}"), &keys),
            Err(CryptoError::Decrypt)
        );
    }
}
