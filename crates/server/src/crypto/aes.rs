//! AES-256-CBC with PKCS#7 padding.
//!
//! Wire format: `base64(iv || ciphertext)` with a fresh 16-byte IV per
//! message. Keys travel as base64-encoded 32-byte strings.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;

use super::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const BLOCK_SIZE: usize = 16;
const KEY_SIZE: usize = 32;

/// Generate a random AES-256 key, base64 encoded.
pub fn generate_key() -> String {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    BASE64.encode(key)
}

/// Encrypt `text` under the base64-encoded key.
pub fn encrypt(base64_key: &str, text: &str) -> Result<String, CryptoError> {
    let key = decode_key(base64_key)?;

    let mut iv = [0u8; BLOCK_SIZE];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new(&key.into(), &iv.into());
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(text.as_bytes());

    let mut out = Vec::with_capacity(BLOCK_SIZE + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

/// Decrypt a `base64(iv || ciphertext)` payload under the base64-encoded
/// key.
pub fn decrypt(base64_key: &str, encrypted: &str) -> Result<String, CryptoError> {
    let key = decode_key(base64_key)?;

    let payload = BASE64.decode(encrypted)?;
    if payload.len() < BLOCK_SIZE {
        return Err(CryptoError::CiphertextTooShort);
    }
    let (iv, ciphertext) = payload.split_at(BLOCK_SIZE);

    let iv: [u8; BLOCK_SIZE] = iv.try_into().map_err(|_| CryptoError::CiphertextTooShort)?;
    let cipher = Aes256CbcDec::new(&key.into(), &iv.into());
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Padding)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
}

fn decode_key(base64_key: &str) -> Result<[u8; KEY_SIZE], CryptoError> {
    let key = BASE64.decode(base64_key)?;
    let len = key.len();
    key.try_into().map_err(|_| CryptoError::KeyLength(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = generate_key();
        let encrypted = encrypt(&key, "attack at dawn").unwrap();
        assert_eq!(decrypt(&key, &encrypted).unwrap(), "attack at dawn");
    }

    #[test]
    fn fresh_iv_per_message() {
        let key = generate_key();
        let a = encrypt(&key, "same text").unwrap();
        let b = encrypt(&key, "same text").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_plaintext_roundtrips() {
        let key = generate_key();
        let encrypted = encrypt(&key, "").unwrap();
        assert_eq!(decrypt(&key, &encrypted).unwrap(), "");
    }

    #[test]
    fn block_aligned_plaintext_roundtrips() {
        // Exactly one block, forcing a full padding block.
        let key = generate_key();
        let text = "0123456789abcdef";
        let encrypted = encrypt(&key, text).unwrap();
        assert_eq!(decrypt(&key, &encrypted).unwrap(), text);
    }

    #[test]
    fn wrong_key_size_is_rejected() {
        let short = BASE64.encode([0u8; 16]);
        assert!(matches!(
            encrypt(&short, "x"),
            Err(CryptoError::KeyLength(16))
        ));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let key = generate_key();
        let payload = BASE64.encode([0u8; 8]);
        assert!(matches!(
            decrypt(&key, &payload),
            Err(CryptoError::CiphertextTooShort)
        ));
    }

    #[test]
    fn garbage_base64_is_rejected() {
        let key = generate_key();
        assert!(matches!(
            decrypt(&key, "not base64 !!!"),
            Err(CryptoError::Base64(_))
        ));
    }
}
