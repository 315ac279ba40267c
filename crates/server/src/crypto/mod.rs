//! Cryptography for the secure endpoints: AES-256-CBC for payloads, RSA
//! PKCS#1 v1.5 for symmetric key exchange, and the process-wide key store.

pub mod aes;
pub mod keystore;
pub mod rsa;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("aes key must be 32 bytes, got {0}")]
    KeyLength(usize),

    #[error("ciphertext too short")]
    CiphertextTooShort,

    #[error("bad pkcs7 padding")]
    Padding,

    #[error("plaintext is not valid utf-8")]
    Utf8,

    #[error("rsa: {0}")]
    Rsa(#[from] ::rsa::Error),

    #[error("invalid pem key: {0}")]
    Pem(String),
}
