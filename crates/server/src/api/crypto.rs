//! Key-management utility endpoints for clients of the secure flow.

use axum::Json;

use super::error::ApiError;
use super::types::{
    AesDecryptRequest, AesDecryptResponse, AesEncryptRequest, AesEncryptResponse, AesKeyResponse,
    RsaDecryptRequest, RsaDecryptResponse, RsaEncryptRequest, RsaEncryptResponse, RsaKeysResponse,
};
use crate::crypto;

/// GET /aes/key: a fresh random AES-256 key.
pub async fn aes_key() -> Json<AesKeyResponse> {
    Json(AesKeyResponse {
        aes_key: crypto::aes::generate_key(),
    })
}

/// POST /aes/encrypt
pub async fn aes_encrypt(
    Json(req): Json<AesEncryptRequest>,
) -> Result<Json<AesEncryptResponse>, ApiError> {
    let encrypted_text = crypto::aes::encrypt(&req.aes_key, &req.text)?;
    Ok(Json(AesEncryptResponse { encrypted_text }))
}

/// POST /aes/decrypt
pub async fn aes_decrypt(
    Json(req): Json<AesDecryptRequest>,
) -> Result<Json<AesDecryptResponse>, ApiError> {
    let text = crypto::aes::decrypt(&req.aes_key, &req.encrypted_text)?;
    Ok(Json(AesDecryptResponse { text }))
}

/// GET /rsa/keys: a fresh PEM keypair.
pub async fn rsa_keys() -> Result<Json<RsaKeysResponse>, ApiError> {
    let (private_key, public_key) = crypto::rsa::generate_keys()?;
    Ok(Json(RsaKeysResponse {
        private_key,
        public_key,
    }))
}

/// POST /rsa/encrypt
pub async fn rsa_encrypt(
    Json(req): Json<RsaEncryptRequest>,
) -> Result<Json<RsaEncryptResponse>, ApiError> {
    let encrypted_text = crypto::rsa::encrypt(&req.public_key, &req.text)?;
    Ok(Json(RsaEncryptResponse { encrypted_text }))
}

/// POST /rsa/decrypt
pub async fn rsa_decrypt(
    Json(req): Json<RsaDecryptRequest>,
) -> Result<Json<RsaDecryptResponse>, ApiError> {
    let text = crypto::rsa::decrypt(&req.private_key, &req.encrypted_text)?;
    Ok(Json(RsaDecryptResponse { text }))
}
