//! Secure variants of the inference endpoints.
//!
//! The request carries an RSA-encrypted AES key and an AES-encrypted
//! prompt. The prompt is decrypted before sequencing, so the scheduler only
//! ever sees plaintext; for streamed completions every piece is
//! re-encrypted under the same AES key.

use axum::extract::State;
use axum::response::Response;
use axum::Json;

use super::completion::stream_response;
use super::error::ApiError;
use super::generate::{format_prompt, run_generate};
use super::types::{GenerateResponse, SecureRequest};
use super::AppState;
use crate::crypto;
use crate::crypto::keystore::PRIVATE_KEY;

/// Recover the AES key and the plaintext prompt from a secure request.
fn decrypt_request(state: &AppState, req: &SecureRequest) -> Result<(String, String), ApiError> {
    let private_key = state
        .keys
        .get(PRIVATE_KEY)
        .ok_or_else(|| ApiError::Internal("server private key is not configured".into()))?;

    let symmetric_key = crypto::rsa::decrypt(&private_key, &req.encrypted_symmetric_key)
        .map_err(|e| ApiError::BadRequest(format!("failed to decrypt symmetric key: {e}")))?;
    let prompt = crypto::aes::decrypt(&symmetric_key, &req.encrypted_prompt)
        .map_err(|e| ApiError::BadRequest(format!("failed to decrypt prompt: {e}")))?;

    Ok((symmetric_key, prompt))
}

/// POST /secure/completion: like /completion, with the streamed content
/// AES-encrypted under the request's symmetric key.
pub async fn completion(
    State(state): State<AppState>,
    Json(req): Json<SecureRequest>,
) -> Result<Response, ApiError> {
    let runner = state.runner().await?;
    let (symmetric_key, prompt) = decrypt_request(&state, &req)?;

    let params = super::types::Options {
        seed: 0,
        ..super::types::Options::default()
    }
    .sequence_params("", false);
    let (seq, handle) = runner.new_sequence(&format_prompt(&prompt), &[], params)?;

    let permit = runner
        .acquire()
        .await
        .map_err(|e| ApiError::Internal(format!("failed to acquire sequence slot: {e}")))?;
    runner.publish(seq, true, permit)?;

    Ok(stream_response(handle, Some(symmetric_key)))
}

/// POST /secure/generate: the prompt arrives encrypted, the response is
/// plaintext.
pub async fn generate(
    State(state): State<AppState>,
    Json(req): Json<SecureRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let runner = state.runner().await?;
    let (_, prompt) = decrypt_request(&state, &req)?;
    run_generate(&state, &runner, &prompt).await.map(Json)
}
