//! Embedding endpoint.

use axum::extract::State;
use axum::Json;

use kvserve_core::sequence::SequenceParams;

use super::error::ApiError;
use super::types::{EmbeddingRequest, EmbeddingResponse};
use super::AppState;

/// POST /embedding: run the prompt through a single evaluation pass and
/// return the pooled embedding vector.
pub async fn embedding(
    State(state): State<AppState>,
    Json(req): Json<EmbeddingRequest>,
) -> Result<Json<EmbeddingResponse>, ApiError> {
    let runner = state.runner().await?;
    tracing::debug!(content = %req.content, "embedding request");

    let params = SequenceParams {
        embedding_only: true,
        ..SequenceParams::default()
    };
    let (seq, mut handle) = runner.new_sequence(&req.content, &[], params)?;

    let permit = runner
        .acquire()
        .await
        .map_err(|e| ApiError::Internal(format!("failed to acquire sequence slot: {e}")))?;
    runner.publish(seq, req.cache_prompt, permit)?;

    let embedding = handle
        .embedding
        .recv()
        .await
        .ok_or_else(|| ApiError::Internal("sequence ended without an embedding".into()))?;

    Ok(Json(EmbeddingResponse { embedding }))
}
