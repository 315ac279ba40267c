//! Streaming completion endpoint.

use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use kvserve_core::sequence::{DoneReason, SequenceEvent, SequenceHandle, SequenceSummary};

use super::error::ApiError;
use super::types::{CompletionRequest, CompletionResponse, Timings};
use super::AppState;
use crate::crypto;

/// POST /completion: create a sequence for the prompt and stream one JSON
/// frame per flushed piece, ending with a `stop` frame carrying timings.
pub async fn completion(
    State(state): State<AppState>,
    Json(req): Json<CompletionRequest>,
) -> Result<Response, ApiError> {
    let runner = state.runner().await?;

    let images: Vec<kvserve_core::sequence::ImageData> =
        req.images.into_iter().map(Into::into).collect();
    let params = req.options.sequence_params(&req.grammar, false);

    let (seq, handle) = runner.new_sequence(&req.prompt, &images, params)?;

    let permit = runner
        .acquire()
        .await
        .map_err(|e| ApiError::Internal(format!("failed to acquire sequence slot: {e}")))?;
    runner.publish(seq, req.cache_prompt, permit)?;

    Ok(stream_response(handle, None))
}

/// Wrap a sequence's event stream as a chunked JSON response, optionally
/// AES-encrypting each piece for the secure endpoints.
pub(super) fn stream_response(handle: SequenceHandle, encrypt_key: Option<String>) -> Response {
    let body = Body::from_stream(completion_stream(handle, encrypt_key));
    (
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn completion_stream(
    handle: SequenceHandle,
    encrypt_key: Option<String>,
) -> impl Stream<Item = Result<Bytes, Infallible>> {
    let SequenceHandle { events, .. } = handle;

    ReceiverStream::new(events).map(move |event| {
        let frame = match event {
            SequenceEvent::Piece(content) => {
                let content = match &encrypt_key {
                    Some(key) => match crypto::aes::encrypt(key, &content) {
                        Ok(encrypted) => encrypted,
                        Err(e) => return Ok(error_line(&format!("failed to encrypt content: {e}"))),
                    },
                    None => content,
                };
                CompletionResponse {
                    content,
                    ..CompletionResponse::default()
                }
            }
            SequenceEvent::Error(message) => return Ok(error_line(&message)),
            SequenceEvent::Done(summary) => final_frame(&summary),
        };
        Ok(frame_line(&frame))
    })
}

fn final_frame(summary: &SequenceSummary) -> CompletionResponse {
    CompletionResponse {
        stop: true,
        stopped_limit: summary.done_reason == Some(DoneReason::Limit),
        timings: Timings {
            prompt_n: summary.num_prompt_inputs,
            prompt_ms: summary.prompt_duration().as_millis() as f64,
            predicted_n: summary.num_decoded,
            predicted_ms: summary.predicted_duration().as_millis() as f64,
        },
        ..CompletionResponse::default()
    }
}

fn frame_line(frame: &CompletionResponse) -> Bytes {
    let mut line = serde_json::to_vec(frame).unwrap_or_default();
    line.push(b'\n');
    Bytes::from(line)
}

fn error_line(message: &str) -> Bytes {
    let mut line = serde_json::to_vec(&serde_json::json!({ "error": message }))
        .unwrap_or_default();
    line.push(b'\n');
    Bytes::from(line)
}
