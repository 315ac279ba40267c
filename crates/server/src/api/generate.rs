//! Single-shot generation endpoint with a fixed chat template.

use axum::extract::State;
use axum::Json;
use chrono::SecondsFormat;

use kvserve_core::backend::SamplingParams;
use kvserve_core::scheduler::Scheduler;
use kvserve_core::sequence::{SequenceEvent, SequenceParams};

use super::error::ApiError;
use super::types::{GenerateMessage, GenerateRequest, GenerateResponse};
use super::AppState;

/// Role template applied around the user prompt.
pub(super) const PROMPT_FORMAT: &str = "<|start_header_id|>system<|end_header_id|>\n\n\
    Cutting Knowledge Date: December 2023\n\n\
    <|eot_id|><|start_header_id|>user<|end_header_id|>\n\n\
    {prompt}\
    <|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n";

pub(super) fn format_prompt(prompt: &str) -> String {
    PROMPT_FORMAT.replace("{prompt}", prompt)
}

/// POST /generate: wrap the prompt in the role template, run it to
/// completion and reply with a single response carrying timing metadata.
pub async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let runner = state.runner().await?;
    run_generate(&state, &runner, &req.prompt).await.map(Json)
}

pub(super) async fn run_generate(
    state: &AppState,
    runner: &Scheduler,
    prompt: &str,
) -> Result<GenerateResponse, ApiError> {
    let params = SequenceParams {
        num_predict: -1,
        stop: Vec::new(),
        num_keep: 4,
        sampling: Some(SamplingParams {
            seed: 0,
            ..SamplingParams::default()
        }),
        embedding_only: false,
    };
    let (seq, mut handle) = runner.new_sequence(&format_prompt(prompt), &[], params)?;

    let permit = runner
        .acquire()
        .await
        .map_err(|e| ApiError::Internal(format!("failed to acquire sequence slot: {e}")))?;
    runner.publish(seq, true, permit)?;

    let mut content = String::new();
    let mut summary = None;
    while let Some(event) = handle.events.recv().await {
        match event {
            SequenceEvent::Piece(piece) => content.push_str(&piece),
            SequenceEvent::Error(message) => return Err(ApiError::Internal(message)),
            SequenceEvent::Done(s) => summary = Some(s),
        }
    }
    let summary =
        summary.ok_or_else(|| ApiError::Internal("sequence ended without a summary".into()))?;

    let prompt_ns = summary.prompt_duration().as_nanos() as i64;
    Ok(GenerateResponse {
        message: GenerateMessage {
            role: "assistant",
            content: content.trim().to_string(),
        },
        model: state.model_name.clone(),
        created_at: chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        done_reason: summary
            .done_reason
            .map(|r| r.as_str())
            .unwrap_or("stop")
            .to_string(),
        done: true,
        total_duration: summary.total_duration().as_nanos() as i64,
        load_duration: prompt_ns,
        prompt_eval_count: -1,
        prompt_eval_duration: prompt_ns,
        eval_count: summary.num_decoded as i64,
        eval_duration: summary.predicted_duration().as_nanos() as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_embeds_the_prompt_between_role_markers() {
        let formatted = format_prompt("What is entropy?");
        assert!(formatted.contains("<|start_header_id|>user<|end_header_id|>\n\nWhat is entropy?"));
        assert!(formatted.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
        assert!(formatted.starts_with("<|start_header_id|>system<|end_header_id|>"));
    }
}
