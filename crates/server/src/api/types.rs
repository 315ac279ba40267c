//! Wire types for the inference and crypto endpoints.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Deserializer, Serialize};

use kvserve_core::backend::SamplingParams;
use kvserve_core::sequence::{self, SequenceParams};

/// Sampling and generation options, deserialized over the documented
/// defaults so absent fields keep their default values.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    pub n_keep: i32,
    pub seed: i32,
    pub n_predict: i32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub tfs_z: f32,
    pub typical_p: f32,
    pub repeat_last_n: i32,
    pub temperature: f32,
    pub repeat_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub penalize_nl: bool,
    pub stop: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            n_keep: 4,
            seed: -1,
            n_predict: -1,
            top_k: 40,
            top_p: 0.9,
            min_p: 0.0,
            tfs_z: 1.0,
            typical_p: 1.0,
            repeat_last_n: 64,
            temperature: 0.8,
            repeat_penalty: 1.1,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            penalize_nl: true,
            stop: Vec::new(),
        }
    }
}

impl Options {
    pub fn sampling_params(&self, grammar: &str) -> SamplingParams {
        SamplingParams {
            top_k: self.top_k,
            top_p: self.top_p,
            min_p: self.min_p,
            tfs_z: self.tfs_z,
            typical_p: self.typical_p,
            temperature: self.temperature,
            repeat_last_n: self.repeat_last_n,
            repeat_penalty: self.repeat_penalty,
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
            mirostat: self.mirostat,
            mirostat_tau: self.mirostat_tau,
            mirostat_eta: self.mirostat_eta,
            penalize_newline: self.penalize_nl,
            seed: self.seed as u32,
            grammar: grammar.to_owned(),
        }
    }

    pub fn sequence_params(&self, grammar: &str, embedding_only: bool) -> SequenceParams {
        SequenceParams {
            num_predict: self.n_predict,
            stop: self.stop.clone(),
            num_keep: self.n_keep,
            sampling: Some(self.sampling_params(grammar)),
            embedding_only,
        }
    }
}

/// An attached image; `data` travels base64 encoded.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageData {
    #[serde(deserialize_with = "de_base64", default)]
    pub data: Vec<u8>,
    pub id: i32,
    #[serde(default)]
    pub aspect_ratio_id: i32,
}

impl From<ImageData> for sequence::ImageData {
    fn from(img: ImageData) -> Self {
        Self {
            data: img.data,
            id: img.id,
            aspect_ratio_id: img.aspect_ratio_id,
        }
    }
}

fn de_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    BASE64.decode(encoded).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(rename = "image_data")]
    pub images: Vec<ImageData>,
    pub grammar: String,
    pub cache_prompt: bool,
    #[serde(flatten)]
    pub options: Options,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            images: Vec::new(),
            grammar: String::new(),
            cache_prompt: false,
            options: Options::default(),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct Timings {
    pub predicted_n: usize,
    pub predicted_ms: f64,
    pub prompt_n: usize,
    pub prompt_ms: f64,
}

/// One frame of the chunked completion stream. Piece frames carry content;
/// the final frame has `stop = true`, empty content and real timings.
#[derive(Debug, Default, Serialize)]
pub struct CompletionResponse {
    pub content: String,
    pub stop: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stopped_limit: bool,
    pub timings: Timings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EmbeddingRequest {
    pub content: String,
    pub cache_prompt: bool,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub progress: f32,
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct GenerateMessage {
    pub role: &'static str,
    pub content: String,
}

/// Single-shot generation response; all durations are nanoseconds.
#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub message: GenerateMessage,
    pub model: String,
    pub created_at: String,
    pub done_reason: String,
    pub done: bool,
    pub total_duration: i64,
    pub load_duration: i64,
    pub prompt_eval_count: i64,
    pub prompt_eval_duration: i64,
    pub eval_count: i64,
    pub eval_duration: i64,
}

#[derive(Debug, Deserialize)]
pub struct SecureRequest {
    #[serde(default)]
    pub role: String,
    #[serde(rename = "EncryptedPrompt")]
    pub encrypted_prompt: String,
    #[serde(rename = "encryptedSymmetricKey")]
    pub encrypted_symmetric_key: String,
}

// ── crypto utility endpoints ─────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct AesKeyResponse {
    #[serde(rename = "aesKey")]
    pub aes_key: String,
}

#[derive(Debug, Deserialize)]
pub struct AesEncryptRequest {
    #[serde(rename = "aesKey")]
    pub aes_key: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct AesEncryptResponse {
    #[serde(rename = "encryptedText")]
    pub encrypted_text: String,
}

#[derive(Debug, Deserialize)]
pub struct AesDecryptRequest {
    #[serde(rename = "aesKey")]
    pub aes_key: String,
    #[serde(rename = "encryptedText")]
    pub encrypted_text: String,
}

#[derive(Debug, Serialize)]
pub struct AesDecryptResponse {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct RsaKeysResponse {
    #[serde(rename = "privateKey")]
    pub private_key: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

#[derive(Debug, Deserialize)]
pub struct RsaEncryptRequest {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct RsaEncryptResponse {
    #[serde(rename = "encryptedText")]
    pub encrypted_text: String,
}

#[derive(Debug, Deserialize)]
pub struct RsaDecryptRequest {
    #[serde(rename = "privateKey")]
    pub private_key: String,
    #[serde(rename = "encryptedText")]
    pub encrypted_text: String,
}

#[derive(Debug, Serialize)]
pub struct RsaDecryptResponse {
    pub text: String,
}
