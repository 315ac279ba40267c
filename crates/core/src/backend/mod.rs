//! The capability contract consumed from the tensor backend.
//!
//! Everything the scheduler needs from the model is expressed here as a
//! trait set: tokenization, batched decode, KV cache mutation, sampling and
//! embedding readout. The scheduler never touches backend types directly,
//! which keeps the decode loop testable against [`crate::testing`] mocks.

use std::any::Any;

use thiserror::Error;

#[cfg(feature = "llama")]
pub mod llama;

/// Vocabulary token identifier.
pub type TokenId = i32;

/// A single unit of model input: either a token or one image-embedding
/// vector. A decode batch accepts only one kind at a time.
#[derive(Clone, Debug, PartialEq)]
pub enum Input {
    Token(TokenId),
    Embed(Vec<f32>),
}

impl Input {
    pub fn is_embed(&self) -> bool {
        matches!(self, Input::Embed(_))
    }
}

/// Sampling configuration for one sequence.
#[derive(Clone, Debug)]
pub struct SamplingParams {
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub tfs_z: f32,
    pub typical_p: f32,
    pub temperature: f32,
    pub repeat_last_n: i32,
    pub repeat_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub penalize_newline: bool,
    pub seed: u32,
    pub grammar: String,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            top_k: 40,
            top_p: 0.9,
            min_p: 0.0,
            tfs_z: 1.0,
            typical_p: 1.0,
            temperature: 0.8,
            repeat_last_n: 64,
            repeat_penalty: 1.1,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            penalize_newline: true,
            seed: 0,
            grammar: String::new(),
        }
    }
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("batch allocation failed: {0}")]
    Batch(String),

    #[error("sampler construction failed: {0}")]
    Sampler(String),

    #[error("model load failed: {0}")]
    Load(String),

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    /// The KV cache has no free slot for the batch. The scheduler responds
    /// by defragmenting and retrying once.
    #[error("kv cache is full")]
    KvCacheFull,

    #[error("decode failed: {0}")]
    Backend(String),
}

/// A reusable decode batch. Positions and sequence ids are assigned by the
/// scheduler; the batch only stores them for the next `decode` call.
pub trait DecodeBatch: Send {
    /// Append one input at `pos` for KV sequence `seq_id`. `is_last` marks
    /// the input whose logits the caller will sample from.
    fn add(&mut self, input: &Input, pos: usize, is_last: bool, seq_id: usize);

    /// Number of inputs currently staged in the batch.
    fn num_tokens(&self) -> usize;

    /// Allocated capacity of the batch.
    fn size(&self) -> usize;

    /// Whether this batch carries embedding vectors rather than tokens.
    fn is_embedding(&self) -> bool;

    fn clear(&mut self);

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Backend-owned sampler state for one sequence, seeded with the prompt
/// token history before decoding starts.
pub trait SamplingContext: Send {
    fn accept(&mut self, token: TokenId, apply_grammar: bool);

    /// Sample the next token from the logits at batch index `i_batch`.
    fn sample(&mut self, i_batch: usize) -> TokenId;
}

/// Uniform contract over the tensor backend.
///
/// KV positions are token indices within one sequence id. Range arguments
/// follow the backend convention: `[p0, p1)` with `p1 == -1` meaning "to
/// the end of the sequence".
pub trait ModelBackend: Send + Sync {
    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        parse_special: bool,
    ) -> Result<Vec<TokenId>, BackendError>;

    /// The raw bytes of a token's vocabulary piece. Pieces may end in the
    /// middle of a UTF-8 code point.
    fn token_to_piece(&self, token: TokenId) -> Vec<u8>;

    /// Whether `token` is an end-of-generation sentinel.
    fn token_is_eog(&self, token: TokenId) -> bool;

    /// Whether the model prepends a BOS token during tokenization.
    fn add_bos_token(&self) -> bool;

    /// Text embedding dimension.
    fn n_embd(&self) -> usize;

    fn new_batch(
        &self,
        size: usize,
        n_seq_max: usize,
        embd_dim: usize,
    ) -> Result<Box<dyn DecodeBatch>, BackendError>;

    fn decode(&self, batch: &mut dyn DecodeBatch) -> Result<(), DecodeError>;

    /// Barrier for in-flight backend work. Required after cross-attention
    /// batches on multi-GPU systems before the next batch is issued.
    fn synchronize(&self);

    fn set_cross_attention(&self, enabled: bool);

    /// Erase `[p0, p1)` from sequence `seq_id`. Returns `false` when the
    /// backend cannot erase a partial range.
    fn kv_cache_seq_rm(&self, seq_id: usize, p0: i32, p1: i32) -> bool;

    /// Renumber positions in `[p0, p1)` of `seq_id` by `delta`.
    fn kv_cache_seq_add(&self, seq_id: usize, p0: i32, p1: i32, delta: i32);

    /// Copy the KV range `[p0, p1)` from `src` into `dst`.
    fn kv_cache_seq_cp(&self, src: usize, dst: usize, p0: i32, p1: i32);

    fn kv_cache_defrag(&self);

    fn new_sampling_context(
        &self,
        params: &SamplingParams,
    ) -> Result<Box<dyn SamplingContext>, BackendError>;

    /// Pooled embedding for sequence `seq_id`, if the backend produced one.
    fn embeddings_seq(&self, seq_id: usize) -> Option<Vec<f32>>;

    /// Embedding at batch index `i_batch`, the fallback when sequence-level
    /// pooling is unavailable.
    fn embeddings_ith(&self, i_batch: usize) -> Option<Vec<f32>>;
}

/// A vision tower that turns raw image bytes into embedding vectors.
pub trait VisionEmbedder: Send + Sync {
    fn embed(&self, data: &[u8], aspect_ratio_id: i32) -> Result<Vec<Vec<f32>>, BackendError>;

    /// Embedding batch capacity. Models that map a whole image to a single
    /// large embedding return 1; others return the configured batch size.
    fn batch_size(&self, configured: usize) -> usize;

    /// Dimension of the produced embedding vectors.
    fn embed_size(&self) -> usize;

    /// Whether interleaved image embeddings require image↔text
    /// cross-attention during decode.
    fn uses_cross_attention(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_equality_is_structural() {
        assert_eq!(Input::Token(7), Input::Token(7));
        assert_ne!(Input::Token(7), Input::Token(8));
        assert_eq!(
            Input::Embed(vec![1.0, 2.0]),
            Input::Embed(vec![1.0, 2.0])
        );
        assert_ne!(Input::Embed(vec![1.0]), Input::Embed(vec![1.0, 2.0]));
        assert_ne!(Input::Token(1), Input::Embed(vec![1.0]));
    }

    #[test]
    fn sampling_defaults_match_documented_table() {
        let p = SamplingParams::default();
        assert_eq!(p.top_k, 40);
        assert_eq!(p.top_p, 0.9);
        assert_eq!(p.typical_p, 1.0);
        assert_eq!(p.repeat_last_n, 64);
        assert_eq!(p.repeat_penalty, 1.1);
        assert_eq!(p.mirostat, 0);
        assert_eq!(p.mirostat_tau, 5.0);
        assert_eq!(p.mirostat_eta, 0.1);
        assert!(p.penalize_newline);
    }

    #[test]
    fn decode_error_display() {
        assert_eq!(DecodeError::KvCacheFull.to_string(), "kv cache is full");
        assert_eq!(
            DecodeError::Backend("boom".into()).to_string(),
            "decode failed: boom"
        );
    }
}
