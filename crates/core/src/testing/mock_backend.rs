//! A scriptable in-memory model backend.
//!
//! Tokenization maps each character to its code point; `token_to_piece`
//! reverses that unless an explicit piece override is registered, which
//! lets tests script multi-byte and partial-UTF-8 pieces. Sampling pops
//! tokens from a script and falls back to [`EOG_TOKEN`] when the script is
//! exhausted. All KV mutations are recorded for assertions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{
    BackendError, DecodeBatch, DecodeError, Input, ModelBackend, SamplingContext, SamplingParams,
    TokenId, VisionEmbedder,
};

/// Token the mock treats as end-of-generation.
pub const EOG_TOKEN: TokenId = 0;

#[derive(Default)]
struct MockShared {
    script: Mutex<VecDeque<TokenId>>,
    accepted: Mutex<Vec<(TokenId, bool)>>,
    decode_sizes: Mutex<Vec<usize>>,
    decode_errors: Mutex<VecDeque<DecodeError>>,
    kv_removals: Mutex<Vec<(usize, i32, i32)>>,
    kv_shifts: Mutex<Vec<(usize, i32, i32, i32)>>,
    kv_copies: Mutex<Vec<(usize, usize, i32, i32)>>,
    defrags: AtomicUsize,
}

pub struct MockBackend {
    shared: Arc<MockShared>,
    pieces: HashMap<TokenId, Vec<u8>>,
    seq_embedding: Option<Vec<f32>>,
    ith_embedding: Option<Vec<f32>>,
    add_bos: bool,
    partial_erase: bool,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MockShared::default()),
            pieces: HashMap::new(),
            seq_embedding: None,
            ith_embedding: None,
            add_bos: false,
            partial_erase: true,
        }
    }

    /// Queue tokens for `sample` to return, in order.
    pub fn with_script(self, tokens: &[TokenId]) -> Self {
        self.shared.script.lock().unwrap().extend(tokens);
        self
    }

    /// Register an explicit piece for a token.
    pub fn with_piece(mut self, token: TokenId, piece: &[u8]) -> Self {
        self.pieces.insert(token, piece.to_vec());
        self
    }

    pub fn with_seq_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.seq_embedding = Some(embedding);
        self
    }

    pub fn with_ith_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.ith_embedding = Some(embedding);
        self
    }

    pub fn with_add_bos(mut self) -> Self {
        self.add_bos = true;
        self
    }

    /// Refuse partial KV range erasure, like backends that only support
    /// clearing a whole sequence.
    pub fn without_partial_erase(mut self) -> Self {
        self.partial_erase = false;
        self
    }

    /// Queue decode failures to be returned before successful decodes.
    pub fn with_decode_errors(self, errors: Vec<DecodeError>) -> Self {
        self.shared.decode_errors.lock().unwrap().extend(errors);
        self
    }

    /// Append more tokens to the sampling script.
    pub fn push_script(&self, tokens: &[TokenId]) {
        self.shared.script.lock().unwrap().extend(tokens);
    }

    /// Batch sizes seen by successful `decode` calls.
    pub fn decode_sizes(&self) -> Vec<usize> {
        self.shared.decode_sizes.lock().unwrap().clone()
    }

    /// `(seq_id, p0, p1)` for every `kv_cache_seq_rm` call.
    pub fn kv_removals(&self) -> Vec<(usize, i32, i32)> {
        self.shared.kv_removals.lock().unwrap().clone()
    }

    /// `(seq_id, p0, p1, delta)` for every `kv_cache_seq_add` call.
    pub fn kv_shifts(&self) -> Vec<(usize, i32, i32, i32)> {
        self.shared.kv_shifts.lock().unwrap().clone()
    }

    /// `(src, dst, p0, p1)` for every `kv_cache_seq_cp` call.
    pub fn kv_copies(&self) -> Vec<(usize, usize, i32, i32)> {
        self.shared.kv_copies.lock().unwrap().clone()
    }

    /// `(token, apply_grammar)` for every sampler `accept`.
    pub fn accepted(&self) -> Vec<(TokenId, bool)> {
        self.shared.accepted.lock().unwrap().clone()
    }

    pub fn defrag_count(&self) -> usize {
        self.shared.defrags.load(Ordering::SeqCst)
    }
}

impl ModelBackend for MockBackend {
    fn tokenize(
        &self,
        text: &str,
        _add_bos: bool,
        _parse_special: bool,
    ) -> Result<Vec<TokenId>, BackendError> {
        Ok(text.chars().map(|c| c as TokenId).collect())
    }

    fn token_to_piece(&self, token: TokenId) -> Vec<u8> {
        if let Some(piece) = self.pieces.get(&token) {
            return piece.clone();
        }
        char::from_u32(token as u32)
            .map(|c| c.to_string().into_bytes())
            .unwrap_or_default()
    }

    fn token_is_eog(&self, token: TokenId) -> bool {
        token == EOG_TOKEN
    }

    fn add_bos_token(&self) -> bool {
        self.add_bos
    }

    fn n_embd(&self) -> usize {
        4
    }

    fn new_batch(
        &self,
        size: usize,
        _n_seq_max: usize,
        embd_dim: usize,
    ) -> Result<Box<dyn DecodeBatch>, BackendError> {
        Ok(Box::new(MockBatch {
            size,
            embd_dim,
            tokens: 0,
        }))
    }

    fn decode(&self, batch: &mut dyn DecodeBatch) -> Result<(), DecodeError> {
        if let Some(err) = self.shared.decode_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.shared
            .decode_sizes
            .lock()
            .unwrap()
            .push(batch.num_tokens());
        Ok(())
    }

    fn synchronize(&self) {}

    fn set_cross_attention(&self, _enabled: bool) {}

    fn kv_cache_seq_rm(&self, seq_id: usize, p0: i32, p1: i32) -> bool {
        self.shared
            .kv_removals
            .lock()
            .unwrap()
            .push((seq_id, p0, p1));
        if !self.partial_erase && (p0 != 0 || p1 != -1) {
            return false;
        }
        true
    }

    fn kv_cache_seq_add(&self, seq_id: usize, p0: i32, p1: i32, delta: i32) {
        self.shared
            .kv_shifts
            .lock()
            .unwrap()
            .push((seq_id, p0, p1, delta));
    }

    fn kv_cache_seq_cp(&self, src: usize, dst: usize, p0: i32, p1: i32) {
        self.shared
            .kv_copies
            .lock()
            .unwrap()
            .push((src, dst, p0, p1));
    }

    fn kv_cache_defrag(&self) {
        self.shared.defrags.fetch_add(1, Ordering::SeqCst);
    }

    fn new_sampling_context(
        &self,
        _params: &SamplingParams,
    ) -> Result<Box<dyn SamplingContext>, BackendError> {
        Ok(Box::new(MockSamplingContext {
            shared: self.shared.clone(),
        }))
    }

    fn embeddings_seq(&self, _seq_id: usize) -> Option<Vec<f32>> {
        self.seq_embedding.clone()
    }

    fn embeddings_ith(&self, _i_batch: usize) -> Option<Vec<f32>> {
        self.ith_embedding.clone()
    }
}

struct MockBatch {
    size: usize,
    embd_dim: usize,
    tokens: usize,
}

impl DecodeBatch for MockBatch {
    fn add(&mut self, _input: &Input, _pos: usize, _is_last: bool, _seq_id: usize) {
        self.tokens += 1;
    }

    fn num_tokens(&self) -> usize {
        self.tokens
    }

    fn size(&self) -> usize {
        self.size
    }

    fn is_embedding(&self) -> bool {
        self.embd_dim > 0
    }

    fn clear(&mut self) {
        self.tokens = 0;
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

struct MockSamplingContext {
    shared: Arc<MockShared>,
}

impl SamplingContext for MockSamplingContext {
    fn accept(&mut self, token: TokenId, apply_grammar: bool) {
        self.shared
            .accepted
            .lock()
            .unwrap()
            .push((token, apply_grammar));
    }

    fn sample(&mut self, _i_batch: usize) -> TokenId {
        self.shared
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(EOG_TOKEN)
    }
}

/// A deterministic vision embedder: every image becomes `vectors` copies of
/// a vector derived from the first payload byte.
pub struct MockEmbedder {
    vectors: usize,
    dim: usize,
    cross_attention: bool,
    single_image_batch: bool,
    calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(vectors: usize, dim: usize) -> Self {
        Self {
            vectors,
            dim,
            cross_attention: false,
            single_image_batch: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Behave like a cross-attention vision model.
    pub fn with_cross_attention(mut self) -> Self {
        self.cross_attention = true;
        self.single_image_batch = true;
        self
    }

    /// Number of times the embedder was actually invoked (cache misses).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VisionEmbedder for MockEmbedder {
    fn embed(&self, data: &[u8], _aspect_ratio_id: i32) -> Result<Vec<Vec<f32>>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let seed = f32::from(data[0]);
        Ok(vec![vec![seed; self.dim]; self.vectors])
    }

    fn batch_size(&self, configured: usize) -> usize {
        if self.single_image_batch {
            1
        } else {
            configured
        }
    }

    fn embed_size(&self) -> usize {
        self.dim
    }

    fn uses_cross_attention(&self) -> bool {
        self.cross_attention
    }
}
