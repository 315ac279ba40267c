//! [`ModelBackend`] adapter over the `llama-cpp-2` bindings.
//!
//! The model and backend handles are leaked to the process lifetime, which
//! matches how the server uses them: one model per process, freed at exit.
//! The context is shared behind a mutex between decode and sampling; the
//! scheduler serializes all calls, so the lock is uncontended.
//!
//! The bindings expose no projector API, so this adapter has no vision
//! support: embedding batches are refused and cross-attention toggles are
//! ignored.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use super::{
    BackendError, DecodeBatch, DecodeError, Input, ModelBackend, SamplingContext, SamplingParams,
    TokenId,
};

pub struct LlamaRunnerConfig {
    pub model_path: PathBuf,
    pub kv_size: usize,
    pub batch_size: usize,
    pub parallel: usize,
    pub gpu_layers: i32,
    pub main_gpu: i32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub flash_attention: bool,
    pub threads: i32,
    /// LoRA adapters as `(path, scale)` pairs.
    pub lora: Vec<(PathBuf, f32)>,
}

pub struct LlamaRunner {
    model: &'static LlamaModel,
    ctx: Arc<Mutex<LlamaContext<'static>>>,
}

impl LlamaRunner {
    /// Load the model and create the shared decode context.
    pub fn load(cfg: &LlamaRunnerConfig) -> Result<Self, BackendError> {
        let backend: &'static LlamaBackend = Box::leak(Box::new(
            LlamaBackend::init().map_err(|e| BackendError::Load(e.to_string()))?,
        ));
        llama_cpp_2::send_logs_to_tracing(
            llama_cpp_2::LogOptions::default().with_logs_enabled(true),
        );

        let model_params = LlamaModelParams::default()
            .with_n_gpu_layers(cfg.gpu_layers as u32)
            .with_main_gpu(cfg.main_gpu)
            .with_use_mlock(cfg.use_mlock)
            .with_use_mmap(cfg.use_mmap);

        let model: &'static LlamaModel = Box::leak(Box::new(
            LlamaModel::load_from_file(backend, &cfg.model_path, &model_params)
                .map_err(|e| BackendError::Load(e.to_string()))?,
        ));

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(cfg.kv_size as u32))
            .with_n_batch((cfg.batch_size * cfg.parallel) as u32)
            .with_n_threads(cfg.threads)
            .with_n_threads_batch(cfg.threads)
            .with_flash_attention(cfg.flash_attention)
            .with_embeddings(true);

        let mut ctx = model
            .new_context(backend, ctx_params)
            .map_err(|e| BackendError::Load(e.to_string()))?;

        for (path, scale) in &cfg.lora {
            let mut adapter = model
                .lora_adapter_init(path)
                .map_err(|e| BackendError::Load(format!("lora {}: {e}", path.display())))?;
            ctx.lora_adapter_set(&mut adapter, *scale)
                .map_err(|e| BackendError::Load(format!("lora {}: {e}", path.display())))?;
        }

        Ok(Self {
            model,
            ctx: Arc::new(Mutex::new(ctx)),
        })
    }

    fn build_sampler(&self, p: &SamplingParams) -> LlamaSampler {
        let mut chain: Vec<LlamaSampler> = Vec::new();

        if !p.grammar.is_empty() {
            chain.push(LlamaSampler::grammar(self.model, &p.grammar, "root"));
        }
        chain.push(LlamaSampler::penalties(
            p.repeat_last_n,
            p.repeat_penalty,
            p.frequency_penalty,
            p.presence_penalty,
        ));

        match p.mirostat {
            1 => {
                chain.push(LlamaSampler::temp(p.temperature));
                chain.push(LlamaSampler::mirostat(
                    self.model.n_vocab(),
                    p.seed,
                    p.mirostat_tau,
                    p.mirostat_eta,
                    100,
                ));
            }
            2 => {
                chain.push(LlamaSampler::temp(p.temperature));
                chain.push(LlamaSampler::mirostat_v2(
                    p.seed,
                    p.mirostat_tau,
                    p.mirostat_eta,
                ));
            }
            _ => {
                if p.temperature <= 0.0 {
                    chain.push(LlamaSampler::greedy());
                } else {
                    chain.push(LlamaSampler::top_k(p.top_k));
                    chain.push(LlamaSampler::typical(p.typical_p, 1));
                    chain.push(LlamaSampler::top_p(p.top_p, 1));
                    chain.push(LlamaSampler::min_p(p.min_p, 1));
                    chain.push(LlamaSampler::temp(p.temperature));
                    chain.push(LlamaSampler::dist(p.seed));
                }
            }
        }

        LlamaSampler::chain_simple(chain)
    }
}

impl ModelBackend for LlamaRunner {
    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        _parse_special: bool,
    ) -> Result<Vec<TokenId>, BackendError> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| BackendError::Tokenize(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn token_to_piece(&self, token: TokenId) -> Vec<u8> {
        self.model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .unwrap_or_default()
    }

    fn token_is_eog(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn add_bos_token(&self) -> bool {
        self.model.add_bos_token()
    }

    fn n_embd(&self) -> usize {
        self.model.n_embd() as usize
    }

    fn new_batch(
        &self,
        size: usize,
        n_seq_max: usize,
        embd_dim: usize,
    ) -> Result<Box<dyn DecodeBatch>, BackendError> {
        if embd_dim > 0 {
            return Err(BackendError::Unsupported("embedding batches"));
        }
        Ok(Box::new(LlamaDecodeBatch {
            batch: LlamaBatch::new(size, n_seq_max as i32),
            size,
        }))
    }

    fn decode(&self, batch: &mut dyn DecodeBatch) -> Result<(), DecodeError> {
        let Some(batch) = batch.as_any_mut().downcast_mut::<LlamaDecodeBatch>() else {
            return Err(DecodeError::Backend("foreign batch type".into()));
        };
        let mut ctx = self.ctx.lock().unwrap();
        ctx.decode(&mut batch.batch).map_err(|e| match e {
            llama_cpp_2::DecodeError::NoKvCacheSlot => DecodeError::KvCacheFull,
            other => DecodeError::Backend(other.to_string()),
        })
    }

    fn synchronize(&self) {}

    fn set_cross_attention(&self, _enabled: bool) {}

    fn kv_cache_seq_rm(&self, seq_id: usize, p0: i32, p1: i32) -> bool {
        let mut ctx = self.ctx.lock().unwrap();
        let p0 = u32::try_from(p0).ok();
        let p1 = u32::try_from(p1).ok();
        ctx.clear_kv_cache_seq(Some(seq_id as u32), p0, p1).is_ok()
    }

    fn kv_cache_seq_add(&self, seq_id: usize, p0: i32, p1: i32, delta: i32) {
        let mut ctx = self.ctx.lock().unwrap();
        let p0 = u32::try_from(p0).ok();
        let p1 = u32::try_from(p1).ok();
        if let Err(e) = ctx.kv_cache_seq_add(seq_id as i32, p0, p1, delta) {
            tracing::error!(seq_id, delta, error = %e, "kv cache shift failed");
        }
    }

    fn kv_cache_seq_cp(&self, src: usize, dst: usize, p0: i32, p1: i32) {
        let mut ctx = self.ctx.lock().unwrap();
        let p0 = u32::try_from(p0).ok();
        let p1 = u32::try_from(p1).ok();
        if let Err(e) = ctx.copy_kv_cache_seq(src as i32, dst as i32, p0, p1) {
            tracing::error!(src, dst, error = %e, "kv cache fork failed");
        }
    }

    fn kv_cache_defrag(&self) {
        let mut ctx = self.ctx.lock().unwrap();
        ctx.kv_cache_defrag();
    }

    fn new_sampling_context(
        &self,
        params: &SamplingParams,
    ) -> Result<Box<dyn SamplingContext>, BackendError> {
        Ok(Box::new(LlamaSamplingContext {
            sampler: self.build_sampler(params),
            ctx: self.ctx.clone(),
        }))
    }

    fn embeddings_seq(&self, seq_id: usize) -> Option<Vec<f32>> {
        let ctx = self.ctx.lock().unwrap();
        ctx.embeddings_seq_ith(seq_id as i32)
            .ok()
            .map(<[f32]>::to_vec)
    }

    fn embeddings_ith(&self, i_batch: usize) -> Option<Vec<f32>> {
        let ctx = self.ctx.lock().unwrap();
        ctx.embeddings_ith(i_batch as i32).ok().map(<[f32]>::to_vec)
    }
}

struct LlamaDecodeBatch {
    batch: LlamaBatch,
    size: usize,
}

impl DecodeBatch for LlamaDecodeBatch {
    fn add(&mut self, input: &Input, pos: usize, is_last: bool, seq_id: usize) {
        match input {
            Input::Token(t) => {
                if let Err(e) =
                    self.batch
                        .add(LlamaToken(*t), pos as i32, &[seq_id as i32], is_last)
                {
                    tracing::error!(pos, seq_id, error = %e, "failed to add token to batch");
                }
            }
            Input::Embed(_) => {
                tracing::error!("embedding input routed to a token batch");
            }
        }
    }

    fn num_tokens(&self) -> usize {
        self.batch.n_tokens() as usize
    }

    fn size(&self) -> usize {
        self.size
    }

    fn is_embedding(&self) -> bool {
        false
    }

    fn clear(&mut self) {
        self.batch.clear();
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

struct LlamaSamplingContext {
    sampler: LlamaSampler,
    ctx: Arc<Mutex<LlamaContext<'static>>>,
}

impl SamplingContext for LlamaSamplingContext {
    fn accept(&mut self, token: TokenId, _apply_grammar: bool) {
        self.sampler.accept(LlamaToken(token));
    }

    fn sample(&mut self, i_batch: usize) -> TokenId {
        let ctx = self.ctx.lock().unwrap();
        self.sampler.sample(&ctx, i_batch as i32).0
    }
}
