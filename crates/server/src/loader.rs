//! Model loading on a background thread.
//!
//! The HTTP server starts serving immediately; `/health` reports
//! `loading model` until the backend is up, and handlers wait on the
//! scheduler watch channel. Load failures are logged and flip the status
//! to `server error` instead of being dropped.

use std::sync::Arc;

use tokio::sync::watch;

use kvserve_core::backend::ModelBackend;
use kvserve_core::scheduler::Scheduler;

use crate::api::{HealthState, ServerStatus};
use crate::config::ServerConfig;

/// Load the model, build the scheduler, and start the decode loop, all off
/// the serving runtime. The scheduler is published through `tx` once it is
/// accepting sequences.
pub fn spawn(
    cfg: ServerConfig,
    health: Arc<HealthState>,
    tx: watch::Sender<Option<Arc<Scheduler>>>,
) {
    std::thread::spawn(move || {
        let backend = match load_backend(&cfg) {
            Ok(backend) => backend,
            Err(e) => {
                tracing::error!(error = %e, model = %cfg.model.display(), "failed to load model");
                health.set_status(ServerStatus::Error);
                return;
            }
        };
        health.set_progress(1.0);

        let scheduler = match Scheduler::new(
            backend,
            None,
            cfg.kv_size,
            cfg.batch_size,
            cfg.parallel,
            cfg.multi_user_cache,
        ) {
            Ok(scheduler) => Arc::new(scheduler),
            Err(e) => {
                tracing::error!(error = %e, "failed to create input cache");
                health.set_status(ServerStatus::Error);
                return;
            }
        };

        let runner = scheduler.clone();
        std::thread::Builder::new()
            .name("decode-loop".into())
            .spawn(move || {
                if let Err(e) = runner.run() {
                    tracing::error!(error = %e, "decode loop failed");
                }
            })
            .expect("failed to spawn the decode loop thread");

        health.set_status(ServerStatus::Ready);
        tracing::info!(model = %cfg.model.display(), "model loaded");
        let _ = tx.send(Some(scheduler));
    });
}

#[cfg(feature = "llama")]
fn load_backend(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn ModelBackend>> {
    use kvserve_core::backend::llama::{LlamaRunner, LlamaRunnerConfig};

    if cfg.mmproj.is_some() {
        anyhow::bail!("the llama backend does not support multimodal projectors");
    }
    if !cfg.tensor_split.is_empty() {
        tracing::warn!("--tensor-split is not supported by the llama backend; ignoring");
    }

    let lora_scale = 1.0;
    let runner = LlamaRunner::load(&LlamaRunnerConfig {
        model_path: cfg.model.clone(),
        kv_size: cfg.kv_size,
        batch_size: cfg.batch_size,
        parallel: cfg.parallel,
        gpu_layers: cfg.gpu_layers,
        main_gpu: cfg.main_gpu,
        use_mmap: cfg.use_mmap,
        use_mlock: cfg.use_mlock,
        flash_attention: cfg.flash_attention,
        threads: cfg.threads,
        lora: cfg.lora.iter().cloned().map(|p| (p, lora_scale)).collect(),
    })?;
    Ok(Arc::new(runner))
}

#[cfg(not(feature = "llama"))]
fn load_backend(_cfg: &ServerConfig) -> anyhow::Result<Arc<dyn ModelBackend>> {
    anyhow::bail!("this build has no model backend; rebuild with `--features llama`")
}
