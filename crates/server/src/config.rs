//! CLI flags and the resolved server configuration.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "kvserve-server",
    about = "HTTP inference server multiplexing one model across KV cache slots"
)]
pub struct ServerArgs {
    /// Path to the model file
    #[arg(long, default_value = "models/modelfile")]
    pub model: PathBuf,

    /// Context (KV cache) size in tokens, shared across parallel sequences
    #[arg(long = "kv-size", default_value_t = 8192)]
    pub kv_size: usize,

    /// Decode batch size
    #[arg(long = "batch-size", default_value_t = 512)]
    pub batch_size: usize,

    /// Number of sequences to handle simultaneously
    #[arg(long, default_value_t = 4)]
    pub parallel: usize,

    /// Port to expose the server on
    #[arg(long, default_value_t = 60000)]
    pub port: u16,

    /// Main GPU
    #[arg(long = "main-gpu", default_value_t = 0)]
    pub main_gpu: i32,

    /// Fraction of the model to offload to each GPU, comma-separated
    #[arg(long = "tensor-split", default_value = "")]
    pub tensor_split: String,

    /// Do not memory-map the model (slower load, may reduce pageouts)
    #[arg(long = "no-mmap")]
    pub no_mmap: bool,

    /// Keep the model in RAM rather than swapping or compressing
    #[arg(long)]
    pub mlock: bool,

    /// Path to the multimodal projector file
    #[arg(long = "mmproj")]
    pub mmproj: Option<PathBuf>,

    /// Enable flash attention
    #[arg(
        long = "flash-attn",
        default_value_t = true,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub flash_attn: bool,

    /// Optimize the input cache for many users sharing prompt prefixes
    #[arg(long = "multiuser-cache")]
    pub multiuser_cache: bool,

    /// Path to a LoRA adapter file (can be specified multiple times)
    #[arg(long = "lora")]
    pub lora: Vec<PathBuf>,

    /// Number of layers to offload to the GPU
    #[arg(long = "gpu-layers", default_value_t = 17)]
    pub gpu_layers: i32,

    /// Number of threads to use during generation
    #[arg(long, default_value_t = 12)]
    pub threads: i32,
}

/// Parsed and normalized configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub model: PathBuf,
    pub model_name: String,
    pub kv_size: usize,
    pub batch_size: usize,
    pub parallel: usize,
    pub port: u16,
    pub main_gpu: i32,
    pub tensor_split: Vec<f32>,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub mmproj: Option<PathBuf>,
    pub flash_attention: bool,
    pub multi_user_cache: bool,
    pub lora: Vec<PathBuf>,
    pub gpu_layers: i32,
    pub threads: i32,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        let model_name = args
            .model
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());

        // Memory-mapping is incompatible with applying LoRA adapters.
        let use_mmap = !args.no_mmap && args.lora.is_empty();

        Self {
            model_name,
            tensor_split: parse_tensor_split(&args.tensor_split),
            use_mmap,
            use_mlock: args.mlock,
            kv_size: args.kv_size,
            batch_size: args.batch_size,
            parallel: args.parallel,
            port: args.port,
            main_gpu: args.main_gpu,
            mmproj: args.mmproj,
            flash_attention: args.flash_attn,
            multi_user_cache: args.multiuser_cache,
            lora: args.lora,
            gpu_layers: args.gpu_layers,
            threads: args.threads,
            model: args.model,
        }
    }
}

fn parse_tensor_split(raw: &str) -> Vec<f32> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(',')
        .map(|part| part.trim().parse().unwrap_or(0.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_flags() {
        let args = ServerArgs::parse_from(["kvserve-server"]);
        assert_eq!(args.kv_size, 8192);
        assert_eq!(args.batch_size, 512);
        assert_eq!(args.parallel, 4);
        assert_eq!(args.port, 60000);
        assert!(args.flash_attn);
        assert!(!args.multiuser_cache);
    }

    #[test]
    fn lora_flag_is_repeatable() {
        let args =
            ServerArgs::parse_from(["kvserve-server", "--lora", "a.bin", "--lora", "b.bin"]);
        assert_eq!(args.lora.len(), 2);
    }

    #[test]
    fn tensor_split_parses_proportions() {
        assert_eq!(parse_tensor_split("0.5,0.5"), vec![0.5, 0.5]);
        assert_eq!(parse_tensor_split(""), Vec::<f32>::new());
        assert_eq!(parse_tensor_split("1,x"), vec![1.0, 0.0]);
    }

    #[test]
    fn model_name_derives_from_path_stem() {
        let cfg: ServerConfig =
            ServerArgs::parse_from(["kvserve-server", "--model", "models/llama3.2.gguf"]).into();
        assert_eq!(cfg.model_name, "llama3.2");
    }

    #[test]
    fn lora_disables_mmap() {
        let cfg: ServerConfig =
            ServerArgs::parse_from(["kvserve-server", "--lora", "a.bin"]).into();
        assert!(!cfg.use_mmap);
    }
}
