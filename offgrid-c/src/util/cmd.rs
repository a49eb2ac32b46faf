use anyhow::{Context, Result};
use clap::Parser;
use common::EngineConfig;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an offline coding assistant.";

/// Drive the bridge engine from a terminal, the same way the app does.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the GGUF model file
    #[arg(short, long)]
    pub model: String,

    /// TOML file overriding the engine configuration
    #[arg(short('f'), long)]
    pub config: Option<String>,

    /// User prompt to answer
    #[arg(short, long, required_unless_present = "bench")]
    pub prompt: Option<String>,

    /// System prompt decoded before the user prompt
    #[arg(short, long)]
    pub system_prompt: Option<String>,

    /// Maximum tokens to generate (0 = until end of generation)
    #[arg(short, long, default_value_t = 512)]
    pub n_predict: i32,

    /// Wrap the prompts in ChatML turns before decoding
    #[arg(long)]
    pub chatml: bool,

    /// Run the throughput benchmark instead of chatting
    #[arg(long)]
    pub bench: bool,

    /// Benchmark prompt length
    #[arg(long, default_value_t = 512)]
    pub pp: i32,

    /// Benchmark generation length
    #[arg(long, default_value_t = 128)]
    pub tg: i32,

    /// Benchmark repetitions
    #[arg(long, default_value_t = 3)]
    pub nr: i32,
}

impl Args {
    pub fn engine_config(&self) -> Result<EngineConfig> {
        match &self.config {
            Some(path) => EngineConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path)),
            None => Ok(EngineConfig::default()),
        }
    }
}

/// Format one ChatML exchange ending with an open assistant turn.
pub fn chatml_prompt(system: &str, user: &str) -> String {
    format!(
        "<|im_start|>system\n{}\n<|im_end|>\n<|im_start|>user\n{}<|im_end|>\n<|im_start|>assistant\n",
        system, user
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_required_unless_bench() {
        assert!(Args::try_parse_from(["offgrid-c", "-m", "model.gguf"]).is_err());

        let args = Args::try_parse_from(["offgrid-c", "-m", "model.gguf", "--bench"]).unwrap();
        assert!(args.bench);
        assert_eq!((args.pp, args.tg, args.nr), (512, 128, 3));

        let args =
            Args::try_parse_from(["offgrid-c", "-m", "model.gguf", "-p", "hi", "-n", "16"]).unwrap();
        assert_eq!(args.prompt.as_deref(), Some("hi"));
        assert_eq!(args.n_predict, 16);
    }

    #[test]
    fn test_engine_config_defaults_without_file() {
        let args = Args::try_parse_from(["offgrid-c", "-m", "m.gguf", "-p", "x"]).unwrap();
        assert_eq!(args.engine_config().unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_chatml_prompt_opens_assistant_turn() {
        let prompt = chatml_prompt(DEFAULT_SYSTEM_PROMPT, "Reverse a list in Rust");
        assert!(prompt.starts_with("<|im_start|>system\nYou are an offline coding assistant.\n"));
        assert!(prompt.contains("<|im_start|>user\nReverse a list in Rust<|im_end|>\n"));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }
}
