use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File looked up inside a directory handed to `EngineConfig::resolve`.
pub const CONFIG_FILENAME: &str = "offgrid.toml";

const DEFAULT_N_CTX: u32 = 2048;
const DEFAULT_N_BATCH: u32 = 512;
const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_SEED: u32 = 1234;

/// Parameters used when loading a model and preparing a session.
///
/// Every field has a default, so a TOML file only needs to name the
/// values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Context window in tokens.
    pub n_ctx: u32,
    /// Batch capacity; prompts are decoded in chunks of this size.
    pub n_batch: u32,
    /// Decode threads, 0 lets llama.cpp pick.
    pub n_threads: u32,
    pub n_gpu_layers: u32,
    pub temperature: f32,
    pub seed: u32,
    pub add_bos: bool,
    /// Check the GGUF header before handing the file to llama.cpp.
    pub validate_model: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n_ctx: DEFAULT_N_CTX,
            n_batch: DEFAULT_N_BATCH,
            n_threads: 0,
            n_gpu_layers: 0,
            temperature: DEFAULT_TEMPERATURE,
            seed: DEFAULT_SEED,
            add_bos: true,
            validate_model: true,
        }
    }
}

impl EngineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: EngineConfig = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_ctx == 0 {
            return Err(anyhow!("n_ctx must be greater than zero"));
        }
        if self.n_batch == 0 {
            return Err(anyhow!("n_batch must be greater than zero"));
        }
        if self.n_batch > self.n_ctx {
            return Err(anyhow!(
                "n_batch ({}) must not exceed n_ctx ({})",
                self.n_batch,
                self.n_ctx
            ));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(anyhow!("temperature must be finite and non-negative"));
        }
        Ok(())
    }

    /// Pick the configuration for the string the host passes to `init`.
    ///
    /// Empty means defaults, a directory is searched for `offgrid.toml`,
    /// anything else is read as a TOML file. A broken file falls back to
    /// the defaults after logging why.
    pub fn resolve(arg: &str) -> Self {
        let arg = arg.trim();
        if arg.is_empty() {
            return Self::default();
        }

        let candidate = PathBuf::from(arg);
        let file = if candidate.is_dir() {
            let file = candidate.join(CONFIG_FILENAME);
            if !file.is_file() {
                return Self::default();
            }
            file
        } else {
            candidate
        };

        match Self::from_file(&file) {
            Ok(config) => {
                info!("Loaded engine config from {:?}", file);
                config
            }
            Err(e) => {
                warn!("Ignoring engine config {:?}: {:#}", file, e);
                Self::default()
            }
        }
    }
}
