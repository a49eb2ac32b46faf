//! Bridge engine: the singleton handle lifecycle behind the JNI exports
//!
//! The host drives the engine through a fixed sequence:
//! - `init` once per process
//! - `load` a model file
//! - `prepare` a session (context + batch + sampler)
//! - `process_*_prompt` followed by `next_token` until it returns `None`
//! - `unload` / `shutdown`
//!
//! Calls made out of order fail with a `BridgeError` instead of touching
//! library handles that do not exist yet.

mod bench;
mod session;

#[cfg(test)]
mod fake;

use crate::error::{BridgeError, Result};
use crate::util::gguf;
use common::{EngineConfig, EngineStage, ModelSummary, StatusSnapshot};
use session::SessionState;
use std::path::Path;
use tracing::{debug, error, info, warn};

pub type Token = i32;

/// Size figures the wrapped library reports for a loaded model.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModelStats {
    pub n_params: u64,
    pub n_ctx_train: u32,
    pub n_vocab: i32,
}

/// Process-wide entry points of the inference library.
pub trait InferenceBackend {
    type Model;
    type Session: InferenceSession;

    /// Human readable compute backend, used in reports.
    fn name(&self) -> &'static str;
    fn is_initialized(&self) -> bool;
    fn init(&mut self) -> Result<()>;
    fn load_model(&mut self, path: &Path, config: &EngineConfig) -> Result<Self::Model>;
    fn model_stats(&self, model: &Self::Model) -> ModelStats;
    /// The session may borrow from `model`; the engine drops every session
    /// before the model it was created from.
    fn create_session(&self, model: &Self::Model, config: &EngineConfig) -> Result<Self::Session>;
    fn shutdown(&mut self);
}

/// Context, batch and sampler of one prepared model.
pub trait InferenceSession {
    fn n_ctx(&self) -> u32;
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>>;
    fn batch_add(&mut self, token: Token, pos: i32, logits: bool) -> Result<()>;
    fn batch_len(&self) -> usize;
    /// Decode the pending batch. The batch is empty afterwards on success.
    fn decode(&mut self) -> Result<()>;
    fn clear_batch(&mut self);
    /// Sample from the most recent logits and feed the choice back to the sampler.
    fn sample(&mut self) -> Token;
    fn is_eog(&self, token: Token) -> bool;
    fn token_piece(&self, token: Token) -> Result<Vec<u8>>;
    fn clear_kv_cache(&mut self);
    /// Forget every cached position from `from` onwards.
    fn truncate_kv_cache(&mut self, from: i32);
}

struct ModelSlot<M> {
    handle: M,
    summary: ModelSummary,
}

pub struct Engine<B: InferenceBackend> {
    backend: B,
    config: EngineConfig,
    shut_down: bool,
    // Declared before `model` so it is dropped first.
    session: Option<SessionState<B::Session>>,
    model: Option<ModelSlot<B::Model>>,
    last_error: Option<String>,
}

impl<B: InferenceBackend> Engine<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            config: EngineConfig::default(),
            shut_down: false,
            session: None,
            model: None,
            last_error: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Initialize the wrapped library. Calling it again only swaps the
    /// configuration used by later `load` / `prepare` calls.
    pub fn init(&mut self, config: EngineConfig) -> Result<()> {
        let result = self.init_inner(config);
        self.track(result)
    }

    fn init_inner(&mut self, config: EngineConfig) -> Result<()> {
        config
            .validate()
            .map_err(|e| BridgeError::InvalidArgument(e.to_string()))?;
        self.config = config;

        if self.backend.is_initialized() {
            debug!("Backend already initialized, configuration updated");
            return Ok(());
        }

        self.backend.init()?;
        self.shut_down = false;
        info!("Native engine initialized ({})", self.backend.name());
        Ok(())
    }

    /// Load a model, replacing whatever was loaded before.
    pub fn load(&mut self, path: &str) -> Result<()> {
        let result = self.load_inner(path);
        self.track(result)
    }

    fn load_inner(&mut self, path: &str) -> Result<()> {
        if !self.backend.is_initialized() {
            return Err(BridgeError::BackendNotInitialized);
        }
        if path.trim().is_empty() {
            return Err(BridgeError::InvalidArgument("model path is empty".to_string()));
        }

        // The metadata walk covers the whole vocabulary, so it only runs
        // when validation is on.
        let metadata = if self.config.validate_model {
            Some(gguf::inspect(path).map_err(|e| BridgeError::InvalidModel(format!("{:#}", e)))?)
        } else {
            None
        };

        if self.model.is_some() {
            info!("Replacing previously loaded model");
            self.unload();
        }

        info!("Loading model from: {}", path);
        let handle = self.backend.load_model(Path::new(path), &self.config)?;
        let stats = self.backend.model_stats(&handle);

        let summary = ModelSummary {
            path: path.to_string(),
            name: metadata.as_ref().and_then(|m| m.name().map(str::to_string)),
            architecture: metadata
                .as_ref()
                .and_then(|m| m.architecture().map(str::to_string)),
            file_size: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            n_params: stats.n_params,
            n_ctx_train: stats.n_ctx_train,
            n_vocab: stats.n_vocab,
        };
        info!(
            "Model loaded: {} ({} params, {} vocab, {} train ctx)",
            summary.label(),
            summary.n_params,
            summary.n_vocab,
            summary.n_ctx_train
        );

        self.model = Some(ModelSlot { handle, summary });
        Ok(())
    }

    /// Create the context, batch and sampler for the loaded model and
    /// reset the position to zero.
    pub fn prepare(&mut self) -> Result<()> {
        let result = self.prepare_inner();
        self.track(result)
    }

    fn prepare_inner(&mut self) -> Result<()> {
        if !self.backend.is_initialized() {
            return Err(BridgeError::BackendNotInitialized);
        }
        let slot = self.model.as_ref().ok_or(BridgeError::NoModelLoaded)?;

        // Free the old context before allocating a new one.
        self.session = None;

        let session = self.backend.create_session(&slot.handle, &self.config)?;
        let state = SessionState::new(session, self.config.n_batch as usize);
        info!(
            "Session prepared: n_ctx={}, n_batch={}, temp={}, seed={}",
            state.n_ctx(),
            self.config.n_batch,
            self.config.temperature,
            self.config.seed
        );
        self.session = Some(state);
        Ok(())
    }

    /// Decode a user turn. `n_predict > 0` caps the tokens the following
    /// `next_token` calls will produce.
    pub fn process_user_prompt(&mut self, prompt: &str, n_predict: i32) -> Result<()> {
        let result = self.process_prompt(prompt).map(|state| {
            state.budget = u32::try_from(n_predict).ok().filter(|n| *n > 0);
        });
        self.track(result)
    }

    pub fn process_system_prompt(&mut self, prompt: &str) -> Result<()> {
        let result = self.process_prompt(prompt).map(|_| ());
        self.track(result)
    }

    fn process_prompt(&mut self, prompt: &str) -> Result<&mut SessionState<B::Session>> {
        let add_bos = self.config.add_bos;
        let state = self.session.as_mut().ok_or(BridgeError::NotPrepared)?;

        let tokens = state.session.tokenize(prompt, add_bos)?;
        debug!("Tokenized prompt into {} tokens", tokens.len());
        state.decode_prompt(&tokens)?;
        Ok(state)
    }

    /// Produce the next piece of text, or `None` once generation has ended.
    pub fn next_token(&mut self) -> Result<Option<String>> {
        let result = match self.session.as_mut() {
            Some(state) => state.step(),
            None => Err(BridgeError::NotPrepared),
        };
        self.track(result)
    }

    /// Free sampler, context, batch and model. Safe to call at any time.
    pub fn unload(&mut self) {
        if self.session.take().is_some() {
            debug!("Session freed");
        }
        if let Some(slot) = self.model.take() {
            info!("Model unloaded: {}", slot.summary.label());
        }
    }

    /// Unload everything and release the wrapped library.
    pub fn shutdown(&mut self) {
        self.unload();
        if self.backend.is_initialized() {
            self.backend.shutdown();
            info!("Native engine shut down");
        }
        self.shut_down = true;
    }

    pub fn stage(&self) -> EngineStage {
        if self.shut_down {
            return EngineStage::ShutDown;
        }
        if !self.backend.is_initialized() {
            return EngineStage::Uninitialized;
        }
        match (&self.session, &self.model) {
            (Some(state), _) if state.is_generating() => EngineStage::Generating,
            (Some(_), _) => EngineStage::Ready,
            (None, Some(_)) => EngineStage::ModelLoaded,
            (None, None) => EngineStage::Initialized,
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            stage: self.stage(),
            backend_ready: self.backend.is_initialized(),
            model: self.model.as_ref().map(|slot| slot.summary.clone()),
            position: self.session.as_ref().map_or(0, |s| s.position),
            n_ctx: self
                .session
                .as_ref()
                .map_or(self.config.n_ctx, |s| s.n_ctx()),
            remaining_budget: self.session.as_ref().and_then(|s| s.budget),
            last_error: self.last_error.clone(),
            config: self.config.clone(),
        }
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => {}
            Err(e) => {
                error!("{} (code {})", e, e.code());
                self.last_error = Some(e.to_string());
            }
        }
        result
    }
}

impl<B: InferenceBackend> Drop for Engine<B> {
    fn drop(&mut self) {
        if self.model.is_some() {
            warn!("Engine dropped with a model still loaded");
        }
        self.session = None;
        self.model = None;
    }
}
