//! llama.cpp behind the engine traits, through `llama-cpp-2`.

use crate::engine::{InferenceBackend, InferenceSession, ModelStats, Token};
use crate::error::{BridgeError, Result};
use common::EngineConfig;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, LogOptions, TokenToStringError};
use std::num::NonZeroU32;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Once;
use tracing::{debug, info, warn};

static LOG_FORWARDING: Once = Once::new();

// First guess for a detokenized piece; longer pieces are retried.
const PIECE_BUFFER: usize = 32;

#[derive(Default)]
pub struct LlamaCppBackend {
    backend: Option<LlamaBackend>,
}

impl LlamaCppBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A model pinned on the heap so sessions can borrow it for `'static`.
pub struct ModelHandle {
    ptr: NonNull<LlamaModel>,
}

// SAFETY: the model is only reached through the engine, which serializes
// every call behind one mutex.
unsafe impl Send for ModelHandle {}

impl ModelHandle {
    fn new(model: LlamaModel) -> Self {
        Self {
            ptr: NonNull::from(Box::leak(Box::new(model))),
        }
    }

    fn get(&self) -> &LlamaModel {
        // SAFETY: `ptr` came from `Box::leak` and is freed only in `drop`.
        unsafe { self.ptr.as_ref() }
    }

    /// # Safety
    /// Everything holding the returned reference must be dropped before
    /// this handle.
    unsafe fn get_static(&self) -> &'static LlamaModel {
        &*self.ptr.as_ptr()
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        // SAFETY: allocated by `Box::new` in `ModelHandle::new`, no sessions left.
        drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
    }
}

pub struct LlamaSession {
    sampler: LlamaSampler,
    ctx: LlamaContext<'static>,
    model: &'static LlamaModel,
    batch: LlamaBatch<'static>,
}

// SAFETY: see `ModelHandle`; the context is never shared between threads.
unsafe impl Send for LlamaSession {}

fn backend_name() -> &'static str {
    if cfg!(feature = "cuda") {
        "CUDA"
    } else if cfg!(feature = "metal") {
        "Metal"
    } else if cfg!(feature = "vulkan") {
        "Vulkan"
    } else {
        "CPU"
    }
}

impl InferenceBackend for LlamaCppBackend {
    type Model = ModelHandle;
    type Session = LlamaSession;

    fn name(&self) -> &'static str {
        backend_name()
    }

    fn is_initialized(&self) -> bool {
        self.backend.is_some()
    }

    fn init(&mut self) -> Result<()> {
        LOG_FORWARDING.call_once(|| send_logs_to_tracing(LogOptions::default()));

        let backend =
            LlamaBackend::init().map_err(|e| BridgeError::BackendInit(e.to_string()))?;
        self.backend = Some(backend);
        Ok(())
    }

    fn load_model(&mut self, path: &Path, config: &EngineConfig) -> Result<ModelHandle> {
        let backend = self
            .backend
            .as_ref()
            .ok_or(BridgeError::BackendNotInitialized)?;

        let model_params = LlamaModelParams::default().with_n_gpu_layers(config.n_gpu_layers);
        let model = LlamaModel::load_from_file(backend, path, &model_params)
            .map_err(|e| BridgeError::ModelLoad(e.to_string()))?;
        debug!("llama.cpp model size: {} bytes", model.size());
        Ok(ModelHandle::new(model))
    }

    fn model_stats(&self, model: &ModelHandle) -> ModelStats {
        let model = model.get();
        ModelStats {
            n_params: model.n_params(),
            n_ctx_train: model.n_ctx_train(),
            n_vocab: model.n_vocab(),
        }
    }

    fn create_session(&self, model: &ModelHandle, config: &EngineConfig) -> Result<LlamaSession> {
        let backend = self
            .backend
            .as_ref()
            .ok_or(BridgeError::BackendNotInitialized)?;
        let n_ctx = NonZeroU32::new(config.n_ctx)
            .ok_or_else(|| BridgeError::InvalidArgument("n_ctx must be non-zero".to_string()))?;

        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(config.n_batch);
        if config.n_threads > 0 {
            ctx_params = ctx_params
                .with_n_threads(config.n_threads as i32)
                .with_n_threads_batch(config.n_threads as i32);
        }

        // SAFETY: the engine drops every session before the model handle.
        let model = unsafe { model.get_static() };
        let ctx = model
            .new_context(backend, ctx_params)
            .map_err(|e| BridgeError::ContextCreate(e.to_string()))?;

        let sampler = LlamaSampler::chain_simple([
            LlamaSampler::temp(config.temperature),
            LlamaSampler::dist(config.seed),
        ]);

        Ok(LlamaSession {
            sampler,
            ctx,
            model,
            batch: LlamaBatch::new(config.n_batch as usize, 1),
        })
    }

    fn shutdown(&mut self) {
        if self.backend.take().is_some() {
            info!("llama.cpp backend freed");
        }
    }
}

impl InferenceSession for LlamaSession {
    fn n_ctx(&self) -> u32 {
        self.ctx.n_ctx()
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>> {
        let add_bos = if add_bos {
            AddBos::Always
        } else {
            AddBos::Never
        };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| BridgeError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn batch_add(&mut self, token: Token, pos: i32, logits: bool) -> Result<()> {
        add_to_batch(&mut self.batch, token, pos, logits)
    }

    fn batch_len(&self) -> usize {
        self.batch.n_tokens().max(0) as usize
    }

    fn decode(&mut self) -> Result<()> {
        if self.batch.n_tokens() == 0 {
            return Ok(());
        }
        self.ctx
            .decode(&mut self.batch)
            .map_err(|e| BridgeError::Decode(e.to_string()))?;
        self.batch.clear();
        Ok(())
    }

    fn clear_batch(&mut self) {
        self.batch.clear();
    }

    fn sample(&mut self) -> Token {
        let token = self.sampler.sample(&self.ctx, -1);
        self.sampler.accept(token);
        token.0
    }

    fn is_eog(&self, token: Token) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn token_piece(&self, token: Token) -> Result<Vec<u8>> {
        let token = LlamaToken(token);
        match self
            .model
            .token_to_piece_bytes(token, PIECE_BUFFER, true, None)
        {
            Ok(bytes) => Ok(bytes),
            Err(TokenToStringError::InsufficientBufferSpace(needed)) => self
                .model
                .token_to_piece_bytes(token, needed.unsigned_abs() as usize, true, None)
                .map_err(|e| BridgeError::Detokenize(e.to_string())),
            Err(e) => Err(BridgeError::Detokenize(e.to_string())),
        }
    }

    fn clear_kv_cache(&mut self) {
        self.ctx.clear_kv_cache();
    }

    fn truncate_kv_cache(&mut self, from: i32) {
        let from = u32::try_from(from).unwrap_or(0);
        if let Err(e) = self.ctx.clear_kv_cache_seq(Some(0), Some(from), None) {
            warn!("Failed to drop KV cells from position {}: {}", from, e);
        }
    }
}

/// Queue one token on sequence 0. Fails once the batch holds `n_batch` tokens.
fn add_to_batch(batch: &mut LlamaBatch, token: Token, pos: i32, logits: bool) -> Result<()> {
    batch
        .add(LlamaToken(token), pos, &[0], logits)
        .map_err(|e| BridgeError::Decode(format!("batch add failed: {}", e)))
}
