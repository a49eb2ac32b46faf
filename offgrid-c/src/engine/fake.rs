//! Scriptable in-memory backend for engine tests.

use super::{InferenceBackend, InferenceSession, ModelStats, Token};
use crate::error::{BridgeError, Result};
use common::EngineConfig;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub const BOS: Token = 1;
pub const EOG: Token = 2;
/// Tokens from here on stand for single bytes: `FIRST_BYTE_TOKEN + byte`.
pub const FIRST_BYTE_TOKEN: Token = 10;

#[derive(Debug, Default)]
pub struct FakeState {
    pub backend_inits: usize,
    pub backend_frees: usize,
    pub models_loaded: usize,
    pub sessions_created: usize,
    pub decode_calls: usize,
    pub decoded: Vec<Vec<(Token, i32, bool)>>,
    pub pending_batch: usize,
    pub kv_clears: usize,
    pub truncations: Vec<i32>,
    pub drops: Vec<&'static str>,
    script: VecDeque<Token>,
    fail_decode_at: Option<usize>,
    fail_next_load: bool,
}

/// Shared handle the test keeps to steer and observe the fake.
#[derive(Clone, Default)]
pub struct FakeControl(Arc<Mutex<FakeState>>);

impl FakeControl {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.0.lock().unwrap()
    }

    /// Tokens `sample` returns, in order. An empty script samples EOG.
    pub fn script(&self, tokens: &[Token]) {
        self.state().script.extend(tokens.iter().copied());
    }

    /// Make the `call`-th decode (1-based, counted from backend creation) fail.
    pub fn fail_decode_at(&self, call: usize) {
        self.state().fail_decode_at = Some(call);
    }

    pub fn fail_next_load(&self) {
        self.state().fail_next_load = true;
    }
}

pub struct FakeBackend {
    control: FakeControl,
    initialized: bool,
}

impl FakeBackend {
    pub fn new(control: FakeControl) -> Self {
        Self {
            control,
            initialized: false,
        }
    }
}

pub struct FakeModel {
    control: FakeControl,
}

impl Drop for FakeModel {
    fn drop(&mut self) {
        self.control.state().drops.push("model");
    }
}

pub struct FakeSession {
    control: FakeControl,
    n_ctx: u32,
    batch: Vec<(Token, i32, bool)>,
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.control.state().drops.push("session");
    }
}

impl InferenceBackend for FakeBackend {
    type Model = FakeModel;
    type Session = FakeSession;

    fn name(&self) -> &'static str {
        "fake"
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn init(&mut self) -> Result<()> {
        self.control.state().backend_inits += 1;
        self.initialized = true;
        Ok(())
    }

    fn load_model(&mut self, path: &Path, _config: &EngineConfig) -> Result<FakeModel> {
        let mut state = self.control.state();
        if std::mem::take(&mut state.fail_next_load) {
            return Err(BridgeError::ModelLoad(format!("{} is corrupt", path.display())));
        }
        state.models_loaded += 1;
        Ok(FakeModel {
            control: self.control.clone(),
        })
    }

    fn model_stats(&self, _model: &FakeModel) -> ModelStats {
        ModelStats {
            n_params: 494_032_768,
            n_ctx_train: 32768,
            n_vocab: 151_936,
        }
    }

    fn create_session(&self, model: &FakeModel, config: &EngineConfig) -> Result<FakeSession> {
        model.control.state().sessions_created += 1;
        Ok(FakeSession {
            control: self.control.clone(),
            n_ctx: config.n_ctx,
            batch: Vec::new(),
        })
    }

    fn shutdown(&mut self) {
        self.control.state().backend_frees += 1;
        self.initialized = false;
    }
}

impl InferenceSession for FakeSession {
    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(|b| FIRST_BYTE_TOKEN + b as Token));
        Ok(tokens)
    }

    fn batch_add(&mut self, token: Token, pos: i32, logits: bool) -> Result<()> {
        self.batch.push((token, pos, logits));
        self.control.state().pending_batch = self.batch.len();
        Ok(())
    }

    fn batch_len(&self) -> usize {
        self.batch.len()
    }

    fn decode(&mut self) -> Result<()> {
        let mut state = self.control.state();
        state.decode_calls += 1;
        if state.fail_decode_at == Some(state.decode_calls) {
            return Err(BridgeError::Decode("injected failure".to_string()));
        }
        state.decoded.push(std::mem::take(&mut self.batch));
        state.pending_batch = 0;
        Ok(())
    }

    fn clear_batch(&mut self) {
        self.batch.clear();
        self.control.state().pending_batch = 0;
    }

    fn sample(&mut self) -> Token {
        self.control.state().script.pop_front().unwrap_or(EOG)
    }

    fn is_eog(&self, token: Token) -> bool {
        token == EOG
    }

    fn token_piece(&self, token: Token) -> Result<Vec<u8>> {
        match u8::try_from(token - FIRST_BYTE_TOKEN) {
            Ok(byte) => Ok(vec![byte]),
            Err(_) => Ok(Vec::new()),
        }
    }

    fn clear_kv_cache(&mut self) {
        self.control.state().kv_clears += 1;
    }

    fn truncate_kv_cache(&mut self, from: i32) {
        self.control.state().truncations.push(from);
    }
}
