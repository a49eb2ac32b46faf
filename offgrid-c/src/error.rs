use thiserror::Error;

/// Everything a bridge call can fail with.
///
/// The host only distinguishes zero from non-zero, but each variant keeps
/// its own code so logcat output and host-side logs can be matched up.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BridgeError {
    #[error("Backend not initialized")]
    BackendNotInitialized,

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid model file: {0}")]
    InvalidModel(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Context not prepared")]
    NotPrepared,

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Prompt of {needed} tokens does not fit: {available} of {n_ctx} context slots left")]
    ContextOverflow {
        needed: usize,
        available: usize,
        n_ctx: u32,
    },

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("No logits available, submit a prompt first")]
    NoPendingLogits,

    #[error("Detokenization failed: {0}")]
    Detokenize(String),

    #[error("JNI error: {0}")]
    Jni(String),
}

impl BridgeError {
    /// Non-zero status returned across the JNI boundary.
    pub fn code(&self) -> i32 {
        match self {
            BridgeError::BackendNotInitialized => 1,
            BridgeError::BackendInit(_) => 2,
            BridgeError::InvalidArgument(_) => 3,
            BridgeError::InvalidModel(_) => 4,
            BridgeError::ModelLoad(_) => 5,
            BridgeError::NoModelLoaded => 6,
            BridgeError::ContextCreate(_) => 7,
            BridgeError::NotPrepared => 8,
            BridgeError::Tokenization(_) => 9,
            BridgeError::ContextOverflow { .. } => 10,
            BridgeError::Decode(_) => 11,
            BridgeError::NoPendingLogits => 12,
            BridgeError::Detokenize(_) => 13,
            BridgeError::Jni(_) => 14,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
