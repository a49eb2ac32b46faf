// ============================================================================
// OFFGRID native bridge
// ============================================================================
//
// llama.cpp chat engine for the Android app, exported over JNI as
// com.example.offgrid.logic.NativeBridge. Built as `libai_chat.so`.
// ============================================================================

pub mod engine;
pub mod error;
pub mod util;

#[cfg(feature = "llama")]
pub mod jni_llama;
#[cfg(feature = "llama")]
pub mod llama_wrapper;

pub use engine::Engine;
pub use error::{BridgeError, Result};
