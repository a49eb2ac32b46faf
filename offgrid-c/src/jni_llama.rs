// ============================================================================
// JNI exports for on-device chat
// ============================================================================
//
// Every call locks the process-wide engine for its whole duration, so the
// host may call from any thread without racing the llama.cpp handles.
//
// Class: com.example.offgrid.logic.NativeBridge
// ============================================================================

use jni::objects::{JObject, JString};
use jni::sys::{jint, jstring};
use jni::JNIEnv;
use once_cell::sync::Lazy;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

use crate::engine::Engine;
use crate::error::{BridgeError, Result};
use crate::llama_wrapper::LlamaCppBackend;
use crate::util::init_logging;
use common::EngineConfig;

static ENGINE: Lazy<Mutex<Engine<LlamaCppBackend>>> =
    Lazy::new(|| Mutex::new(Engine::new(LlamaCppBackend::new())));

fn engine() -> MutexGuard<'static, Engine<LlamaCppBackend>> {
    // A panic mid-call leaves the engine state consistent enough to unload.
    ENGINE.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_string(env: &mut JNIEnv, value: &JString) -> Result<String> {
    if value.is_null() {
        return Err(BridgeError::InvalidArgument("null string".to_string()));
    }
    env.get_string(value)
        .map(String::from)
        .map_err(|e| BridgeError::Jni(e.to_string()))
}

fn new_jstring(env: &mut JNIEnv, value: &str) -> jstring {
    match env.new_string(value) {
        Ok(s) => s.into_raw(),
        Err(e) => {
            error!("Failed to create Java string: {}", e);
            std::ptr::null_mut()
        }
    }
}

fn status_code(result: Result<()>) -> jint {
    match result {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

// ============================================================================
// Setup
// ============================================================================

/// Kotlin: `external fun init(libPath: String)`
///
/// `libPath` may name a directory holding `offgrid.toml` or a TOML file;
/// anything else selects the built-in configuration.
#[no_mangle]
pub extern "system" fn Java_com_example_offgrid_logic_NativeBridge_init(
    mut env: JNIEnv,
    _this: JObject,
    lib_path: JString,
) {
    init_logging();

    let lib_path = read_string(&mut env, &lib_path).unwrap_or_else(|e| {
        warn!("init: {}, using default configuration", e);
        String::new()
    });
    info!("init({})", lib_path);

    let config = EngineConfig::resolve(&lib_path);
    // Failures are logged and recorded in the status snapshot.
    let _ = engine().init(config);
}

/// Kotlin: `external fun load(modelPath: String): Int`
#[no_mangle]
pub extern "system" fn Java_com_example_offgrid_logic_NativeBridge_load(
    mut env: JNIEnv,
    _this: JObject,
    model_path: JString,
) -> jint {
    let result = read_string(&mut env, &model_path).and_then(|path| engine().load(&path));
    status_code(result)
}

/// Kotlin: `external fun prepare(): Int`
#[no_mangle]
pub extern "system" fn Java_com_example_offgrid_logic_NativeBridge_prepare(
    _env: JNIEnv,
    _this: JObject,
) -> jint {
    status_code(engine().prepare())
}

// ============================================================================
// Chat
// ============================================================================

/// Kotlin: `external fun processSystemPrompt(prompt: String): Int`
#[no_mangle]
pub extern "system" fn Java_com_example_offgrid_logic_NativeBridge_processSystemPrompt(
    mut env: JNIEnv,
    _this: JObject,
    prompt: JString,
) -> jint {
    let result =
        read_string(&mut env, &prompt).and_then(|text| engine().process_system_prompt(&text));
    status_code(result)
}

/// Kotlin: `external fun processUserPrompt(prompt: String, nPredict: Int): Int`
#[no_mangle]
pub extern "system" fn Java_com_example_offgrid_logic_NativeBridge_processUserPrompt(
    mut env: JNIEnv,
    _this: JObject,
    prompt: JString,
    n_predict: jint,
) -> jint {
    let result = read_string(&mut env, &prompt)
        .and_then(|text| engine().process_user_prompt(&text, n_predict));
    status_code(result)
}

/// Kotlin: `external fun generateNextToken(): String?`
///
/// Returns `null` at end of generation and on error.
#[no_mangle]
pub extern "system" fn Java_com_example_offgrid_logic_NativeBridge_generateNextToken(
    mut env: JNIEnv,
    _this: JObject,
) -> jstring {
    let next = engine().next_token();
    match next {
        Ok(Some(piece)) => new_jstring(&mut env, &piece),
        Ok(None) | Err(_) => std::ptr::null_mut(),
    }
}

// ============================================================================
// Cleanup
// ============================================================================

/// Kotlin: `external fun unload()`
#[no_mangle]
pub extern "system" fn Java_com_example_offgrid_logic_NativeBridge_unload(
    _env: JNIEnv,
    _this: JObject,
) {
    engine().unload();
}

/// Kotlin: `external fun shutdown()`
#[no_mangle]
pub extern "system" fn Java_com_example_offgrid_logic_NativeBridge_shutdown(
    _env: JNIEnv,
    _this: JObject,
) {
    engine().shutdown();
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Kotlin: `external fun systemInfo(): String`
///
/// JSON status snapshot: stage, loaded model, position, config.
#[no_mangle]
pub extern "system" fn Java_com_example_offgrid_logic_NativeBridge_systemInfo(
    mut env: JNIEnv,
    _this: JObject,
) -> jstring {
    let status = engine().status();
    let text = status
        .to_json()
        .unwrap_or_else(|e| format!("Error: {:#}", e));
    new_jstring(&mut env, &text)
}

/// Kotlin: `external fun benchModel(pp: Int, tg: Int, pl: Int, nr: Int): String`
#[no_mangle]
pub extern "system" fn Java_com_example_offgrid_logic_NativeBridge_benchModel(
    mut env: JNIEnv,
    _this: JObject,
    pp: jint,
    tg: jint,
    pl: jint,
    nr: jint,
) -> jstring {
    let report = engine().bench(pp, tg, pl, nr);
    let text = report.unwrap_or_else(|e| format!("Error: {}", e));
    new_jstring(&mut env, &text)
}
