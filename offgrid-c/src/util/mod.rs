pub mod cmd;
pub mod gguf;
pub mod utf8;

use std::sync::Once;
use tracing::debug;
#[cfg(not(target_os = "android"))]
use tracing::Level;

static LOGGING: Once = Once::new();

/// Tag the bridge logs under in logcat.
pub const LOG_TAG: &str = "OFFGRID_NATIVE";

pub fn init_logging() {
    LOGGING.call_once(install_subscriber);
}

#[cfg(not(target_os = "android"))]
fn install_subscriber() {
    // Use DEBUG level for debug builds, INFO for release builds

    #[cfg(not(debug_assertions))]
    let result = tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_ansi(!cfg!(windows))
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .try_init();

    #[cfg(debug_assertions)]
    let result = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_ansi(!cfg!(windows))
        .with_target(false)
        // Debug builds: show thread info, file, and line number
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .try_init();

    // The host process (or a test harness) may already own the global subscriber.
    if result.is_ok() {
        debug!("Logging initialized");
    }
}

// No tracing subscriber on Android: tracing's `log` feature forwards events
// to the `log` facade, which android_logger writes to logcat.
#[cfg(target_os = "android")]
fn install_subscriber() {
    let level = if cfg!(debug_assertions) {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(level)
            .with_tag(LOG_TAG),
    );
    debug!("Logging initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
        assert!(LOGGING.is_completed());
    }
}
