//! Structured logging setup.
//!
//! Library code logs through `tracing` macros; this module installs the
//! subscriber that writes them out.
//!
//! Log levels:
//! - ERROR: failures that prevent an operation from completing
//! - WARN: failed attempts, opened circuits, halted plans
//! - INFO: run start/finish, registrations, circuit recovery
//! - DEBUG: dispatch decisions, level progress, selection results
//!
//! Debug mode is enabled with `init_with_debug(true)` or `FEDERATION_DEBUG=1`.
//! `FEDERATION_LOG` overrides the filter with any `EnvFilter` directive.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "FEDERATION_DEBUG";
const FILTER_ENV: &str = "FEDERATION_LOG";

static LOG_PATH: OnceLock<Option<PathBuf>> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging to ~/.federation/federation.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Only the first call installs a subscriber. Falls back to stderr when the
/// log file cannot be created.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var(DEBUG_ENV)
        .map(|v| is_truthy(&v))
        .unwrap_or(false);
    let debug_enabled = debug || env_debug;
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    LOG_PATH.get_or_init(|| install(debug_enabled));
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the log file, if logging goes to a file.
pub fn log_path() -> Option<&'static Path> {
    LOG_PATH.get().and_then(|p| p.as_deref())
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "federation=debug"
    } else {
        "federation=info"
    }
}

fn install(debug: bool) -> Option<PathBuf> {
    let filter = EnvFilter::try_from_env(FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    match open_log_file() {
        Some((path, file)) => {
            let installed = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .is_ok();
            installed.then_some(path)
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
            None
        }
    }
}

fn open_log_file() -> Option<(PathBuf, File)> {
    let dir = dirs::home_dir()?.join(".federation");
    std::fs::create_dir_all(&dir).ok()?;
    let path = dir.join("federation.log");
    // Truncate on startup
    let file = File::create(&path).ok()?;
    Some((path, file))
}
