// SPDX-License-Identifier: AGPL-3.0

//! Logging setup and deduplicated diagnostics

use colored::*;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Warnings base URL
pub const WARNINGS_BASE_URL: &str = "https://github.com/evmsym/evmsym/wiki/warnings";

/// Codes attached to warnings that point at a wiki entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    SymbolicCode,
    SolverUnknown,
}

impl ErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCode::SymbolicCode => "symbolic-code",
            ErrorCode::SolverUnknown => "solver-unknown",
        }
    }

    pub fn url(&self) -> String {
        format!("{}#{}", WARNINGS_BASE_URL, self.code())
    }
}

static UNIQUE_MESSAGES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Record a message; returns false when it was already recorded
fn first_time(message: &str) -> bool {
    let mut messages = UNIQUE_MESSAGES.lock().unwrap_or_else(|e| e.into_inner());
    messages.insert(message.to_string())
}

/// Map a `-v` count to a default filter directive
pub fn verbosity_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins over the verbosity level when set. Calling this twice is
/// harmless: the second installation attempt is ignored.
pub fn init_tracing(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_filter(verbosity)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Log a warning with an error code
pub fn warn_code(error_code: ErrorCode, msg: &str, allow_duplicate: bool) {
    let full_msg = format!("{} (see {})", msg, error_code.url());
    if allow_duplicate || first_time(&full_msg) {
        tracing::warn!(code = error_code.code(), "{}", full_msg);
    }
}

/// Print a fatal error for the user to stderr
pub fn error(text: &str) {
    eprintln!("{}", text.red());
}
