//! Ctrl+C handling.
//!
//! While a turn runs, Ctrl+C cancels it through its token. With no turn in
//! flight, or on a second Ctrl+C, the process exits with status 130.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static ACTIVE_TURN: OnceLock<Mutex<Option<CancellationToken>>> = OnceLock::new();

#[derive(Debug)]
pub struct InterruptedError;

impl std::fmt::Display for InterruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Interrupted")
    }
}

impl std::error::Error for InterruptedError {}

fn active_turn() -> &'static Mutex<Option<CancellationToken>> {
    ACTIVE_TURN.get_or_init(|| Mutex::new(None))
}

/// Installs the Ctrl+C handler.
///
/// # Errors
/// Returns an error if a handler is already registered.
pub fn init() -> Result<()> {
    ctrlc::set_handler(trigger_ctrl_c).context("set Ctrl+C handler")
}

fn trigger_ctrl_c() {
    if INTERRUPTED.swap(true, Ordering::SeqCst) {
        std::process::exit(130);
    }

    let token = active_turn().lock().ok().and_then(|guard| guard.clone());
    match token {
        Some(token) => token.cancel(),
        None => std::process::exit(130),
    }
}

/// Cancellation scope for one turn; clears itself on drop.
pub struct TurnGuard {
    token: CancellationToken,
}

impl TurnGuard {
    pub fn begin() -> Self {
        let token = CancellationToken::new();
        INTERRUPTED.store(false, Ordering::SeqCst);
        if let Ok(mut active) = active_turn().lock() {
            *active = Some(token.clone());
        }
        Self { token }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn was_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = active_turn().lock() {
            *active = None;
        }
        INTERRUPTED.store(false, Ordering::SeqCst);
    }
}
