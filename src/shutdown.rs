//! Cooperative cancellation and signal handling
//!
//! Handlers and the ensure loop never get killed. They are handed a
//! `CancelToken` and are expected to poll it (or sleep on it) and return
//! promptly once it fires.
//!
//! # Signals
//! - First SIGINT/SIGTERM/SIGHUP: cancel the daemon token, the ensure loop
//!   wakes up and runs an orderly `Overlord::stop`.
//! - Second signal: exit immediately with `128 + signal`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

use crate::state::State;

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the token. Idempotent.
    pub fn cancel(&self) {
        let _guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for up to `timeout`, waking early on cancellation.
    ///
    /// Returns true if the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (_guard, _) = self
            .inner
            .cond
            .wait_timeout_while(guard, timeout, |_| !self.is_cancelled())
            .unwrap_or_else(PoisonError::into_inner);
        self.is_cancelled()
    }
}

/// Installs SIGINT/SIGTERM/SIGHUP handlers that cancel `token`.
///
/// The state's ensure loop is woken so it notices the cancellation without
/// waiting for its next tick. Call this once at program start.
pub fn init_signal_handlers(token: CancelToken, state: State) -> std::io::Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    thread::Builder::new()
        .name("overlord-signals".into())
        .spawn(move || {
            for sig in signals.forever() {
                let signal_name = match sig {
                    SIGINT => "SIGINT",
                    SIGTERM => "SIGTERM",
                    SIGHUP => "SIGHUP",
                    _ => "UNKNOWN",
                };

                if token.is_cancelled() {
                    warn!("Received second {} signal, exiting immediately", signal_name);
                    std::process::exit(128 + sig);
                }

                info!("Received {} signal, shutting down...", signal_name);
                token.cancel();
                state.ensure_now();
            }
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());

        token.cancel();
        assert!(other.is_cancelled());

        // Idempotent
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_wait_timeout_expires_without_cancel() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_timeout_wakes_on_cancel() {
        let token = CancelToken::new();
        let other = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            other.cancel();
        });

        let start = Instant::now();
        assert!(token.wait_timeout(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().expect("canceller thread");
    }
}
