//! Signal handling for graceful node shutdown.
//!
//! SIGTERM and SIGINT set an atomic flag that the supervisor polls; the
//! telemetry threads observe the same flag between cycles.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Signals the node handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM - graceful termination request.
    Terminate,
    /// SIGINT - interrupt (Ctrl+C).
    Interrupt,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Shutdown state shared between the signal poller, the supervisor, and
/// the telemetry threads.
#[derive(Debug, Default)]
pub struct ShutdownState {
    requested: AtomicBool,
    signal_count: AtomicU32,
}

impl ShutdownState {
    /// Create a state with no shutdown requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }

    /// Request shutdown (callable from any thread).
    pub fn request_shutdown(&self) {
        self.requested.store(true, Ordering::Relaxed);
    }

    /// The flag telemetry loops poll.
    pub fn flag(&self) -> &AtomicBool {
        &self.requested
    }

    fn record_signal(&self, kind: SignalKind) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        info!(signal = %kind, "Shutdown signal received");
    }

    /// Signals received so far.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }
}

static SIGTERM_FLAG: AtomicBool = AtomicBool::new(false);
static SIGINT_FLAG: AtomicBool = AtomicBool::new(false);

/// Handle owning the shared shutdown state.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    state: Arc<ShutdownState>,
}

impl SignalHandler {
    /// Create a handler and register SIGTERM/SIGINT on Unix.
    pub fn new() -> std::io::Result<Self> {
        let handler = Self {
            state: Arc::new(ShutdownState::new()),
        };

        #[cfg(unix)]
        handler.register_unix_handlers()?;

        Ok(handler)
    }

    /// Handler without OS registration (for tests and embedding).
    pub fn manual() -> Self {
        Self {
            state: Arc::new(ShutdownState::new()),
        }
    }

    #[cfg(unix)]
    fn register_unix_handlers(&self) -> std::io::Result<()> {
        use std::os::raw::c_int;

        extern "C" fn sigterm_handler(_: c_int) {
            SIGTERM_FLAG.store(true, Ordering::Relaxed);
        }

        extern "C" fn sigint_handler(_: c_int) {
            SIGINT_FLAG.store(true, Ordering::Relaxed);
        }

        // Handlers only touch atomics; a poller forwards them to the state
        let state = Arc::clone(&self.state);
        std::thread::Builder::new()
            .name("telem-signals".into())
            .spawn(move || loop {
                if SIGTERM_FLAG.swap(false, Ordering::Relaxed) {
                    state.record_signal(SignalKind::Terminate);
                    state.request_shutdown();
                }
                if SIGINT_FLAG.swap(false, Ordering::Relaxed) {
                    state.record_signal(SignalKind::Interrupt);
                    state.request_shutdown();
                }
                if state.shutdown_requested() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            })?;

        // SAFETY: both handlers are async-signal-safe (atomic stores only).
        unsafe {
            libc::signal(libc::SIGTERM, sigterm_handler as libc::sighandler_t);
            libc::signal(libc::SIGINT, sigint_handler as libc::sighandler_t);
        }

        debug!("Unix signal handlers registered");
        Ok(())
    }

    /// Whether shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested()
    }

    /// Request shutdown without a signal.
    pub fn request_shutdown(&self) {
        info!("Manual shutdown requested");
        self.state.request_shutdown();
    }

    /// Shared state, for handing the stop flag to telemetry threads.
    pub fn state(&self) -> &Arc<ShutdownState> {
        &self.state
    }
}

/// Block until shutdown is requested or `timeout` expires.
///
/// Returns `true` if shutdown was requested.
pub fn wait_for_shutdown(handler: &SignalHandler, timeout: Duration) -> bool {
    let start = Instant::now();
    let poll_interval = Duration::from_millis(50);

    while start.elapsed() < timeout {
        if handler.shutdown_requested() {
            return true;
        }
        std::thread::sleep(poll_interval.min(timeout.saturating_sub(start.elapsed())));
    }

    handler.shutdown_requested()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_state_default() {
        let state = ShutdownState::new();
        assert!(!state.shutdown_requested());
        assert!(!state.flag().load(Ordering::Relaxed));
        assert_eq!(state.signal_count(), 0);
    }

    #[test]
    fn test_manual_shutdown_sets_shared_flag() {
        let handler = SignalHandler::manual();
        let state = Arc::clone(handler.state());
        assert!(!handler.shutdown_requested());

        handler.request_shutdown();
        assert!(handler.shutdown_requested());
        assert!(state.flag().load(Ordering::Relaxed));
    }

    #[test]
    fn test_wait_for_shutdown_times_out() {
        let handler = SignalHandler::manual();
        assert!(!wait_for_shutdown(&handler, Duration::from_millis(20)));

        handler.request_shutdown();
        assert!(wait_for_shutdown(&handler, Duration::from_millis(20)));
    }

    #[test]
    fn test_signal_kind_display() {
        assert_eq!(SignalKind::Terminate.to_string(), "SIGTERM");
        assert_eq!(SignalKind::Interrupt.to_string(), "SIGINT");
    }
}
