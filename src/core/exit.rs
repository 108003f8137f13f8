// Exit handler registry for the DRM Testbed
//
// Cleanup routines registered here run when the process shuts down
// normally (through `ExitGuard` or the `atexit` hook) and when it is
// terminated by SIGINT, SIGTERM or SIGHUP. Handlers run newest first and may run more than once,
// so each one must be idempotent.

use std::io;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use log::{debug, warn};

use crate::error::{DrmError, Result};

/// Why the exit handlers are running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Normal,
    Signal,
}

type ExitHandler = Box<dyn Fn(ExitReason) + Send + Sync>;

/// Ordered set of cleanup routines
#[derive(Default)]
pub struct ExitHandlers {
    handlers: Mutex<Vec<ExitHandler>>,
}

impl ExitHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler; later registrations run first
    pub fn install(&self, handler: impl Fn(ExitReason) + Send + Sync + 'static) {
        self.lock().push(Box::new(handler));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every handler, newest first
    pub fn run(&self, reason: ExitReason) {
        let handlers = self.lock();
        for handler in handlers.iter().rev() {
            handler(reason);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ExitHandler>> {
        // A panicking handler must not stop the others from ever running
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The process-wide registry
pub fn global() -> Arc<ExitHandlers> {
    static GLOBAL: OnceLock<Arc<ExitHandlers>> = OnceLock::new();
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(ExitHandlers::new())))
}

static HOOKED: OnceLock<Arc<ExitHandlers>> = OnceLock::new();

extern "C" fn run_at_exit() {
    if let Some(handlers) = HOOKED.get() {
        handlers.run(ExitReason::Normal);
    }
}

/// Runs `handlers` when the process ends
///
/// Covers a normal return from `main` or a call to `process::exit`
/// (through `atexit`) as well as SIGINT, SIGTERM and SIGHUP. After a
/// signal the process exits with status 130 whichever of the three it was.
/// Only the first call per process installs anything; it returns
/// `Ok(true)`, later calls return `Ok(false)`.
pub fn install_process_hooks(handlers: Arc<ExitHandlers>) -> Result<bool> {
    if HOOKED.set(handlers).is_err() {
        return Ok(false);
    }

    // SAFETY: `run_at_exit` is a plain extern "C" fn with no arguments
    if unsafe { libc::atexit(run_at_exit) } != 0 {
        return Err(DrmError::Io(io::Error::new(io::ErrorKind::Other, "cannot register atexit hook")));
    }

    ctrlc::set_handler(|| {
        if let Some(handlers) = HOOKED.get() {
            handlers.run(ExitReason::Signal);
        }
        std::process::exit(128 + libc::SIGINT);
    })
    .map_err(|e| DrmError::Io(io::Error::new(io::ErrorKind::Other, format!("cannot install signal handler: {}", e))))?;

    debug!("exit handlers hooked to process exit and termination signals");
    Ok(true)
}

/// Runs the exit handlers when dropped
pub struct ExitGuard {
    handlers: Arc<ExitHandlers>,
}

impl ExitGuard {
    pub fn new(handlers: Arc<ExitHandlers>) -> Self {
        if let Err(e) = install_process_hooks(Arc::clone(&handlers)) {
            warn!("{}", e);
        }
        Self { handlers }
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.handlers.run(ExitReason::Normal);
    }
}
