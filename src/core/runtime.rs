// Process-wide lifecycle: idempotent init, guarded teardown, open-handle accounting.
use std::sync::Mutex;

use tracing::debug;

use crate::core::error::{Error, ErrorKind};

#[derive(Debug)]
struct RuntimeState {
    initialized: bool,
    open_handles: usize,
}

static RUNTIME: Mutex<RuntimeState> = Mutex::new(RuntimeState {
    initialized: false,
    open_handles: 0,
});

fn lock() -> std::sync::MutexGuard<'static, RuntimeState> {
    RUNTIME.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Initializes the runtime once; later calls are no-ops.
pub fn init() {
    let mut state = lock();
    if !state.initialized {
        state.initialized = true;
        debug!(version = version(), "runtime initialized");
    }
}

pub fn is_initialized() -> bool {
    lock().initialized
}

/// Returns the runtime to its uninitialized state. Fails while any database
/// handle is still open.
pub fn teardown() -> Result<(), Error> {
    let mut state = lock();
    if state.open_handles > 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("{} database handle(s) still open", state.open_handles))
            .with_hint("Close every database before teardown."));
    }
    if state.initialized {
        state.initialized = false;
        debug!("runtime torn down");
    }
    Ok(())
}

pub fn open_handles() -> usize {
    lock().open_handles
}

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub(crate) fn handle_opened() {
    let mut state = lock();
    state.initialized = true;
    state.open_handles += 1;
}

pub(crate) fn handle_closed() {
    let mut state = lock();
    state.open_handles = state.open_handles.saturating_sub(1);
}
