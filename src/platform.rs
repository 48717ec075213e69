//! Process-wide, one-time initialization.
//!
//! Channels write into pipes and sockets whose peer may already be gone.
//! With the default `SIGPIPE` disposition such a write kills the whole
//! process; channel writes instead expect `EPIPE` so they can stop quietly.

use std::sync::Once;

use nix::sys::signal::{signal, SigHandler, Signal};

static INIT: Once = Once::new();

/// Run the one-time platform setup. Cheap and idempotent after the first call.
pub fn ensure_initialized() {
    INIT.call_once(|| {
        // SAFETY: installing SIG_IGN does not run any handler code.
        match unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
            Ok(_) => tracing::debug!("SIGPIPE ignored for channel writes"),
            Err(e) => tracing::warn!("Could not ignore SIGPIPE: {}", e),
        }
    });
}

/// Whether [`ensure_initialized`] has completed.
pub fn is_initialized() -> bool {
    INIT.is_completed()
}
