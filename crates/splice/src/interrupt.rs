//! Ctrl-C handling.
//!
//! The first SIGINT asks the run to stop at the next patch boundary. The
//! summary of what ran so far is still printed.

use splice_core::orchestrator::CancelToken;
use std::sync::OnceLock;

static CANCEL: OnceLock<CancelToken> = OnceLock::new();

/// The process-wide cancel token.
pub fn cancel_token() -> CancelToken {
    CANCEL.get_or_init(CancelToken::new).clone()
}

#[cfg(unix)]
extern "C" fn on_interrupt(_signal: libc::c_int) {
    if let Some(token) = CANCEL.get() {
        token.cancel();
    }
    // a second Ctrl-C kills the process
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
    }
}

/// Route SIGINT to the cancel token and return it.
pub fn install_handler() -> CancelToken {
    let token = cancel_token();
    #[cfg(unix)]
    unsafe {
        libc::signal(
            libc::SIGINT,
            on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
    token
}
