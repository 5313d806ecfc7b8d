//! Ctrl-C handling for apply and destroy
//!
//! The first interrupt asks the executor to stop launching changes; changes
//! already running finish and their state is kept. A second interrupt falls
//! through to the default handler and kills the process.

use reconcile::CancelToken;
use std::sync::OnceLock;

static TOKEN: OnceLock<CancelToken> = OnceLock::new();

#[cfg(unix)]
extern "C" fn on_interrupt(_signal: libc::c_int) {
    if let Some(token) = TOKEN.get() {
        token.cancel();
    }
    // Restore the default so a second Ctrl-C terminates
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
    }
}

/// Install the SIGINT handler and return the token it cancels
#[cfg(unix)]
pub fn install() -> CancelToken {
    let token = TOKEN.get_or_init(CancelToken::new).clone();
    let handler = on_interrupt as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
    token
}

#[cfg(not(unix))]
pub fn install() -> CancelToken {
    TOKEN.get_or_init(CancelToken::new).clone()
}
