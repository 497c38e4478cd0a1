//! Cancellation on SIGINT/SIGTERM.
//!
//! Signal handlers only flip a process-wide flag. Long-running loops (the
//! download wait loop, archive unpacking) poll it and unwind through normal
//! error returns, which lets temp files clean themselves up on drop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use anyhow::Result;
#[cfg(unix)]
use anyhow::Context;

/// Shared cancellation flag; `true` means stop as soon as possible.
pub type CancelFlag = Arc<AtomicBool>;

static INTERRUPTED: LazyLock<CancelFlag> = LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// The flag raised by [`install_handlers`].
pub fn process_flag() -> CancelFlag {
    Arc::clone(&INTERRUPTED)
}

pub fn is_cancelled(flag: &CancelFlag) -> bool {
    flag.load(Ordering::SeqCst)
}

/// Route SIGINT and SIGTERM to the process flag.
///
/// The handler is one-shot: the first signal requests a clean stop, a
/// second one gets the default action and terminates the process.
#[cfg(unix)]
pub fn install_handlers() -> Result<()> {
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

    extern "C" fn handler(_sig: nix::libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }

    // Initialize before any handler can run.
    LazyLock::force(&INTERRUPTED);

    let action = SigAction::new(
        SigHandler::Handler(handler),
        SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only performs an atomic store.
        unsafe { signal::sigaction(sig, &action) }
            .with_context(|| format!("registering {sig} handler"))?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn install_handlers() -> Result<()> {
    Ok(())
}
