//! SIGINT/SIGTERM handling for the foreground `run` command

use std::sync::atomic::{AtomicBool, Ordering};
use vless_manager_core::Result;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// True once a termination signal has arrived
pub fn requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

#[cfg(unix)]
extern "C" fn on_signal(_signal: std::os::raw::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Route SIGINT and SIGTERM to the shutdown flag
#[cfg(unix)]
pub fn install() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use vless_manager_core::Error;

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic, which is async-signal-safe
        unsafe { sigaction(signal, &action) }
            .map_err(|e| Error::process(format!("cannot install {} handler: {}", signal, e), ""))?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn install() -> Result<()> {
    Ok(())
}
