//! Signal wiring. `SIGINT`/`SIGTERM`/`SIGABRT` set the cooperative terminate
//! flag polled by the interpreter's loop/sleep nodes; `SIGBUS` recovery is
//! the mapping engine's own responsibility (`mapping::install_signal_handler`).

use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::environment;

static INSTALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn terminate_handler(_signum: c_int) {
    environment::set_terminate();
}

/// Installs the cooperative-cancellation handlers. Idempotent; call once at
/// startup, before the REPL loop begins reading statements.
pub fn install() {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    crate::mapping::install_signal_handler();
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = terminate_handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = 0;
        for signum in [libc::SIGINT, libc::SIGTERM, libc::SIGABRT] {
            libc::sigaction(signum, &sa, std::ptr::null_mut());
        }
    }
}
