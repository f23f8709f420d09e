//! Window-size change notifications
//!
//! SIGWINCH only flips an atomic flag. The session loop drains the flag and
//! does the real work (pty resize, child signal, upstream geometry) on its
//! own thread.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static SIGWINCH_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigwinch(_: libc::c_int) {
    SIGWINCH_RECEIVED.store(true, Ordering::SeqCst);
}

/// Edge-triggered "the terminal was resized" flag
#[derive(Clone, Copy)]
pub struct ResizeSignal {
    flag: &'static AtomicBool,
}

impl ResizeSignal {
    /// Install the SIGWINCH handler and watch the flag it sets
    pub fn install() -> nix::Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(handle_sigwinch),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGWINCH, &action) }?;
        Ok(Self {
            flag: &SIGWINCH_RECEIVED,
        })
    }

    /// A flag no signal handler writes to
    #[cfg(test)]
    pub fn detached() -> Self {
        Self {
            flag: Box::leak(Box::new(AtomicBool::new(false))),
        }
    }

    #[cfg(test)]
    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Clear the flag, reporting whether it was set.
    ///
    /// Clearing before acting means a resize landing while the previous one
    /// is handled sets the flag again instead of being lost.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}
