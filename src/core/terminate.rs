//! Termination requests (SIGTERM, SIGHUP, SIGINT)
//!
//! The default actions would kill the process with the operator's terminal
//! still in raw mode. The handlers only record which signal arrived; the
//! session loop and the reconnect loop notice it and unwind normally, so
//! every guard runs.

use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Signals that end a session
const TERMINATING: [Signal; 3] = [Signal::SIGTERM, Signal::SIGHUP, Signal::SIGINT];

static TERMINATION_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_termination(signal: libc::c_int) {
    TERMINATION_SIGNAL.store(signal, Ordering::SeqCst);
}

/// Level-triggered "please stop" flag. Once set it stays set.
#[derive(Clone, Copy)]
pub struct TerminateSignal {
    flag: &'static AtomicI32,
}

impl TerminateSignal {
    pub fn install() -> nix::Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(handle_termination),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in TERMINATING {
            unsafe { sigaction(signal, &action) }?;
        }
        Ok(Self {
            flag: &TERMINATION_SIGNAL,
        })
    }

    /// A flag no signal handler writes to
    #[cfg(test)]
    pub fn detached() -> Self {
        Self {
            flag: Box::leak(Box::new(AtomicI32::new(0))),
        }
    }

    #[cfg(test)]
    pub fn raise(&self, signal: Signal) {
        self.flag.store(signal as i32, Ordering::SeqCst);
    }

    /// The most recent termination signal, if any arrived
    pub fn received(&self) -> Option<Signal> {
        match self.flag.load(Ordering::SeqCst) {
            0 => None,
            raw => Signal::try_from(raw).ok(),
        }
    }
}
