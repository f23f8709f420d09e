//! Readiness waits over `poll(2)`.
//!
//! Used by the session event loop (unbounded wait over several descriptors)
//! and by the bounded single-descriptor waits of the handshake, the outbound
//! socket write and pty back-pressure.

use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

bitflags! {
    /// Interest in, or readiness of, a descriptor
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Ready: u8 {
        const READABLE = 0b0000_0001;
        const WRITABLE = 0b0000_0010;
        /// POLLERR / POLLNVAL
        const ERROR    = 0b0000_0100;
        /// POLLHUP
        const HANGUP   = 0b0000_1000;
    }
}

impl Ready {
    /// Any condition that means the descriptor is broken or going away
    pub fn is_faulted(&self) -> bool {
        self.intersects(Ready::ERROR | Ready::HANGUP)
    }

    fn to_poll_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.contains(Ready::READABLE) {
            flags |= PollFlags::POLLIN;
        }
        if self.contains(Ready::WRITABLE) {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }

    fn from_poll_flags(flags: PollFlags) -> Self {
        let mut ready = Ready::empty();
        if flags.contains(PollFlags::POLLIN) {
            ready |= Ready::READABLE;
        }
        if flags.contains(PollFlags::POLLOUT) {
            ready |= Ready::WRITABLE;
        }
        if flags.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            ready |= Ready::ERROR;
        }
        if flags.contains(PollFlags::POLLHUP) {
            ready |= Ready::HANGUP;
        }
        ready
    }
}

/// Block until at least one descriptor is ready.
///
/// Returns one `Ready` per entry of `interests`, in the same order. An
/// interrupted wait surfaces as `Err(Errno::EINTR)` so the caller can decide
/// what a signal means to it.
pub fn wait_any(interests: &[(BorrowedFd<'_>, Ready)]) -> nix::Result<Vec<Ready>> {
    let mut fds: Vec<PollFd<'_>> = interests
        .iter()
        .map(|(fd, interest)| PollFd::new(*fd, interest.to_poll_flags()))
        .collect();

    poll(&mut fds, PollTimeout::NONE)?;

    Ok(fds
        .iter()
        .map(|fd| Ready::from_poll_flags(fd.revents().unwrap_or(PollFlags::empty())))
        .collect())
}

/// Wait on a single descriptor for at most `timeout`.
///
/// The descriptor is always polled at least once, so a zero timeout is a
/// readiness check. Signals do not cut the wait short: the poll is resumed
/// with whatever time is left. `Ok(None)` means the deadline passed with
/// nothing ready.
pub fn wait_one(
    fd: BorrowedFd<'_>,
    interest: Ready,
    timeout: Duration,
) -> nix::Result<Option<Ready>> {
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut fds = [PollFd::new(fd, interest.to_poll_flags())];
        match poll(&mut fds, clamp_timeout(remaining)) {
            Ok(0) if remaining.is_zero() => return Ok(None),
            Ok(0) => continue,
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                return Ok(Some(Ready::from_poll_flags(revents)));
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Round up to whole milliseconds, capped at what one poll call accepts
fn clamp_timeout(remaining: Duration) -> PollTimeout {
    let millis = (remaining.as_nanos() + 999_999) / 1_000_000;
    PollTimeout::from(millis.min(u16::MAX as u128) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_wait_one_times_out() {
        let (a, _b) = UnixStream::pair().unwrap();
        let start = Instant::now();
        let ready = wait_one(a.as_fd(), Ready::READABLE, Duration::from_millis(50)).unwrap();
        assert_eq!(ready, None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_one_readable() {
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();
        let ready = wait_one(a.as_fd(), Ready::READABLE, Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert!(ready.contains(Ready::READABLE));
        assert!(!ready.is_faulted());
    }

    #[test]
    fn test_wait_any_preserves_order() {
        let (a, _a_peer) = UnixStream::pair().unwrap();
        let (b, mut b_peer) = UnixStream::pair().unwrap();
        b_peer.write_all(b"y").unwrap();

        let ready = wait_any(&[
            (a.as_fd(), Ready::READABLE),
            (b.as_fd(), Ready::READABLE),
        ])
        .unwrap();

        assert_eq!(ready.len(), 2);
        assert!(ready[0].is_empty());
        assert!(ready[1].contains(Ready::READABLE));
    }

    #[test]
    fn test_zero_timeout_still_polls() {
        let (a, _b) = UnixStream::pair().unwrap();
        let ready = wait_one(a.as_fd(), Ready::WRITABLE, Duration::ZERO).unwrap();
        assert!(ready.is_some_and(|r| r.contains(Ready::WRITABLE)));

        let idle = wait_one(a.as_fd(), Ready::READABLE, Duration::ZERO).unwrap();
        assert_eq!(idle, None);
    }

    #[test]
    fn test_peer_close_is_readable() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let ready = wait_one(a.as_fd(), Ready::READABLE, Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert!(ready.contains(Ready::READABLE));
    }

    extern "C" fn ignore_signal(_: libc::c_int) {}

    #[test]
    fn test_wait_one_survives_signal() {
        use nix::sys::pthread::{pthread_kill, pthread_self};
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
        use std::thread;

        // SIGUSR2 is unused elsewhere; a handler is needed for poll to see EINTR
        let action = SigAction::new(
            SigHandler::Handler(ignore_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGUSR2, &action) }.unwrap();

        let (a, mut b) = UnixStream::pair().unwrap();
        let waiter = pthread_self();

        let helper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            pthread_kill(waiter, Signal::SIGUSR2).unwrap();
            thread::sleep(Duration::from_millis(50));
            b.write_all(b"z").unwrap();
            b
        });

        let ready = wait_one(a.as_fd(), Ready::READABLE, Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert!(ready.contains(Ready::READABLE));
        helper.join().unwrap();
    }
}
