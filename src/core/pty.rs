//! Unix pseudo-terminal wrapper
//!
//! Allocates a pty pair, runs the broadcast command on the slave side as a
//! session leader, and exposes the non-blocking master to the event loop.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::openpty;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{read, write, Pid};
use thiserror::Error;
use tracing::{debug, info};

use super::geometry::Geometry;
use super::poller::{self, Ready};

/// How long a single back-pressure wait on the master may take before we
/// look again. The child draining its input is not bounded by us.
const WRITE_WAIT: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open pty: {0}")]
    Open(#[source] Errno),

    #[error("Failed to configure pty: {0}")]
    Configure(#[source] Errno),

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to resize pty: {0}")]
    Resize(#[source] io::Error),

    #[error("Failed to signal child process: {0}")]
    Signal(#[source] Errno),

    #[error("Failed to read from pty: {0}")]
    Read(#[source] Errno),

    #[error("Failed to write to pty: {0}")]
    Write(#[source] Errno),
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Outcome of a non-blocking read from the master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyRead {
    /// Bytes were placed at the start of the buffer
    Data(usize),
    /// Nothing to read right now
    Pending,
    /// The child side is gone (EOF, or EIO once the slave is closed)
    Closed,
}

/// A pty pair with the child process running on its slave side
pub struct PtySession {
    master: OwnedFd,
    child: Child,
    geometry: Geometry,
}

impl PtySession {
    /// Spawn `program` with `args` on a fresh pty of the given size.
    pub fn spawn(program: &str, args: &[String], geometry: Geometry) -> Result<Self> {
        let winsize = geometry.to_winsize();
        let pty = openpty(&winsize, None).map_err(PtyError::Open)?;
        // Neither end may leak into this or any other spawned process; the
        // child gets the slave through dup2, which clears the flag.
        set_cloexec(&pty.master)?;
        set_cloexec(&pty.slave)?;
        let slave_fd = pty.slave.as_raw_fd();

        let mut command = Command::new(program);
        command.args(args).env("TERMCAST", "1");

        // Runs in the forked child: only async-signal-safe calls here.
        unsafe {
            command.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                for target in 0..=2 {
                    if libc::dup2(slave_fd, target) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                }
                if slave_fd > 2 {
                    libc::close(slave_fd);
                } else if libc::fcntl(slave_fd, libc::F_SETFD, 0) == -1 {
                    // dup2 onto itself keeps close-on-exec
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|source| PtyError::Spawn {
            command: program.to_string(),
            source,
        })?;

        drop(pty.slave);
        set_nonblocking(&pty.master)?;

        info!("Spawned `{}` (pid {}) on a {} pty", program, child.id(), geometry);

        Ok(Self {
            master: pty.master,
            child,
            geometry,
        })
    }

    /// Master descriptor for readiness waits
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Read child output without blocking
    pub fn read(&mut self, buf: &mut [u8]) -> Result<PtyRead> {
        loop {
            match read(&self.master, buf) {
                Ok(0) => return Ok(PtyRead::Closed),
                Ok(n) => return Ok(PtyRead::Data(n)),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(PtyRead::Pending),
                // Linux reports a closed slave as EIO rather than EOF
                Err(Errno::EIO) => return Ok(PtyRead::Closed),
                Err(e) => return Err(PtyError::Read(e)),
            }
        }
    }

    /// Write all of `data` to the child's input, waiting out back-pressure
    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            match write(&self.master, &data[written..]) {
                Ok(n) => written += n,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    poller::wait_one(self.master.as_fd(), Ready::WRITABLE, WRITE_WAIT)
                        .map_err(PtyError::Write)?;
                }
                Err(e) => return Err(PtyError::Write(e)),
            }
        }
        Ok(())
    }

    /// Apply a new window size to the pty
    pub fn resize(&mut self, geometry: Geometry) -> Result<()> {
        let winsize = geometry.to_winsize();
        let ret = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ as _, &winsize) };
        if ret == -1 {
            return Err(PtyError::Resize(io::Error::last_os_error()));
        }
        debug!("pty resized {} -> {}", self.geometry, geometry);
        self.geometry = geometry;
        Ok(())
    }

    /// Send SIGWINCH to the child's process group.
    ///
    /// The child is a session leader, so its pid is also its group id. A
    /// group that no longer exists is not an error: the next read reports
    /// the exit.
    pub fn forward_resize(&self) -> Result<()> {
        match killpg(self.pgid(), Signal::SIGWINCH) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(PtyError::Signal(e)),
        }
    }

    /// Terminate and reap the child
    pub fn kill(&mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("child already exited: {}", status);
            }
            _ => {
                let _ = killpg(self.pgid(), Signal::SIGHUP);
                let _ = self.child.kill();
                let _ = self.child.wait();
                debug!("child terminated");
            }
        }
    }

    fn pgid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.kill();
    }
}

fn set_cloexec<Fd: AsFd>(fd: &Fd) -> Result<()> {
    fcntl(fd.as_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(PtyError::Configure)?;
    Ok(())
}

fn set_nonblocking<Fd: AsFd>(fd: &Fd) -> Result<()> {
    let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFL).map_err(PtyError::Configure)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(PtyError::Configure)?;
    Ok(())
}
