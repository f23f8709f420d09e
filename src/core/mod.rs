//! Core broadcast machinery.
//!
//! - **geometry**: terminal size shared by every component
//! - **poller**: readiness waits over `poll(2)`
//! - **pty**: child process on a pseudo-terminal
//! - **resize**: SIGWINCH captured as an atomic flag
//! - **terminate**: SIGTERM/SIGHUP/SIGINT captured as a flag
//! - **session**: the event loop tying pty, local terminal and server together
//!
//! # Architecture
//!
//! ```text
//! Session
//! ├── PtySession (child I/O)
//! ├── ConnectionManager (server socket, see crate::net)
//! ├── RawModeGuard (local terminal, see crate::ui)
//! └── SessionSignals (resize, terminate)
//! ```

pub mod geometry;
pub mod poller;
pub mod pty;
pub mod resize;
pub mod session;
pub mod terminate;
