//! Broadcast session event loop
//!
//! One thread multiplexes three descriptors: local input, the pty master and
//! the server socket. Child output goes to the local terminal first and then
//! upstream, so both observers see it in the order it was produced.
//!
//! Per iteration:
//!
//! ```text
//! termination requested  → stop
//! connect if needed → poll(input, pty, socket)
//!   interrupted or resized → handle resize, start over
//!   socket error           → reconnect, start over
//!   input readable         → pty
//!   pty readable           → stdout, then server
//!   socket readable        → bell (or reconnect on EOF)
//! ```

use std::io::{self, Write};
use std::os::fd::AsFd;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::read;
use thiserror::Error;
use tracing::{debug, info};

use super::poller::{self, Ready};
use super::pty::{PtyError, PtyRead, PtySession};
use super::resize::ResizeSignal;
use super::terminate::TerminateSignal;
use crate::net::connection::{ConnectionError, ConnectionManager, Notification};
use crate::ui::terminal::{self, RawModeGuard, TerminalMode};

/// Largest single read from any descriptor
const READ_CHUNK: usize = 4096;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Child process exited")]
    ChildExited,

    #[error("Terminated by {0}")]
    Terminated(Signal),

    #[error("Failed to read local input: {0}")]
    Input(#[source] Errno),

    #[error("Failed to write local output: {0}")]
    Output(#[source] io::Error),

    #[error("Failed to enter raw mode: {0}")]
    Terminal(#[source] io::Error),

    #[error("Failed to wait for I/O: {0}")]
    Poll(#[source] Errno),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Session behaviour the operator can switch
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    /// Ring the local bell when the server reports watcher activity
    pub bell_on_watcher: bool,
}

/// Asynchronous events the loop reacts to
#[derive(Clone, Copy)]
pub struct SessionSignals {
    pub resize: ResizeSignal,
    pub terminate: TerminateSignal,
}

/// Readiness of the three endpoints after one wait
#[derive(Debug, Default, Clone, Copy)]
struct Readiness {
    input: Ready,
    pty: Ready,
    socket: Ready,
}

/// A running broadcast: child on a pty, local terminal in raw mode, server
/// connection.
///
/// `I` is the local input (stdin), `O` the local output (stdout).
pub struct Session<I: AsFd, O: Write, T: TerminalMode> {
    input: I,
    output: O,
    pty: PtySession,
    upstream: ConnectionManager,
    signals: SessionSignals,
    options: SessionOptions,
    terminal: RawModeGuard<T>,
}

impl<I: AsFd, O: Write, T: TerminalMode> Session<I, O, T> {
    /// Take over the local terminal. Raw mode lasts until the session is dropped.
    pub fn start(
        pty: PtySession,
        mut upstream: ConnectionManager,
        input: I,
        output: O,
        terminal: T,
        signals: SessionSignals,
        options: SessionOptions,
    ) -> Result<Self> {
        let terminal = RawModeGuard::acquire(terminal).map_err(SessionError::Terminal)?;
        upstream.cancel_on(signals.terminate);
        Ok(Self {
            input,
            output,
            pty,
            upstream,
            signals,
            options,
            terminal,
        })
    }

    /// Run until local input reaches EOF (`Ok`) or something fatal happens.
    pub fn run(&mut self) -> Result<()> {
        let mut buf = [0u8; READ_CHUNK];
        info!("Session started ({})", self.pty.geometry());

        loop {
            if let Some(signal) = self.signals.terminate.received() {
                info!("Received {}, ending session", signal);
                return Err(SessionError::Terminated(signal));
            }

            self.upstream.ensure_connected(&mut self.terminal)?;

            let ready = match self.wait() {
                Ok(ready) => Some(ready),
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => None,
                Err(e) => return Err(SessionError::Poll(e)),
            };

            // A pending resize is handled before any I/O, and the wait is
            // redone so no descriptor is dispatched on stale readiness.
            let resized = self.signals.resize.take();
            if resized {
                self.propagate_resize()?;
            }
            let Some(ready) = ready else { continue };
            if resized {
                continue;
            }

            if ready.socket.intersects(Ready::ERROR | Ready::HANGUP) {
                self.upstream.reconnect("socket error", &mut self.terminal)?;
                continue;
            }

            let active = Ready::READABLE | Ready::HANGUP | Ready::ERROR;
            if ready.input.intersects(active) && !self.forward_input(&mut buf)? {
                info!("Local input closed, ending session");
                return Ok(());
            }

            if ready.pty.intersects(active) {
                self.forward_output(&mut buf)?;
            }

            if ready.socket.contains(Ready::READABLE) {
                self.handle_notification(&mut buf)?;
            }
        }
    }

    fn wait(&self) -> nix::Result<Readiness> {
        let mut interests = vec![
            (self.input.as_fd(), Ready::READABLE),
            (self.pty.as_fd(), Ready::READABLE),
        ];
        if let Some(socket) = self.upstream.as_fd() {
            interests.push((socket, Ready::READABLE));
        }

        let ready = poller::wait_any(&interests)?;
        Ok(Readiness {
            input: ready[0],
            pty: ready[1],
            socket: ready.get(2).copied().unwrap_or_default(),
        })
    }

    /// Keystrokes to the child. `Ok(false)` on EOF.
    fn forward_input(&mut self, buf: &mut [u8]) -> Result<bool> {
        match read(self.input.as_fd(), buf) {
            Ok(0) => Ok(false),
            Ok(n) => {
                self.pty.write_all(&buf[..n])?;
                Ok(true)
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => Ok(true),
            Err(e) => Err(SessionError::Input(e)),
        }
    }

    /// Child output to the local terminal, then upstream
    fn forward_output(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.pty.read(buf)? {
            PtyRead::Data(n) => {
                self.output.write_all(&buf[..n]).map_err(SessionError::Output)?;
                self.output.flush().map_err(SessionError::Output)?;
                self.upstream.write_bounded(&buf[..n], &mut self.terminal)?;
                Ok(())
            }
            PtyRead::Pending => Ok(()),
            PtyRead::Closed => Err(SessionError::ChildExited),
        }
    }

    fn handle_notification(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.upstream.read_notification(buf)? {
            Notification::Received(n) => {
                debug!("{} bytes of watcher notification", n);
                if self.options.bell_on_watcher {
                    terminal::ring_bell(&mut self.output).map_err(SessionError::Output)?;
                }
            }
            Notification::Closed => {
                self.upstream.reconnect("server closed the connection", &mut self.terminal)?;
            }
            Notification::Faulted => {
                self.upstream.reconnect("socket read failed", &mut self.terminal)?;
            }
            Notification::Pending => {}
        }
        Ok(())
    }

    fn propagate_resize(&mut self) -> Result<()> {
        let Some(geometry) = self.terminal.size() else {
            debug!("resize signalled but terminal size is unknown");
            return Ok(());
        };

        info!("Resize: {}", geometry);
        if self.upstream.geometry_pending() {
            debug!("replacing unsent geometry ({:?})", self.upstream.state());
        }
        self.pty.resize(geometry)?;
        self.pty.forward_resize()?;
        terminal::redraw_hint(&mut self.output).map_err(SessionError::Output)?;
        self.upstream.schedule_geometry(geometry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::Geometry;
    use crate::net::connection::ConnectionConfig;
    use crate::net::protocol;
    use crate::ui::terminal::testing::FakeTerminal;
    use nix::sys::pthread::{pthread_kill, pthread_self};
    use std::io::{BufRead, BufReader, Read};
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::net::UnixStream;
    use std::sync::{Arc, Mutex};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    /// Local output the test can inspect after the session owns it
    #[derive(Clone, Default)]
    struct SharedOutput(Arc<Mutex<Vec<u8>>>);

    impl SharedOutput {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Write for SharedOutput {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Harness {
        session: Session<UnixStream, SharedOutput, FakeTerminal>,
        /// Writing end of the session's local input
        keyboard: UnixStream,
        output: SharedOutput,
        terminal: FakeTerminal,
    }

    fn config_for(listener: &TcpListener) -> ConnectionConfig {
        ConnectionConfig {
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
            user: "alice".to_string(),
            password: "asdf".to_string(),
            timeout: Duration::from_millis(500),
            reconnect_delay: Duration::from_millis(20),
        }
    }

    /// Accept one client, acknowledge it, run `then`, and return everything
    /// it sent after the handshake line.
    fn accept_one<F>(listener: &TcpListener, then: F) -> (String, Vec<u8>)
    where
        F: FnOnce(&mut TcpStream),
    {
        let (mut stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut hello = String::new();
        reader.read_line(&mut hello).unwrap();
        stream.write_all(b"hello, alice\n").unwrap();
        then(&mut stream);
        let mut rest = Vec::new();
        let _ = reader.read_to_end(&mut rest);
        (hello, rest)
    }

    fn serve_one<F>(then: F) -> (ConnectionConfig, JoinHandle<(String, Vec<u8>)>)
    where
        F: FnOnce(&mut TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config_for(&listener);
        let handle = thread::spawn(move || accept_one(&listener, then));
        (config, handle)
    }

    fn start(
        script: &str,
        config: ConnectionConfig,
        terminal: FakeTerminal,
        resize: ResizeSignal,
        options: SessionOptions,
    ) -> Harness {
        let signals = SessionSignals {
            resize,
            terminate: TerminateSignal::detached(),
        };
        start_with(script, config, terminal, signals, options)
    }

    fn start_with(
        script: &str,
        config: ConnectionConfig,
        terminal: FakeTerminal,
        signals: SessionSignals,
        options: SessionOptions,
    ) -> Harness {
        let args = vec!["-c".to_string(), script.to_string()];
        let pty = PtySession::spawn("/bin/sh", &args, Geometry::default()).unwrap();
        let (input, keyboard) = UnixStream::pair().unwrap();
        let output = SharedOutput::default();
        let session = Session::start(
            pty,
            ConnectionManager::new(config),
            input,
            output.clone(),
            terminal.clone(),
            signals,
            options,
        )
        .unwrap();

        Harness {
            session,
            keyboard,
            output,
            terminal,
        }
    }

    #[test]
    fn test_child_output_reaches_both_sides() {
        let (config, server) = serve_one(|_| {});
        let mut h = start(
            "printf abc",
            config,
            FakeTerminal::default(),
            ResizeSignal::detached(),
            SessionOptions::default(),
        );

        let result = h.session.run();
        assert!(matches!(result, Err(SessionError::ChildExited)));
        drop(h.session);

        let (hello, upstream) = server.join().unwrap();
        assert_eq!(hello, "hello alice asdf\n");
        assert_eq!(upstream, b"abc");
        assert_eq!(h.output.contents(), b"abc");
    }

    #[test]
    fn test_keystrokes_reach_child_and_order_matches_upstream() {
        let (config, server) = serve_one(|_| {});
        let mut h = start(
            "read line; printf \"got:%s\" \"$line\"",
            config,
            FakeTerminal::default(),
            ResizeSignal::detached(),
            SessionOptions::default(),
        );

        h.keyboard.write_all(b"hi\n").unwrap();
        let result = h.session.run();
        assert!(matches!(result, Err(SessionError::ChildExited)));
        drop(h.session);

        let (_, upstream) = server.join().unwrap();
        let local = h.output.contents();
        assert!(String::from_utf8_lossy(&local).ends_with("got:hi"));
        assert_eq!(upstream, local);
    }

    #[test]
    fn test_resize_prefixes_next_chunk_only() {
        let (config, server) = serve_one(|_| {});
        let geometry = Geometry::new(100, 40);
        let resize = ResizeSignal::detached();
        resize.raise();

        let mut h = start(
            "sleep 0.2; printf xyz; sleep 0.2; printf def",
            config,
            FakeTerminal::with_size(geometry),
            resize,
            SessionOptions::default(),
        );

        let result = h.session.run();
        assert!(matches!(result, Err(SessionError::ChildExited)));
        assert_eq!(h.session.pty.geometry(), geometry);
        drop(h.session);

        // Handshake geometry, then exactly one prefix on the first chunk
        let (_, upstream) = server.join().unwrap();
        let mut expected = protocol::geometry_message(geometry);
        expected.extend_from_slice(&protocol::geometry_message(geometry));
        expected.extend_from_slice(b"xyzdef");
        assert_eq!(upstream, expected);

        let mut local = b"\x1b[1;1H\x1b[2J".to_vec();
        local.extend_from_slice(b"xyzdef");
        assert_eq!(h.output.contents(), local);
    }

    #[test]
    fn test_resize_without_known_size_is_ignored() {
        let (config, server) = serve_one(|_| {});
        let resize = ResizeSignal::detached();
        resize.raise();

        let mut h = start(
            "sleep 0.1; printf abc",
            config,
            FakeTerminal::default(),
            resize,
            SessionOptions::default(),
        );

        let _ = h.session.run();
        assert_eq!(h.session.pty.geometry(), Geometry::default());
        drop(h.session);

        let (_, upstream) = server.join().unwrap();
        assert_eq!(upstream, b"abc");
        assert_eq!(h.output.contents(), b"abc");
    }

    #[test]
    fn test_input_eof_ends_session_and_restores_terminal() {
        let (config, server) = serve_one(|_| {});
        let h = start(
            "sleep 5",
            config,
            FakeTerminal::default(),
            ResizeSignal::detached(),
            SessionOptions::default(),
        );
        let Harness {
            mut session,
            keyboard,
            terminal,
            ..
        } = h;

        drop(keyboard);
        session.run().unwrap();
        drop(session);

        assert_eq!(terminal.enters(), 1);
        assert_eq!(terminal.leaves(), 1);
        server.join().unwrap();
    }

    #[test]
    fn test_authentication_failure_restores_terminal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config_for(&listener);
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut line = String::new();
            BufReader::new(&stream).read_line(&mut line).unwrap();
            drop(stream);
        });

        let mut h = start(
            "sleep 5",
            config,
            FakeTerminal::default(),
            ResizeSignal::detached(),
            SessionOptions::default(),
        );

        let result = h.session.run();
        assert!(matches!(
            result,
            Err(SessionError::Connection(ConnectionError::Authentication(_)))
        ));
        drop(h.session);
        server.join().unwrap();

        assert_eq!(h.terminal.enters(), 1);
        assert_eq!(h.terminal.leaves(), 1);
    }

    #[test]
    fn test_watcher_notification_rings_bell() {
        let (config, server) = serve_one(|stream| {
            thread::sleep(Duration::from_millis(100));
            stream.write_all(b"watcher joined").unwrap();
        });
        let mut h = start(
            "sleep 0.5; printf done",
            config,
            FakeTerminal::default(),
            ResizeSignal::detached(),
            SessionOptions {
                bell_on_watcher: true,
            },
        );

        let _ = h.session.run();
        drop(h.session);
        let (_, upstream) = server.join().unwrap();

        assert_eq!(h.output.contents(), b"\x07done");
        assert_eq!(upstream, b"done");
    }

    #[test]
    fn test_watcher_notification_silent_without_bell() {
        let (config, server) = serve_one(|stream| {
            thread::sleep(Duration::from_millis(100));
            stream.write_all(b"watcher joined").unwrap();
        });
        let mut h = start(
            "sleep 0.5; printf done",
            config,
            FakeTerminal::default(),
            ResizeSignal::detached(),
            SessionOptions::default(),
        );

        let _ = h.session.run();
        drop(h.session);
        server.join().unwrap();

        assert_eq!(h.output.contents(), b"done");
    }

    #[test]
    fn test_server_hangup_reconnects_without_losing_output() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config_for(&listener);
        let server = thread::spawn(move || {
            // First connection: acknowledge, then hang up
            let (first_hello, _) = accept_one(&listener, |stream| {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            });
            let second = accept_one(&listener, |_| {});
            (first_hello, second)
        });

        let mut h = start(
            "sleep 0.5; printf late",
            config,
            FakeTerminal::default(),
            ResizeSignal::detached(),
            SessionOptions::default(),
        );

        let result = h.session.run();
        assert!(matches!(result, Err(SessionError::ChildExited)));
        drop(h.session);

        let (first_hello, (second_hello, upstream)) = server.join().unwrap();
        assert_eq!(first_hello, "hello alice asdf\n");
        assert_eq!(second_hello, first_hello);
        assert_eq!(upstream, b"late");

        // Raw mode dropped around the reconnect, released once at the end
        assert_eq!(h.terminal.enters(), 2);
        assert_eq!(h.terminal.leaves(), 2);
    }

    #[test]
    fn test_sigwinch_during_wait_prefixes_once() {
        let (config, server) = serve_one(|_| {});
        let geometry = Geometry::new(120, 50);
        let signals = SessionSignals {
            resize: ResizeSignal::install().unwrap(),
            terminate: TerminateSignal::detached(),
        };

        let mut h = start_with(
            "sleep 0.3; printf abc; sleep 0.3; printf def",
            config,
            FakeTerminal::with_size(geometry),
            signals,
            SessionOptions::default(),
        );

        // Lands while the loop is blocked waiting for the child
        let waiter = pthread_self();
        let kicker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            pthread_kill(waiter, Signal::SIGWINCH).unwrap();
        });

        let result = h.session.run();
        kicker.join().unwrap();
        assert!(matches!(result, Err(SessionError::ChildExited)));
        assert_eq!(h.session.pty.geometry(), geometry);
        drop(h.session);

        let (_, upstream) = server.join().unwrap();
        let mut expected = protocol::geometry_message(geometry);
        expected.extend_from_slice(&protocol::geometry_message(geometry));
        expected.extend_from_slice(b"abcdef");
        assert_eq!(upstream, expected);

        let mut local = b"\x1b[1;1H\x1b[2J".to_vec();
        local.extend_from_slice(b"abcdef");
        assert_eq!(h.output.contents(), local);
    }

    #[test]
    fn test_termination_request_restores_terminal() {
        // Never accepted: the session stops before connecting
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let terminate = TerminateSignal::detached();
        terminate.raise(Signal::SIGHUP);
        let signals = SessionSignals {
            resize: ResizeSignal::detached(),
            terminate,
        };

        let mut h = start_with(
            "sleep 5",
            config_for(&listener),
            FakeTerminal::default(),
            signals,
            SessionOptions::default(),
        );

        let result = h.session.run();
        assert!(matches!(result, Err(SessionError::Terminated(Signal::SIGHUP))));
        drop(h.session);

        assert_eq!(h.terminal.enters(), 1);
        assert_eq!(h.terminal.leaves(), 1);
    }

    #[test]
    fn test_sigterm_during_wait_ends_session() {
        let (config, server) = serve_one(|_| {});
        let signals = SessionSignals {
            resize: ResizeSignal::detached(),
            terminate: TerminateSignal::install().unwrap(),
        };

        let mut h = start_with(
            "sleep 5",
            config,
            FakeTerminal::default(),
            signals,
            SessionOptions::default(),
        );

        let waiter = pthread_self();
        let kicker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            pthread_kill(waiter, Signal::SIGTERM).unwrap();
        });

        let result = h.session.run();
        kicker.join().unwrap();
        assert!(matches!(result, Err(SessionError::Terminated(Signal::SIGTERM))));
        drop(h.session);
        server.join().unwrap();

        assert_eq!(h.terminal.leaves(), 1);
    }
}
