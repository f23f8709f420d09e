//! Connection to the termcast server
//!
//! The manager owns at most one socket. It connects lazily, performs and
//! validates the handshake, and replaces the whole connection whenever it
//! looks broken. Callers never see transient network trouble: writes block
//! until the bytes have been handed to a live socket, and only an
//! authentication failure is reported as fatal.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, BorrowedFd};
use std::thread;
use std::time::Duration;

use nix::sys::signal::Signal;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::geometry::Geometry;
use crate::core::poller::{self, Ready};
use crate::core::terminate::TerminateSignal;
use crate::ui::terminal::{RawModeGuard, TerminalMode};

use super::outbound::OutboundState;
use super::protocol;

/// Largest single read from the socket
const READ_CHUNK: usize = 4096;

/// `connect_timeout` rejects a zero duration
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The server refused the credentials. Retrying would only repeat it.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Failed to read from server: {0}")]
    Read(#[source] io::Error),

    #[error("Failed to switch terminal mode: {0}")]
    Terminal(#[source] io::Error),

    #[error("Interrupted by {0} while connecting")]
    Interrupted(Signal),
}

pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Server address, credentials and timing
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Bound on the handshake reply wait and on each outbound write wait
    pub timeout: Duration,
    /// Pause between failed connection attempts
    pub reconnect_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingHandshakeAck,
    Established,
    Faulted,
}

/// A socket plus where it is in its lifecycle
pub struct Connection {
    stream: TcpStream,
    state: ConnectionState,
}

impl Connection {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_state(&mut self, state: ConnectionState) {
        debug!("connection {:?} -> {:?}", self.state, state);
        self.state = state;
    }
}

/// Result of a non-blocking read of the server's notification stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// Some bytes arrived (a watcher came or went)
    Received(usize),
    /// The server closed its end
    Closed,
    /// The connection failed underneath us
    Faulted,
    /// Spurious wakeup
    Pending,
}

/// Why a connection attempt did not produce a usable socket
enum AttemptError {
    Transient(io::Error),
    Fatal(ConnectionError),
}

impl From<io::Error> for AttemptError {
    fn from(err: io::Error) -> Self {
        AttemptError::Transient(err)
    }
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    connection: Option<Connection>,
    outbound: OutboundState,
    /// Abandons the retry loop once a termination signal arrives
    terminate: Option<TerminateSignal>,
}

impl ConnectionManager {
    pub fn new(mut config: ConnectionConfig) -> Self {
        config.timeout = config.timeout.max(MIN_TIMEOUT);
        Self {
            config,
            connection: None,
            outbound: OutboundState::new(),
            terminate: None,
        }
    }

    /// Stop retrying when `signal` is raised
    pub fn cancel_on(&mut self, signal: TerminateSignal) {
        self.terminate = Some(signal);
    }

    pub fn state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map(Connection::state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Socket descriptor for the event loop, once connected
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.connection.as_ref().map(|conn| conn.stream.as_fd())
    }

    /// Ask for the next outbound chunk to carry a geometry update
    pub fn schedule_geometry(&mut self, geometry: Geometry) {
        self.outbound.schedule(geometry);
    }

    pub fn geometry_pending(&self) -> bool {
        self.outbound.is_pending()
    }

    /// Connect if there is no connection yet
    pub fn ensure_connected<T: TerminalMode>(
        &mut self,
        terminal: &mut RawModeGuard<T>,
    ) -> Result<()> {
        if self.connection.is_none() {
            self.connect(terminal)?;
        }
        Ok(())
    }

    /// Open a socket and complete the handshake, retrying until it works.
    ///
    /// Unreachable servers block here; they do not end the session. Only a
    /// rejected handshake returns an error.
    pub fn connect<T: TerminalMode>(&mut self, terminal: &mut RawModeGuard<T>) -> Result<()> {
        self.connection = None;
        let geometry = terminal.size();

        loop {
            if let Some(signal) = self.terminate.and_then(|t| t.received()) {
                return Err(ConnectionError::Interrupted(signal));
            }

            match self.attempt(geometry) {
                Ok(connection) => {
                    self.connection = Some(connection);
                    info!("Connected to {}:{}", self.config.host, self.config.port);
                    return Ok(());
                }
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Transient(err)) => {
                    warn!(
                        "Couldn't connect to {}:{}: {}; retrying in {:?}",
                        self.config.host, self.config.port, err, self.config.reconnect_delay
                    );
                    let delay = self.config.reconnect_delay;
                    terminal
                        .suspended(|| thread::sleep(delay))
                        .map_err(ConnectionError::Terminal)?;
                }
            }
        }
    }

    /// Throw the current connection away and build a new one
    pub fn reconnect<T: TerminalMode>(
        &mut self,
        cause: &str,
        terminal: &mut RawModeGuard<T>,
    ) -> Result<()> {
        if let Some(conn) = self.connection.as_mut() {
            conn.set_state(ConnectionState::Faulted);
        }
        self.connection = None;
        warn!(
            "Lost connection to {}:{} ({}), reconnecting",
            self.config.host, self.config.port, cause
        );

        terminal.suspend().map_err(ConnectionError::Terminal)?;
        let result = self.connect(terminal);
        // The connect outcome matters more than a failed mode switch
        if let Err(e) = terminal.resume() {
            warn!("Couldn't restore raw mode after reconnecting: {}", e);
        }
        result
    }

    /// Send `buf` upstream, however many reconnects that takes.
    ///
    /// Each wait for writability is bounded by the configured timeout; a
    /// socket that stays unwritable or reports an error is replaced and the
    /// unsent remainder goes to the new one.
    pub fn write_bounded<T: TerminalMode>(
        &mut self,
        buf: &[u8],
        terminal: &mut RawModeGuard<T>,
    ) -> Result<()> {
        let mut framed: Option<Vec<u8>> = None;
        let mut offset = 0;

        loop {
            self.ensure_connected(terminal)?;

            if let Some(cause) = self.write_fault() {
                self.reconnect(&cause, terminal)?;
                continue;
            }

            let outbound = &mut self.outbound;
            let payload = framed.get_or_insert_with(|| outbound.frame(buf).into_owned());

            let written = match self.connection.as_mut() {
                Some(conn) => conn.stream.write(&payload[offset..]),
                None => continue,
            };

            match written {
                Ok(n) => {
                    offset += n;
                    if offset >= payload.len() {
                        return Ok(());
                    }
                }
                Err(err) if is_retryable(&err) => {}
                Err(err) => {
                    self.reconnect(&format!("write failed: {}", err), terminal)?;
                }
            }
        }
    }

    /// Wait for the socket to accept more bytes. `Some(cause)` when it never
    /// does within the timeout, or turns out to be dead.
    fn write_fault(&self) -> Option<String> {
        let conn = self.connection.as_ref()?;
        let ready = poller::wait_one(conn.stream.as_fd(), Ready::WRITABLE, self.config.timeout);

        match ready {
            Ok(Some(ready)) if ready.is_faulted() => Some("socket error while writing".to_string()),
            Ok(Some(ready)) if ready.contains(Ready::WRITABLE) => {
                match peer_closed(&conn.stream) {
                    Ok(false) => None,
                    Ok(true) => Some("server closed the connection".to_string()),
                    Err(err) => Some(format!("socket check failed: {}", err)),
                }
            }
            Ok(_) => Some("write timed out".to_string()),
            Err(errno) => Some(format!("write wait failed: {}", errno)),
        }
    }

    /// Read whatever the server sent, without blocking
    pub fn read_notification(&mut self, buf: &mut [u8]) -> Result<Notification> {
        let Some(conn) = self.connection.as_mut() else {
            return Ok(Notification::Pending);
        };

        let len = buf.len().min(READ_CHUNK);
        loop {
            match conn.stream.read(&mut buf[..len]) {
                Ok(0) => return Ok(Notification::Closed),
                Ok(n) => return Ok(Notification::Received(n)),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Notification::Pending);
                }
                Err(err) if is_connection_failure(&err) => {
                    debug!("socket read failed: {}", err);
                    return Ok(Notification::Faulted);
                }
                Err(err) => return Err(ConnectionError::Read(err)),
            }
        }
    }

    /// One connection attempt: socket, handshake, reply check
    fn attempt(&self, geometry: Option<Geometry>) -> std::result::Result<Connection, AttemptError> {
        let addrs = (self.config.host.as_str(), self.config.port).to_socket_addrs()?;

        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses");
        let mut stream = None;
        for addr in addrs {
            debug!("connecting to {}", addr);
            match TcpStream::connect_timeout(&addr, self.config.timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(err) => last_err = err,
            }
        }
        let stream = stream.ok_or(last_err)?;

        let mut conn = Connection {
            stream,
            state: ConnectionState::Connecting,
        };
        conn.stream.set_nodelay(true)?;

        let mut hello = protocol::handshake(&self.config.user, &self.config.password);
        if let Some(geometry) = geometry {
            hello.extend_from_slice(&protocol::geometry_message(geometry));
        }
        conn.stream.write_all(&hello)?;
        conn.stream.set_nonblocking(true)?;
        conn.set_state(ConnectionState::AwaitingHandshakeAck);

        self.validate_handshake(&mut conn)?;
        conn.set_state(ConnectionState::Established);
        Ok(conn)
    }

    /// Check the server's reply to the handshake.
    ///
    /// An error or an empty read means the password was rejected. Silence
    /// is accepted (older servers never reply) and so is a reply that does
    /// not match the usual acknowledgment.
    fn validate_handshake(&self, conn: &mut Connection) -> std::result::Result<(), AttemptError> {
        let ready = poller::wait_one(conn.stream.as_fd(), Ready::READABLE, self.config.timeout)
            .map_err(|errno| AttemptError::Transient(io::Error::from(errno)))?;

        let Some(ready) = ready else {
            debug!("no handshake reply within {:?}, carrying on", self.config.timeout);
            return Ok(());
        };

        if ready.intersects(Ready::ERROR | Ready::HANGUP) {
            return Err(AttemptError::Fatal(ConnectionError::Authentication(
                "invalid password".to_string(),
            )));
        }

        let mut buf = [0u8; READ_CHUNK];
        let n = loop {
            match conn.stream.read(&mut buf) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                // Readiness said otherwise; treat as silence
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => {
                    return Err(AttemptError::Fatal(ConnectionError::Authentication(format!(
                        "invalid password ({})",
                        err
                    ))))
                }
            }
        };

        if n == 0 {
            return Err(AttemptError::Fatal(ConnectionError::Authentication(
                "invalid password".to_string(),
            )));
        }

        let expected = protocol::expected_ack(&self.config.user);
        if buf[..n] != expected[..] {
            warn!(
                "Unexpected handshake reply: {:?}",
                String::from_utf8_lossy(&buf[..n])
            );
        }
        Ok(())
    }
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Whether the server has shut down its side of the connection.
///
/// Unread notification bytes hide a later shutdown; the notification read
/// in the event loop catches that case.
fn peer_closed(stream: &TcpStream) -> io::Result<bool> {
    let mut byte = [0u8; 1];
    match stream.peek(&mut byte) {
        Ok(0) => Ok(true),
        Ok(_) => Ok(false),
        Err(err) if is_retryable(&err) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Errors that mean "this socket is dead", as opposed to a local bug
fn is_connection_failure(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
