//! termcast - broadcast a terminal session to a termcast server
//!
//! termcast runs a command (your shell by default) on a pseudo-terminal,
//! shows its output locally as usual and mirrors every byte to a server
//! where others can watch. Window size changes are forwarded to the child and
//! announced to the server. Lost connections are re-established without
//! interrupting the local session.
//!
//! # Quick Start
//!
//! ```text
//! termcast                          # Broadcast $SHELL as $USER
//! termcast -u alice -P secret       # Explicit credentials
//! termcast -H localhost -p 4000     # Own server
//! termcast -- htop                  # Broadcast a single program
//! ```
//!
//! The session ends when the child exits, local input is closed, or
//! termcast receives SIGTERM, SIGHUP or SIGINT. The terminal mode is
//! restored in every case.

mod config;
mod core;
mod net;
mod ui;

use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Config;
use crate::core::pty::PtySession;
use crate::core::resize::ResizeSignal;
use crate::core::session::{Session, SessionSignals};
use crate::core::terminate::TerminateSignal;
use crate::net::connection::ConnectionManager;
use crate::ui::terminal::{HostTerminal, TerminalMode};

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable holding the log filter
const LOG_ENV: &str = "TERMCAST_LOG";

/// Command line options. `None` means "use the config file or default".
#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    bell_on_watcher: bool,
    timeout: Option<u64>,
    /// Program and arguments to broadcast; empty means the login shell
    command: Vec<String>,
}

impl Args {
    /// Command line wins over the config file
    fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(user) = &self.user {
            config.user = Some(user.clone());
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if self.bell_on_watcher {
            config.bell_on_watcher = true;
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
    }

    /// Program to run and its arguments
    fn child_command(&self) -> (String, Vec<String>) {
        match self.command.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => (
                env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
                Vec::new(),
            ),
        }
    }
}

fn print_version() {
    eprintln!("termcast {}", VERSION);
}

fn print_help() {
    eprintln!("termcast {} - Broadcast a terminal session", VERSION);
    eprintln!();
    eprintln!("Usage: termcast [OPTIONS] [--] [COMMAND [ARGS...]]");
    eprintln!();
    eprintln!("Server options:");
    eprintln!("  -H, --host <HOST>         Server host (default: {})", config::DEFAULT_HOST);
    eprintln!("  -p, --port <PORT>         Server port (default: {})", config::DEFAULT_PORT);
    eprintln!("  -u, --user <USER>         Broadcast name (default: $USER)");
    eprintln!("  -P, --password <PASS>     Password (default: {})", config::DEFAULT_PASSWORD);
    eprintln!(
        "  -t, --timeout <SECS>      Handshake and write timeout (default: {})",
        config::DEFAULT_TIMEOUT_SECS
    );
    eprintln!();
    eprintln!("Other options:");
    eprintln!("  -b, --bell-on-watcher     Ring the bell when a watcher comes or goes");
    eprintln!("  -v, --version             Show version");
    eprintln!("  -h, --help                Show this help");
    eprintln!();
    eprintln!("COMMAND defaults to $SHELL, or /bin/sh when unset.");
    eprintln!();
    eprintln!("Configuration: ~/.termcast/config.toml");
    eprintln!("Log file:      ~/.termcast/termcast.log (level from ${})", LOG_ENV);
}

/// Value following an option, advancing `i` past it
fn option_value<'a>(args: &'a [String], i: &mut usize, name: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("Missing value for {}", name))
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-H" | "--host" => {
                parsed.host = Some(option_value(args, &mut i, "--host")?.to_string());
            }
            "-p" | "--port" => {
                let value = option_value(args, &mut i, "--port")?;
                let port = value
                    .parse()
                    .map_err(|_| format!("Invalid port: {}", value))?;
                parsed.port = Some(port);
            }
            "-u" | "--user" => {
                parsed.user = Some(option_value(args, &mut i, "--user")?.to_string());
            }
            "-P" | "--password" => {
                parsed.password = Some(option_value(args, &mut i, "--password")?.to_string());
            }
            "-t" | "--timeout" => {
                let value = option_value(args, &mut i, "--timeout")?;
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("Invalid timeout: {}", value))?;
                if secs < config::MIN_TIMEOUT_SECS {
                    return Err(format!(
                        "Timeout must be at least {} second",
                        config::MIN_TIMEOUT_SECS
                    ));
                }
                parsed.timeout = Some(secs);
            }
            "-b" | "--bell-on-watcher" => {
                parsed.bell_on_watcher = true;
            }
            "--" => {
                parsed.command = args[i + 1..].to_vec();
                break;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
            // First positional starts the command; everything after belongs to it
            _ => {
                parsed.command = args[i..].to_vec();
                break;
            }
        }
        i += 1;
    }

    Ok(parsed)
}

/// Log to `~/.termcast/termcast.log`; stdout belongs to the broadcast.
fn init_logging() {
    let log_path = Config::data_dir()
        .map(|dir| dir.join("termcast.log"))
        .unwrap_or_else(|| PathBuf::from("termcast.log"));

    // No log file, no logging
    let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) else {
        return;
    };

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> anyhow::Result<()> {
    let argv: Vec<String> = env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    init_logging();
    info!("termcast {} starting...", VERSION);

    let mut config = Config::load();
    args.apply(&mut config);
    let connection = config.connection_config();
    info!(
        "Broadcasting as {} to {}:{}",
        connection.user, connection.host, connection.port
    );

    // Handlers reset to the default action in the exec'd child
    let signals = SessionSignals {
        resize: ResizeSignal::install().context("Failed to install SIGWINCH handler")?,
        terminate: TerminateSignal::install().context("Failed to install termination handlers")?,
    };
    let terminal = HostTerminal::new();
    let geometry = terminal.size().unwrap_or_default();

    let (program, program_args) = args.child_command();
    let pty = PtySession::spawn(&program, &program_args, geometry)
        .with_context(|| format!("Failed to start {}", program))?;

    let mut session = Session::start(
        pty,
        ConnectionManager::new(connection),
        io::stdin(),
        io::stdout(),
        terminal,
        signals,
        config.session_options(),
    )?;
    let result = session.run();

    // Cooked mode is back before anything is printed
    drop(session);

    match result {
        Ok(()) => {
            info!("Session ended");
            Ok(())
        }
        Err(e) => {
            error!("Session ended: {}", e);
            Err(e.into())
        }
    }
}
