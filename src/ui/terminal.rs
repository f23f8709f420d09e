//! Local terminal control
//!
//! Raw mode is owned by a [`RawModeGuard`] so the operator's terminal is put
//! back into cooked mode on every way out of a session, including unwinding.

use std::io::{self, IsTerminal, Write};

use crossterm::cursor::MoveTo;
use crossterm::queue;
use crossterm::terminal::{self, Clear, ClearType};
use tracing::debug;

use crate::core::geometry::Geometry;

/// Terminal bell
const BELL: &[u8] = b"\x07";

/// Mode switching and size queries for the operator's terminal
pub trait TerminalMode {
    fn enter_raw(&mut self) -> io::Result<()>;
    fn leave_raw(&mut self) -> io::Result<()>;
    /// Current size, `None` when it cannot be determined
    fn size(&self) -> Option<Geometry>;
}

/// The terminal this process was started from
pub struct HostTerminal {
    interactive: bool,
}

impl HostTerminal {
    pub fn new() -> Self {
        Self {
            interactive: io::stdin().is_terminal(),
        }
    }
}

impl Default for HostTerminal {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalMode for HostTerminal {
    fn enter_raw(&mut self) -> io::Result<()> {
        // Piped stdin has no line discipline to switch
        if !self.interactive {
            return Ok(());
        }
        terminal::enable_raw_mode()
    }

    fn leave_raw(&mut self) -> io::Result<()> {
        if !self.interactive {
            return Ok(());
        }
        terminal::disable_raw_mode()
    }

    fn size(&self) -> Option<Geometry> {
        let (cols, rows) = terminal::size().ok()?;
        Some(Geometry::new(cols, rows)).filter(Geometry::is_usable)
    }
}

/// Scoped ownership of raw mode.
///
/// Acquired once per session. `suspend`/`resume` hand the terminal back to
/// cooked mode temporarily (around a blocking reconnect) and are no-ops when
/// raw mode is not held.
pub struct RawModeGuard<T: TerminalMode> {
    terminal: T,
    active: bool,
    suspended: bool,
}

impl<T: TerminalMode> RawModeGuard<T> {
    pub fn acquire(mut terminal: T) -> io::Result<Self> {
        terminal.enter_raw()?;
        debug!("raw mode entered");
        Ok(Self {
            terminal,
            active: true,
            suspended: false,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn size(&self) -> Option<Geometry> {
        self.terminal.size()
    }

    /// Drop to cooked mode until `resume`
    pub fn suspend(&mut self) -> io::Result<()> {
        if self.active {
            self.terminal.leave_raw()?;
            self.active = false;
            self.suspended = true;
            debug!("raw mode suspended");
        }
        Ok(())
    }

    /// Re-enter raw mode if `suspend` left it
    pub fn resume(&mut self) -> io::Result<()> {
        if self.suspended {
            self.terminal.enter_raw()?;
            self.active = true;
            self.suspended = false;
            debug!("raw mode resumed");
        }
        Ok(())
    }

    /// Run `f` with raw mode suspended. Leaves an outer suspension alone.
    pub fn suspended<R>(&mut self, f: impl FnOnce() -> R) -> io::Result<R> {
        if !self.is_active() {
            return Ok(f());
        }
        self.suspend()?;
        let result = f();
        self.resume()?;
        Ok(result)
    }
}

impl<T: TerminalMode> Drop for RawModeGuard<T> {
    fn drop(&mut self) {
        if self.active {
            let _ = self.terminal.leave_raw();
            self.active = false;
            debug!("raw mode released");
        }
    }
}

/// Ask the operator's terminal to repaint from a clean screen
pub fn redraw_hint<W: Write>(out: &mut W) -> io::Result<()> {
    queue!(out, MoveTo(0, 0), Clear(ClearType::All))?;
    out.flush()
}

pub fn ring_bell<W: Write>(out: &mut W) -> io::Result<()> {
    out.write_all(BELL)?;
    out.flush()
}
