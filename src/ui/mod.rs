//! Local terminal handling: raw mode ownership, redraw hint and bell.

pub mod terminal;
