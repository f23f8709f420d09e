//! Server side of a broadcast.
//!
//! - **protocol**: handshake and geometry metadata encoding
//! - **outbound**: pending geometry prefix for the mirrored stream
//! - **connection**: connect, handshake validation, bounded writes, reconnect

pub mod connection;
pub mod outbound;
pub mod protocol;
