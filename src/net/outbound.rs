//! Pending geometry prefix for the upstream byte stream.

use std::borrow::Cow;

use crate::core::geometry::Geometry;

use super::protocol;

/// At most one geometry update waiting to ride on the next outbound chunk.
///
/// A resize while one is already pending replaces the size; it never queues
/// a second prefix.
#[derive(Debug, Default)]
pub struct OutboundState {
    pending: Option<Geometry>,
}

impl OutboundState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, geometry: Geometry) {
        self.pending = Some(geometry);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Bytes to send for `buf`, consuming the pending prefix if there is one
    pub fn frame<'a>(&mut self, buf: &'a [u8]) -> Cow<'a, [u8]> {
        match self.pending.take() {
            Some(geometry) => {
                let mut framed = protocol::geometry_message(geometry);
                framed.extend_from_slice(buf);
                Cow::Owned(framed)
            }
            None => Cow::Borrowed(buf),
        }
    }
}
