//! termcast wire protocol
//!
//! The client side of the protocol is tiny: a one-line handshake, then the
//! raw terminal output. Structured data (the terminal geometry) rides inside
//! that output wrapped in control sequences the server knows to pick out:
//!
//! ```text
//! ESC [ H  NUL  {"geometry":[cols,rows]}  0xFF  ESC [ H  ESC [ 2 J
//! ```

use serde::Serialize;

use crate::core::geometry::Geometry;

const CURSOR_HOME: &[u8] = b"\x1b[H";
const CLEAR_SCREEN: &[u8] = b"\x1b[2J";
const METADATA_START: u8 = 0x00;
const METADATA_END: u8 = 0xFF;

#[derive(Serialize)]
struct Metadata {
    geometry: [u16; 2],
}

/// First line sent on every new connection
pub fn handshake(user: &str, password: &str) -> Vec<u8> {
    format!("hello {} {}\n", user, password).into_bytes()
}

/// The reply a server sends when it accepts the credentials
pub fn expected_ack(user: &str) -> Vec<u8> {
    format!("hello, {}\n", user).into_bytes()
}

/// Geometry metadata message
pub fn geometry_message(geometry: Geometry) -> Vec<u8> {
    let payload = serde_json::to_vec(&Metadata {
        geometry: [geometry.cols, geometry.rows],
    })
    .unwrap_or_default();

    let mut msg = Vec::with_capacity(payload.len() + 16);
    msg.extend_from_slice(CURSOR_HOME);
    msg.push(METADATA_START);
    msg.extend_from_slice(&payload);
    msg.push(METADATA_END);
    msg.extend_from_slice(CURSOR_HOME);
    msg.extend_from_slice(CLEAR_SCREEN);
    msg
}
