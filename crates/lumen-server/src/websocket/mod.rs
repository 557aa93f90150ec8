//! WebSocket transport: socket adapter, client protocol, session lifecycle.

pub mod protocol;
pub mod session;
pub mod socket;
