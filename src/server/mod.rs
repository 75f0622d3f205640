//! WebSocket server module
//!
//! Handles WebSocket connections from clients and routes their messages to
//! the session registry.

#[allow(dead_code)]
mod protocol;
mod websocket;

#[allow(unused_imports)]
pub use protocol::*;
pub use websocket::*;
