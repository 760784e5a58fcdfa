//! WebSocket server module
//!
//! Accepts connections and hands each one to its own pty session.

mod websocket;

pub use websocket::*;
