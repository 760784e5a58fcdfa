//! Bridging session module
//!
//! Ties one remote connection to one process running in a pty: the relays
//! move data, the arbiter decides when and how the session ends.

mod arbiter;
mod controller;
mod relay;

pub use arbiter::SessionStatus;
pub use controller::*;
