//! PTY management module
//!
//! Runs a shell command line inside a pseudo-terminal.
//! Uses portable-pty for the pty pair and child handling.

mod process;

pub use process::*;
