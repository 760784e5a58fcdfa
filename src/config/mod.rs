//! Configuration module
//!
//! Loads bridge settings from an optional TOML file and turns them into the
//! listener and session configurations.

mod settings;

pub use settings::*;
