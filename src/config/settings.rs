//! Bridge settings
//!
//! Loads bridge configuration from a TOML file such as:
//!
//! ```toml
//! port = 3333
//! command = "bash --login"
//! reap_timeout_secs = 10
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::pty::TerminalSize;
use crate::server::ServerConfig;
use crate::session::SessionConfig;

/// Default listen port
pub const DEFAULT_PORT: u16 = 3333;

/// Default bind address
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Shell used to interpret the command line, looked up on `PATH`
pub const DEFAULT_SHELL: &str = "bash";

/// Size of a single pty read
pub const DEFAULT_READ_BUFFER_SIZE: usize = 512;

/// Grace period for the child to exit once the session is terminating
pub const DEFAULT_REAP_TIMEOUT_SECS: u64 = 10;

/// Deadline for sending the final close frame
pub const DEFAULT_CLOSE_TIMEOUT_SECS: u64 = 5;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("No command configured")]
    MissingCommand,
    #[error("Read buffer size must be greater than zero")]
    ZeroReadBuffer,
}

/// Bridge configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Shell that runs the command line
    pub shell: String,
    /// Command line executed for every session
    pub command: String,
    /// Working directory of the spawned process (defaults to ours)
    pub working_dir: Option<PathBuf>,
    /// Initial terminal columns
    pub cols: u16,
    /// Initial terminal rows
    pub rows: u16,
    /// Bytes requested per pty read
    pub read_buffer_size: usize,
    /// Seconds to wait for the child before killing it
    pub reap_timeout_secs: u64,
    /// Seconds allowed for sending the close frame
    pub close_timeout_secs: u64,
    /// Serve a single session, then exit
    pub once: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let size = TerminalSize::default();
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            shell: DEFAULT_SHELL.to_string(),
            command: String::new(),
            working_dir: None,
            cols: size.cols,
            rows: size.rows,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            reap_timeout_secs: DEFAULT_REAP_TIMEOUT_SECS,
            close_timeout_secs: DEFAULT_CLOSE_TIMEOUT_SECS,
            once: false,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Check the settings a session cannot run without
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::MissingCommand);
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::ZeroReadBuffer);
        }
        Ok(())
    }

    /// Listener configuration
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new(self.bind.clone(), self.port).with_once(self.once)
    }

    /// Per-session configuration
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new(self.command.clone())
            .with_shell(self.shell.clone())
            .with_working_dir(self.working_dir.clone())
            .with_size(TerminalSize::new(self.cols, self.rows))
            .with_read_buffer_size(self.read_buffer_size)
            .with_reap_timeout(Duration::from_secs(self.reap_timeout_secs))
            .with_close_timeout(Duration::from_secs(self.close_timeout_secs))
    }
}
