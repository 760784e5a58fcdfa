//! WebSocket server implementation
//!
//! Listens on a configurable port, upgrades every accepted connection to a
//! WebSocket and runs one pty session per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

use crate::session::{Session, SessionConfig, SessionStatus};

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Serve a single session, then stop
    pub once: bool,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            once: false,
        }
    }

    /// Stop after the first session
    pub fn with_once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket server bridging clients to pty sessions
pub struct WebSocketServer {
    config: ServerConfig,
    session_config: Arc<SessionConfig>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig, session_config: SessionConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            session_config: Arc::new(session_config),
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Listening on {}", listener.local_addr()?);

        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    ///
    /// Returns on shutdown, or after the first session in `once` mode. Sessions
    /// still running at that point are waited for.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let session_config = Arc::clone(&self.session_config);
                            sessions.spawn(async move {
                                handle_connection(stream, peer_addr, &session_config).await
                            });
                            if self.config.once {
                                debug!("Serving a single session, no longer accepting");
                                break;
                            }
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                Some(result) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = result {
                        warn!("Session task failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        if !sessions.is_empty() {
            info!("Waiting for {} active sessions to close...", sessions.len());
        }
        while let Some(result) = sessions.join_next().await {
            if let Err(e) = result {
                warn!("Session task failed: {}", e);
            }
        }

        Ok(())
    }
}

/// Handle a single connection for the lifetime of its session
///
/// Returns `None` if the upgrade failed or the process could not be started;
/// in both cases the connection is dropped without a session.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    session_config: &SessionConfig,
) -> Option<SessionStatus> {
    info!("New connection from {}", peer_addr);

    let ws_stream = match accept_async(stream).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            error!("WebSocket upgrade failed for {}: {}", peer_addr, e);
            return None;
        }
    };

    let session = match Session::start(session_config.clone()) {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to start session for {}: {}", peer_addr, e);
            return None;
        }
    };

    debug!("Connection from {} runs session {}", peer_addr, session.id());
    let status = session.run(ws_stream).await;
    info!("Connection from {} closed with status {}", peer_addr, status);
    Some(status)
}
