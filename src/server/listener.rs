//! HTTP listener
//!
//! Accepts inbound connections, reads the client's request head and hands
//! the socket to a [`ClientHandler`]. The response and the chunked body are
//! written by the output stream that takes the socket over.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use crate::error::Result;
use crate::server::config::ListenerConfig;

/// Receives accepted HTTP clients
pub trait ClientHandler: Send + Sync + 'static {
    /// Take ownership of a client whose request head has been read
    fn on_client(&self, socket: std::net::TcpStream, peer: SocketAddr);

    /// Clients currently being served, checked against `max_clients`
    fn client_count(&self) -> usize {
        0
    }
}

/// HTTP listener
pub struct HttpServer<H: ClientHandler> {
    config: ListenerConfig,
    handler: Arc<H>,
    /// Connections still reading their request head
    pending: Arc<AtomicUsize>,
}

/// Holds one slot in the pending count until the handover ends
struct PendingSlot(Arc<AtomicUsize>);

impl PendingSlot {
    fn acquire(pending: &Arc<AtomicUsize>) -> Self {
        pending.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(pending))
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<H: ClientHandler> HttpServer<H> {
    /// Create a new listener with the given configuration and handler
    pub fn new(config: ListenerConfig, handler: Arc<H>) -> Self {
        Self {
            config,
            handler,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Run the listener
    ///
    /// This method only returns if binding fails.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the listener until `shutdown` completes
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept on an already bound listener until `shutdown` completes
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "HTTP listener started");

        tokio::select! {
            _ = shutdown => {
                tracing::info!(addr = %addr, "HTTP listener stopped");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        }
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let max = self.config.max_clients;
        let pending = self.pending.load(Ordering::Acquire);
        if max > 0 && self.handler.client_count() + pending >= max {
            tracing::warn!(
                peer = %peer_addr,
                max_clients = max,
                pending = pending,
                "Connection rejected: limit reached"
            );
            return;
        }

        if let Err(e) = self.configure_socket(&socket) {
            tracing::error!(peer = %peer_addr, error = %e, "Failed to configure socket");
            return;
        }

        let config = self.config.clone();
        let handler = Arc::clone(&self.handler);
        let slot = PendingSlot::acquire(&self.pending);

        tokio::spawn(async move {
            let _slot = slot;
            let mut socket = socket;
            let read = tokio::time::timeout(
                config.request_timeout,
                read_request_head(&mut socket, config.max_request_size),
            )
            .await;

            match read {
                Ok(Ok(head)) => {
                    let request_line = head.lines().next().unwrap_or_default();
                    tracing::info!(peer = %peer_addr, request = %request_line, "HTTP client connected");
                }
                Ok(Err(e)) => {
                    tracing::debug!(peer = %peer_addr, error = %e, "Failed to read request");
                    return;
                }
                Err(_) => {
                    tracing::debug!(peer = %peer_addr, "Request head timed out");
                    return;
                }
            }

            match socket.into_std() {
                Ok(socket) => handler.on_client(socket, peer_addr),
                Err(e) => {
                    tracing::error!(peer = %peer_addr, error = %e, "Failed to detach socket");
                }
            }
        });
    }

    fn configure_socket(&self, socket: &TcpStream) -> std::io::Result<()> {
        if self.config.tcp_nodelay {
            socket.set_nodelay(true)?;
        }
        Ok(())
    }
}

/// Read until the blank line ending the request head
///
/// Bytes after the terminator are discarded; the stream is one-way from
/// here on.
async fn read_request_head(socket: &mut TcpStream, max_size: usize) -> std::io::Result<String> {
    let mut head = Vec::with_capacity(512);
    let mut buf = [0u8; 512];

    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        head.extend_from_slice(&buf[..n]);

        if let Some(end) = find_terminator(&head) {
            head.truncate(end);
            return Ok(String::from_utf8_lossy(&head).into_owned());
        }
        if head.len() >= max_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
    }
}

fn find_terminator(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}
