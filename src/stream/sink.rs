//! Transport-specific transmission, run inside the stream worker

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};

use super::config::StreamConfig;
use super::http::{encode_chunk, http_response, END_CHUNK};
use super::target::{open_indexed, OutputSink, StreamCallback, Target, TargetKind};

/// Async side of a [`Target`], owned by the worker
pub(crate) enum Sink {
    Udp {
        socket: UdpSocket,
        addr: SocketAddr,
    },
    Tcp(TcpStream),
    Http(TcpStream),
    File {
        file: tokio::fs::File,
        path: PathBuf,
        index: u32,
    },
    Stdout(tokio::io::Stdout),
    Callback(StreamCallback),
    Interface(Arc<dyn OutputSink>),
}

impl Sink {
    /// Register descriptors with the runtime and send any preamble
    pub(crate) async fn open(
        target: Target,
        config: &StreamConfig,
        stop: &AtomicBool,
    ) -> io::Result<Self> {
        let sink = match target {
            Target::Udp { socket, addr } => Sink::Udp {
                socket: UdpSocket::from_std(socket)?,
                addr,
            },
            Target::Tcp(socket) => Sink::Tcp(TcpStream::from_std(socket)?),
            Target::Http(socket) => {
                let socket = TcpStream::from_std(socket)?;
                let response = http_response(config.mimetype);
                send_all(&socket, response.as_bytes(), stop, config.send_poll_interval).await?;
                Sink::Http(socket)
            }
            Target::File(target) => Sink::File {
                file: tokio::fs::File::from_std(target.file),
                path: target.path,
                index: target.index,
            },
            Target::Stdout => Sink::Stdout(tokio::io::stdout()),
            Target::Callback(callback) => Sink::Callback(callback),
            Target::Interface(sink) => Sink::Interface(sink),
        };

        Ok(sink)
    }

    pub(crate) fn kind(&self) -> TargetKind {
        match self {
            Sink::Udp { .. } => TargetKind::Udp,
            Sink::Tcp(_) => TargetKind::Tcp,
            Sink::Http(_) => TargetKind::Http,
            Sink::File { .. } => TargetKind::File,
            Sink::Stdout(_) => TargetKind::Stdout,
            Sink::Callback(_) => TargetKind::Callback,
            Sink::Interface(_) => TargetKind::Interface,
        }
    }

    /// Send one batch of whole units
    pub(crate) async fn transmit(
        &mut self,
        data: &[u8],
        stop: &AtomicBool,
        poll: Duration,
    ) -> io::Result<()> {
        match self {
            Sink::Udp { socket, addr } => {
                send_datagram(socket, data, *addr, stop, poll).await?;
            }
            Sink::Tcp(socket) => send_all(socket, data, stop, poll).await?,
            Sink::Http(socket) => send_all(socket, &encode_chunk(data), stop, poll).await?,
            Sink::File { file, .. } => file.write_all(data).await?,
            Sink::Stdout(stdout) => {
                stdout.write_all(data).await?;
                stdout.flush().await?;
            }
            Sink::Callback(callback) => {
                callback(data)?;
            }
            Sink::Interface(sink) => {
                sink.stream(data)?;
            }
        }
        Ok(())
    }

    /// Push buffered writes down to the descriptor
    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::File { file, .. } => {
                file.flush().await?;
                file.sync_all().await
            }
            Sink::Stdout(stdout) => stdout.flush().await,
            Sink::Tcp(socket) | Sink::Http(socket) => socket.flush().await,
            _ => Ok(()),
        }
    }

    /// Reopen a file sink under the next index
    pub(crate) async fn rotate(&mut self) -> io::Result<()> {
        let Sink::File { file, path, index } = self else {
            return Ok(());
        };

        file.flush().await?;
        let next = open_indexed(path, *index + 1)?;
        *file = tokio::fs::File::from_std(next);
        *index += 1;

        tracing::info!(path = %path.display(), index = *index, "Output file rotated");
        Ok(())
    }

    /// Clean shutdown: end marker for HTTP, flush for files
    pub(crate) async fn finish(&mut self, config: &StreamConfig) {
        let result = match self {
            Sink::Http(socket) if config.http_end_chunk => {
                let never = AtomicBool::new(false);
                send_all(socket, END_CHUNK, &never, config.send_poll_interval).await
            }
            other => other.flush().await,
        };

        if let Err(e) = result {
            tracing::debug!(error = %e, "Sink shutdown incomplete");
        }
    }
}

fn stopped() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "stream stopped")
}

/// Write all of `data`, polling for writability until done or stopped
async fn send_all(
    socket: &TcpStream,
    mut data: &[u8],
    stop: &AtomicBool,
    poll: Duration,
) -> io::Result<()> {
    while !data.is_empty() {
        if stop.load(Ordering::Acquire) {
            return Err(stopped());
        }
        match tokio::time::timeout(poll, socket.writable()).await {
            Err(_) => continue,
            Ok(ready) => ready?,
        }
        match socket.try_write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn send_datagram(
    socket: &UdpSocket,
    data: &[u8],
    addr: SocketAddr,
    stop: &AtomicBool,
    poll: Duration,
) -> io::Result<usize> {
    loop {
        if stop.load(Ordering::Acquire) {
            return Err(stopped());
        }
        match tokio::time::timeout(poll, socket.writable()).await {
            Err(_) => continue,
            Ok(ready) => ready?,
        }
        match socket.try_send_to(data, addr) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}
