//! Output targets
//!
//! A target is exactly one destination: a socket, a file, stdout or
//! caller-supplied code. String targets follow this grammar:
//!
//! ```text
//! -  |  fd://0  |  fd:/0            standard output
//! udp://host[:port]                 UDP datagrams (port defaults to 1234)
//! tcp://host[:port]                 outbound TCP connection
//! file://path                       local file, opened as <path>_0
//! host[:port]                       same as udp://
//! ```

use std::fs::{File, OpenOptions};
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};

use super::config::StreamConfig;

/// Port used when a UDP or TCP target leaves it out
pub const DEFAULT_PORT: u16 = 1234;

/// In-process sink invoked with each batch
///
/// Returns the number of bytes consumed. An error stops the stream; the
/// closure's captures play the role of a user context.
pub type StreamCallback = Arc<dyn Fn(&[u8]) -> io::Result<usize> + Send + Sync>;

/// Injected sink object with the same contract as [`StreamCallback`]
pub trait OutputSink: Send + Sync {
    fn stream(&self, data: &[u8]) -> io::Result<usize>;
}

/// Framing used on an already-connected socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMethod {
    /// Raw transport units
    Tcp,
    /// HTTP response with chunked body
    Http,
}

/// Kind of sink behind an output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Udp,
    Tcp,
    Http,
    File,
    Stdout,
    Callback,
    Interface,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TargetKind::Udp => "UDP",
            TargetKind::Tcp => "TCP",
            TargetKind::Http => "HTTP",
            TargetKind::File => "FILE",
            TargetKind::Stdout => "STDOUT",
            TargetKind::Callback => "FUNC",
            TargetKind::Interface => "INTF",
        };
        f.write_str(name)
    }
}

/// Parsed string target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    Stdout,
    Udp { host: String, port: u16 },
    Tcp { host: String, port: u16 },
    File { path: PathBuf },
}

impl TargetSpec {
    /// Parse a target string
    ///
    /// Only exact `tcp`, `udp` and `file` schemes are recognized. Anything
    /// else before the first colon is taken as a host name for UDP.
    pub fn parse(target: &str) -> Result<Self> {
        let target = target.trim();
        let invalid = || Error::InvalidTarget(target.to_string());

        if matches!(target, "-" | "fd://0" | "fd:/0") {
            return Ok(TargetSpec::Stdout);
        }
        if target.is_empty() {
            return Err(invalid());
        }

        let Some((head, rest)) = target.split_once(':') else {
            return Ok(TargetSpec::Udp {
                host: target.to_string(),
                port: DEFAULT_PORT,
            });
        };

        let rest = rest.strip_prefix("//").unwrap_or(rest);
        let (host, port) = match head {
            "file" => {
                if rest.is_empty() {
                    return Err(invalid());
                }
                return Ok(TargetSpec::File {
                    path: PathBuf::from(rest),
                });
            }
            "tcp" | "udp" => match rest.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            },
            // Bare host:port
            _ => (head, Some(rest)),
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
            None => DEFAULT_PORT,
        };
        if port == 0 {
            return Err(invalid());
        }

        let host = host.to_string();
        Ok(if head == "tcp" {
            TargetSpec::Tcp { host, port }
        } else {
            TargetSpec::Udp { host, port }
        })
    }
}

/// What makes two targets "the same destination"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetIdentity {
    /// Target added from a string
    Name(String),
    Stdout,
    /// Address of the callback allocation
    Callback(usize),
    /// Address of the sink object
    Interface(usize),
    Socket {
        local: SocketAddr,
        peer: SocketAddr,
        method: SocketMethod,
    },
}

impl TargetIdentity {
    pub fn callback(callback: &StreamCallback) -> Self {
        TargetIdentity::Callback(Arc::as_ptr(callback) as *const () as usize)
    }

    pub fn interface(sink: &Arc<dyn OutputSink>) -> Self {
        TargetIdentity::Interface(Arc::as_ptr(sink) as *const () as usize)
    }

    pub fn socket(socket: &TcpStream, method: SocketMethod) -> io::Result<Self> {
        Ok(TargetIdentity::Socket {
            local: socket.local_addr()?,
            peer: socket.peer_addr()?,
            method,
        })
    }
}

/// File sink with its rotation index
#[derive(Debug)]
pub(crate) struct FileTarget {
    pub(crate) file: File,
    pub(crate) path: PathBuf,
    pub(crate) index: u32,
}

impl FileTarget {
    pub(crate) fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: open_indexed(path, 0)?,
            path: path.to_path_buf(),
            index: 0,
        })
    }

    /// Close the current file and open the next index
    pub(crate) fn rotate(&mut self) -> io::Result<()> {
        self.file = open_indexed(&self.path, self.index + 1)?;
        self.index += 1;
        Ok(())
    }
}

/// `<path>_<index>` for file targets
pub fn indexed_path(path: &Path, index: u32) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!("_{}", index));
    PathBuf::from(name)
}

pub(crate) fn open_indexed(path: &Path, index: u32) -> io::Result<File> {
    let path = indexed_path(path, index);
    tracing::debug!(path = %path.display(), "Opening output file");

    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}

/// A configured destination, before its worker takes ownership
pub(crate) enum Target {
    Udp { socket: UdpSocket, addr: SocketAddr },
    Tcp(TcpStream),
    Http(TcpStream),
    File(FileTarget),
    Stdout,
    Callback(StreamCallback),
    Interface(Arc<dyn OutputSink>),
}

impl Target {
    /// Create the descriptor a parsed string target needs
    pub(crate) fn open(spec: &TargetSpec, config: &StreamConfig) -> Result<Self> {
        match spec {
            TargetSpec::Stdout => Ok(Target::Stdout),
            TargetSpec::File { path } => Ok(Target::File(FileTarget::open(path)?)),
            TargetSpec::Udp { host, port } => {
                let addr = resolve(host, *port)?;
                let socket = UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, 0))?;
                socket.set_nonblocking(true)?;
                Ok(Target::Udp { socket, addr })
            }
            TargetSpec::Tcp { host, port } => {
                let addr = resolve(host, *port)?;
                let socket = TcpStream::connect_timeout(&addr, config.connect_timeout)?;
                socket.set_nonblocking(true)?;
                Ok(Target::Tcp(socket))
            }
        }
    }

    /// Wrap an already-connected socket
    pub(crate) fn socket(socket: TcpStream, method: SocketMethod) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(match method {
            SocketMethod::Tcp => Target::Tcp(socket),
            SocketMethod::Http => Target::Http(socket),
        })
    }

    pub(crate) fn kind(&self) -> TargetKind {
        match self {
            Target::Udp { .. } => TargetKind::Udp,
            Target::Tcp(_) => TargetKind::Tcp,
            Target::Http(_) => TargetKind::Http,
            Target::File(_) => TargetKind::File,
            Target::Stdout => TargetKind::Stdout,
            Target::Callback(_) => TargetKind::Callback,
            Target::Interface(_) => TargetKind::Interface,
        }
    }
}

/// Resolve to the first IPv4 address of `host`
fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|_| Error::Resolve(host.to_string()))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| Error::Resolve(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stdout() {
        for target in ["-", "fd://0", "fd:/0"] {
            assert_eq!(TargetSpec::parse(target).unwrap(), TargetSpec::Stdout);
        }
    }

    #[test]
    fn test_parse_schemes() {
        assert_eq!(
            TargetSpec::parse("udp://239.1.1.1:5000").unwrap(),
            TargetSpec::Udp {
                host: "239.1.1.1".into(),
                port: 5000
            }
        );
        assert_eq!(
            TargetSpec::parse("tcp://example.com:9000").unwrap(),
            TargetSpec::Tcp {
                host: "example.com".into(),
                port: 9000
            }
        );
        assert_eq!(
            TargetSpec::parse("tcp://10.0.0.1").unwrap(),
            TargetSpec::Tcp {
                host: "10.0.0.1".into(),
                port: DEFAULT_PORT
            }
        );
        assert_eq!(
            TargetSpec::parse("file:///tmp/capture.ts").unwrap(),
            TargetSpec::File {
                path: PathBuf::from("/tmp/capture.ts")
            }
        );
    }

    #[test]
    fn test_parse_bare_host_defaults_to_udp() {
        assert_eq!(
            TargetSpec::parse("192.168.1.20").unwrap(),
            TargetSpec::Udp {
                host: "192.168.1.20".into(),
                port: DEFAULT_PORT
            }
        );
        assert_eq!(
            TargetSpec::parse("192.168.1.20:4000").unwrap(),
            TargetSpec::Udp {
                host: "192.168.1.20".into(),
                port: 4000
            }
        );
    }

    #[test]
    fn test_parse_invalid() {
        for target in ["", "udp://", "tcp://:80", "udp://host:notaport", "file://", "host:0"] {
            assert!(
                matches!(TargetSpec::parse(target), Err(Error::InvalidTarget(_))),
                "{} should be rejected",
                target
            );
        }
    }

    #[test]
    fn test_indexed_path() {
        assert_eq!(
            indexed_path(Path::new("/tmp/out.ts"), 3),
            PathBuf::from("/tmp/out.ts_3")
        );
    }

    #[test]
    fn test_callback_identity() {
        let a: StreamCallback = Arc::new(|data: &[u8]| Ok(data.len()));
        let b: StreamCallback = Arc::new(|data: &[u8]| Ok(data.len()));

        assert_eq!(
            TargetIdentity::callback(&a),
            TargetIdentity::callback(&Arc::clone(&a))
        );
        assert_ne!(TargetIdentity::callback(&a), TargetIdentity::callback(&b));
    }

    #[test]
    fn test_resolve_ipv4() {
        let addr = resolve("127.0.0.1", 1234).unwrap();
        assert_eq!(addr, "127.0.0.1:1234".parse().unwrap());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(TargetKind::Callback.to_string(), "FUNC");
        assert_eq!(TargetKind::Http.to_string(), "HTTP");
    }
}
