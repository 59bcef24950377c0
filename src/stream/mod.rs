//! Output streams
//!
//! An [`OutputStream`] is one destination: a UDP or TCP socket, an HTTP
//! client, a file, stdout, or caller code. It owns a ring buffer fed by
//! [`OutputStream::push`] and a worker task that drains the ring in
//! batches of whole transport units.
//!
//! # Example
//!
//! ```no_run
//! use ts_fanout::packet::PidMap;
//! use ts_fanout::stream::OutputStream;
//!
//! # async fn example(packets: &[u8]) -> ts_fanout::Result<()> {
//! let mut stream = OutputStream::new();
//! stream.add("udp://239.0.0.1:5000", &PidMap::from([(0x100, 0x02)]))?;
//! stream.start()?;
//! stream.push(packets);
//! stream.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod http;
mod output_stream;
mod sink;
pub mod target;

pub use config::{MimeType, StreamConfig};
pub use output_stream::{OutputStream, StreamHandle};
pub use target::{OutputSink, SocketMethod, StreamCallback, TargetIdentity, TargetKind, TargetSpec};
