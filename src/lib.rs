//! MPEG transport stream fan-out
//!
//! Takes a continuous flow of 188-byte transport units and redistributes it,
//! filtered per destination by PID, to any number of concurrent sinks: UDP
//! and TCP sockets, long-lived chunked HTTP responses, files, stdout and
//! in-process callbacks.
//!
//! # Architecture
//!
//! ```text
//!   demux / tuner                     Arc<Output>
//!        │                ┌──────────────────────────────┐
//!        └──── push() ───►│ [intermediate ring]          │◄─── HttpServer
//!                         │ targets: BTreeMap<id,        │     (add_http_client)
//!                         │   OutputStream {             │
//!                         │     PidFilter,               │
//!                         │     Producer ═ ring ═ Consumer ──► worker task ──► sink
//!                         │   }                          │
//!                         │ >                            │
//!                         └──────────────────────────────┘
//! ```
//!
//! Ingest never blocks. Each target has its own single-producer/single-
//! consumer ring; when a slow target's ring fills, its units are dropped
//! and reported while every other target keeps flowing.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ts_fanout::packet::PidMap;
//! use ts_fanout::{ListenerConfig, Output};
//!
//! # async fn example(packets: &[u8]) -> ts_fanout::Result<()> {
//! let output = Arc::new(Output::new());
//! output.add("udp://239.0.0.1:1234,file:///tmp/capture.ts", &PidMap::new())?;
//! output.add_http_server(ListenerConfig::default())?;
//! output.start()?;
//!
//! output.push(packets);
//!
//! output.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod output;
pub mod packet;
pub mod ring;
pub mod router;
pub mod server;
pub mod stats;
pub mod stream;

pub use error::{Error, Result};
pub use output::{Output, OutputConfig, OutputOptions, TargetId};
pub use packet::{PidMap, TS_PACKET_SIZE};
pub use ring::RingBuffer;
pub use router::PidFilter;
pub use server::{ClientHandler, HttpServer, ListenerConfig};
pub use stats::{OutputStats, StreamStats};
pub use stream::{
    MimeType, OutputSink, OutputStream, SocketMethod, StreamCallback, StreamConfig, TargetKind,
};
