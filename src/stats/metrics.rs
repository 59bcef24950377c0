//! Statistics snapshots for output streams

use crate::packet::{PidMap, TS_PACKET_SIZE};
use crate::stream::TargetKind;

/// Per-stream statistics
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    /// Sink kind, `None` until a target is configured
    pub kind: Option<TargetKind>,
    /// Target name (string target, peer address or sink kind)
    pub name: String,
    /// Bytes accepted into the ring
    pub bytes_in: u64,
    /// Bytes handed to the sink
    pub bytes_out: u64,
    /// Bytes waiting in the ring
    pub buffered: usize,
    /// Worker is running
    pub streaming: bool,
    /// Subscribed PIDs
    pub pids: PidMap,
}

impl StreamStats {
    /// Transport units accepted
    pub fn packets_in(&self) -> u64 {
        self.bytes_in / TS_PACKET_SIZE as u64
    }

    /// Transport units transmitted
    pub fn packets_out(&self) -> u64 {
        self.bytes_out / TS_PACKET_SIZE as u64
    }
}

/// Multiplexer-wide statistics
#[derive(Debug, Clone, Default)]
pub struct OutputStats {
    /// One past the highest target id ever assigned
    pub num_targets: usize,
    /// Targets currently streaming
    pub active_targets: usize,
    /// Bytes ingested by the multiplexer
    pub bytes_in: u64,
    /// Bytes transmitted, summed over owned targets
    pub bytes_out: u64,
    /// Bytes in the intermediate ring
    pub buffered: usize,
}

impl OutputStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one stream's snapshot into the totals
    pub fn add_stream(&mut self, stream: &StreamStats) {
        if stream.streaming {
            self.active_targets += 1;
        }
        self.bytes_out += stream.bytes_out;
    }
}
