//! Multiplexer configuration

use std::ops::BitOr;

use crate::packet::{PidMap, TS_PACKET_SIZE};
use crate::stream::config::DEFAULT_STREAM_BUFFER_SIZE;
use crate::stream::StreamConfig;

/// Content classes a caller can tag single-packet pushes with
///
/// An empty set on either side means "no restriction".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OutputOptions(u32);

impl OutputOptions {
    pub const NONE: Self = Self(0);
    /// Program and system information tables
    pub const PSIP: Self = Self(1 << 0);
    /// Elementary stream payload
    pub const PES: Self = Self(1 << 1);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Delivery gate for a push tagged `opt` against this configured set
    pub const fn allows(self, opt: Self) -> bool {
        self.is_empty() || opt.is_empty() || self.intersects(opt)
    }
}

impl BitOr for OutputOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Multiplexer configuration options
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Configuration applied to every target stream
    pub stream: StreamConfig,

    /// Buffer ingest in an intermediate ring drained by a fan-out task
    pub intermediate_buffer: bool,

    /// Intermediate ring size in bytes (rounded down to whole units)
    pub intermediate_size: usize,

    /// Content classes this multiplexer delivers
    pub options: OutputOptions,

    /// Subscriptions given to HTTP clients accepted by the listener
    pub client_pids: PidMap,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            intermediate_buffer: false,
            intermediate_size: DEFAULT_STREAM_BUFFER_SIZE * 2,
            options: OutputOptions::NONE,
            client_pids: PidMap::new(),
        }
    }
}

impl OutputConfig {
    /// Set the per-target stream configuration
    pub fn stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    /// Enable the intermediate ring
    pub fn intermediate_buffer(mut self, enabled: bool) -> Self {
        self.intermediate_buffer = enabled;
        self
    }

    /// Set the intermediate ring size
    pub fn intermediate_size(mut self, size: usize) -> Self {
        self.intermediate_size = size;
        self
    }

    pub fn options(mut self, options: OutputOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the subscriptions for listener-accepted HTTP clients
    pub fn client_pids(mut self, pids: PidMap) -> Self {
        self.client_pids = pids;
        self
    }

    pub(crate) fn intermediate_capacity(&self) -> usize {
        (self.intermediate_size / TS_PACKET_SIZE).max(1) * TS_PACKET_SIZE
    }
}
