//! Output stream configuration

use std::time::Duration;

use crate::packet::TS_PACKET_SIZE;

use super::target::TargetKind;

/// Default ring capacity per output stream
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = TS_PACKET_SIZE * 7 * 512;

/// Units per datagram; 7 * 188 = 1316 bytes fits a 1500 byte MTU
pub const UDP_BATCH_PACKETS: usize = 7;

/// Units per write for stream-oriented sinks
pub const STREAM_BATCH_PACKETS: usize = 21;

/// Content type announced in the HTTP response header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MimeType {
    #[default]
    OctetStream,
    TextPlain,
    TextHtml,
    /// Omit the Content-type header
    None,
}

impl MimeType {
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            MimeType::OctetStream => Some("application/octet-stream"),
            MimeType::TextPlain => Some("text/plain"),
            MimeType::TextHtml => Some("text/html"),
            MimeType::None => None,
        }
    }
}

/// Output stream configuration options
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Ring buffer size in bytes (rounded down to whole units)
    pub buffer_size: usize,

    /// Units per UDP datagram
    pub udp_batch_packets: usize,

    /// Units per write for every other sink
    pub batch_packets: usize,

    /// How long a partial batch may wait before it is sent anyway
    pub linger: Duration,

    /// Upper bound on the worker's idle wait between data notifications
    pub poll_interval: Duration,

    /// Writability poll interval while a socket send is pending
    pub send_poll_interval: Duration,

    /// Poll interval for `stop()` and `drain()` waiting on the worker
    pub stop_poll_interval: Duration,

    /// Timeout for outbound TCP connects
    pub connect_timeout: Duration,

    /// Content type for HTTP targets
    pub mimetype: MimeType,

    /// Replace every PAT with the first one seen
    pub pin_pat: bool,

    /// Send the zero-length chunk when an HTTP stream stops cleanly
    pub http_end_chunk: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            udp_batch_packets: UDP_BATCH_PACKETS,
            batch_packets: STREAM_BATCH_PACKETS,
            linger: Duration::from_millis(100),
            poll_interval: Duration::from_millis(1),
            send_poll_interval: Duration::from_millis(10),
            stop_poll_interval: Duration::from_millis(20),
            connect_timeout: Duration::from_secs(5),
            mimetype: MimeType::OctetStream,
            pin_pat: false,
            http_end_chunk: true,
        }
    }
}

impl StreamConfig {
    /// Set the ring buffer size
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the HTTP content type
    pub fn mimetype(mut self, mimetype: MimeType) -> Self {
        self.mimetype = mimetype;
        self
    }

    /// Pin the first PAT seen
    pub fn pin_pat(mut self, pin: bool) -> Self {
        self.pin_pat = pin;
        self
    }

    /// Enable or disable the HTTP end-of-stream chunk
    pub fn http_end_chunk(mut self, enabled: bool) -> Self {
        self.http_end_chunk = enabled;
        self
    }

    /// Set how long a partial batch may linger in the ring
    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// Set the worker idle poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the outbound TCP connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Ring capacity actually allocated: whole units, at least one
    ///
    /// Keeping the capacity a multiple of the unit size means a read view
    /// cut at the physical end of the ring always ends on a unit boundary.
    pub fn buffer_capacity(&self) -> usize {
        (self.buffer_size / TS_PACKET_SIZE).max(1) * TS_PACKET_SIZE
    }

    /// Bytes the worker moves per transmission for a sink kind
    pub fn batch_size(&self, kind: TargetKind) -> usize {
        let packets = match kind {
            TargetKind::Udp => self.udp_batch_packets,
            _ => self.batch_packets,
        };
        packets.max(1) * TS_PACKET_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StreamConfig::default();

        assert_eq!(config.buffer_size % TS_PACKET_SIZE, 0);
        assert_eq!(config.mimetype, MimeType::OctetStream);
        assert!(!config.pin_pat);
        assert!(config.http_end_chunk);
    }

    #[test]
    fn test_batch_sizes() {
        let config = StreamConfig::default();

        assert_eq!(config.batch_size(TargetKind::Udp), 1316);
        assert_eq!(config.batch_size(TargetKind::Http), 188 * 21);
        assert_eq!(config.batch_size(TargetKind::Callback), 188 * 21);
    }

    #[test]
    fn test_buffer_capacity_rounds_to_units() {
        assert_eq!(StreamConfig::default().buffer_size(1000).buffer_capacity(), 940);
        assert_eq!(StreamConfig::default().buffer_size(10).buffer_capacity(), 188);
        assert_eq!(StreamConfig::default().buffer_size(1316).buffer_capacity(), 1316);
    }

    #[test]
    fn test_builder_chaining() {
        let config = StreamConfig::default()
            .mimetype(MimeType::TextPlain)
            .pin_pat(true)
            .http_end_chunk(false)
            .linger(Duration::from_millis(5))
            .connect_timeout(Duration::from_secs(1));

        assert_eq!(config.mimetype.as_str(), Some("text/plain"));
        assert!(config.pin_pat);
        assert!(!config.http_end_chunk);
        assert_eq!(config.linger, Duration::from_millis(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(MimeType::None.as_str(), None);
    }
}
