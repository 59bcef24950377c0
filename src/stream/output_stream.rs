//! Output stream: one destination fed by its own ring and worker
//!
//! ```text
//!   push() ──filter──► Producer ═══ ring ═══ Consumer ──► worker ──► Sink
//!   (ingest thread)                                      (tokio task)
//! ```
//!
//! The ingest side never blocks. When the ring is full, units are dropped
//! and reported. The worker wakes on data and waits at most one poll
//! interval, so a raised stop flag is always noticed.
//!
//! The worker sends whole batches (7 units for UDP, 21 otherwise). A
//! partial batch goes out once it has lingered for `StreamConfig::linger`,
//! or straight away when `drain()` asks for it.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::packet::{is_pat, PidMap, TS_PACKET_SIZE};
use crate::ring::{Consumer, Producer, RingBuffer};
use crate::router::PidFilter;
use crate::stats::StreamStats;

use super::config::StreamConfig;
use super::sink::Sink;
use super::target::{
    OutputSink, SocketMethod, StreamCallback, Target, TargetIdentity, TargetKind, TargetSpec,
};

/// State shared between a stream, its handles and its worker
struct StreamShared {
    /// Stop request
    kill: AtomicBool,
    /// Worker is running
    streaming: AtomicBool,
    count_in: AtomicU64,
    count_out: AtomicU64,
    /// Raised by every successful ring write
    data_ready: Notify,
    /// Flush and sync the sink once the ring is empty
    flush_requested: AtomicBool,
    /// Move a file sink to its next index
    rotate_requested: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl StreamShared {
    fn new() -> Self {
        Self {
            kill: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            count_in: AtomicU64::new(0),
            count_out: AtomicU64::new(0),
            data_ready: Notify::new(),
            flush_requested: AtomicBool::new(false),
            rotate_requested: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }
}

/// Cloneable control handle for a stream
///
/// Lets an owner wait for a worker to exit without holding on to the
/// stream itself, e.g. after releasing the lock that guards it.
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<StreamShared>,
    poll: Duration,
}

impl StreamHandle {
    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::Acquire)
    }

    /// Raise the stop flag and return
    ///
    /// Performs a single atomic store and nothing else.
    pub fn stop_without_wait(&self) {
        self.shared.kill.store(true, Ordering::Release);
    }

    /// Wait until the worker has stopped streaming
    pub async fn wait(&self) {
        while self.is_streaming() {
            tokio::time::sleep(self.poll).await;
        }
    }

    /// See [`OutputStream::drain`]
    pub async fn drain(&self) -> bool {
        if !self.is_streaming() {
            return false;
        }

        self.shared.flush_requested.store(true, Ordering::Release);
        self.shared.data_ready.notify_one();

        while self.shared.flush_requested.load(Ordering::Acquire) {
            if !self.is_streaming() {
                return false;
            }
            tokio::time::sleep(self.poll).await;
        }
        self.is_streaming()
    }

    /// Request termination and wait for it
    pub async fn stop(&self) {
        self.stop_without_wait();
        self.wait().await;
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error()
    }
}

/// One configured destination
pub struct OutputStream {
    config: StreamConfig,
    name: String,
    kind: Option<TargetKind>,
    identity: Option<TargetIdentity>,
    /// Taken by the worker on start
    target: Option<Target>,
    filter: PidFilter,
    /// First PAT seen
    pat: Option<Bytes>,
    producer: Option<Producer>,
    shared: Arc<StreamShared>,
}

impl OutputStream {
    pub fn new() -> Self {
        Self::with_config(StreamConfig::default())
    }

    pub fn with_config(config: StreamConfig) -> Self {
        Self {
            config,
            name: String::new(),
            kind: None,
            identity: None,
            target: None,
            filter: PidFilter::new(),
            pat: None,
            producer: None,
            shared: Arc::new(StreamShared::new()),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Send each batch to an in-process callback
    pub fn add_callback(&mut self, callback: StreamCallback, pids: &PidMap) -> Result<()> {
        self.ensure_idle()?;
        let identity = TargetIdentity::callback(&callback);
        self.configure(Target::Callback(callback), identity, "callback".into(), pids);
        Ok(())
    }

    /// Send each batch to an injected sink object
    pub fn add_interface(&mut self, sink: Arc<dyn OutputSink>, pids: &PidMap) -> Result<()> {
        self.ensure_idle()?;
        let identity = TargetIdentity::interface(&sink);
        self.configure(Target::Interface(sink), identity, "interface".into(), pids);
        Ok(())
    }

    /// Stream over an already-connected socket
    pub fn add_socket(
        &mut self,
        socket: std::net::TcpStream,
        method: SocketMethod,
        pids: &PidMap,
    ) -> Result<()> {
        self.ensure_idle()?;
        let identity = TargetIdentity::socket(&socket, method)?;
        let name = match &identity {
            TargetIdentity::Socket { peer, .. } => peer.to_string(),
            _ => String::new(),
        };
        let target = Target::socket(socket, method)?;
        self.configure(target, identity, name, pids);
        Ok(())
    }

    pub fn add_stdout(&mut self, pids: &PidMap) -> Result<()> {
        self.ensure_idle()?;
        self.configure(Target::Stdout, TargetIdentity::Stdout, "stdout".into(), pids);
        Ok(())
    }

    /// Configure from a target string, see [`TargetSpec::parse`]
    ///
    /// Sockets and files are created here; a failure leaves the stream as
    /// it was.
    pub fn add(&mut self, target: &str, pids: &PidMap) -> Result<()> {
        self.ensure_idle()?;
        let spec = TargetSpec::parse(target)?;
        let opened = Target::open(&spec, &self.config)?;
        let identity = match spec {
            TargetSpec::Stdout => TargetIdentity::Stdout,
            _ => TargetIdentity::Name(target.trim().to_string()),
        };
        self.configure(opened, identity, target.trim().to_string(), pids);
        Ok(())
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.is_streaming() {
            return Err(Error::AlreadyStreaming);
        }
        Ok(())
    }

    fn configure(&mut self, target: Target, identity: TargetIdentity, name: String, pids: &PidMap) {
        let kind = target.kind();

        self.kind = Some(kind);
        self.identity = Some(identity);
        self.target = Some(target);
        self.filter = PidFilter::with_pids(pids);
        self.pat = None;
        self.producer = None;
        self.shared.set_last_error(None);

        tracing::debug!(stream = %name, kind = %kind, pids = pids.len(), "Output stream configured");
        self.name = name;
    }

    /// Allocate the ring and spawn the worker on the current runtime
    ///
    /// No-op if already streaming.
    pub fn start(&mut self) -> Result<()> {
        if self.is_streaming() {
            return Ok(());
        }

        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let target = self.target.take().ok_or(Error::NotConfigured)?;
        let kind = target.kind();

        let (producer, consumer) = RingBuffer::with_capacity(self.config.buffer_capacity()).split();
        self.producer = Some(producer);

        let shared = &self.shared;
        shared.kill.store(false, Ordering::Release);
        shared.flush_requested.store(false, Ordering::Release);
        shared.rotate_requested.store(false, Ordering::Release);
        shared.streaming.store(true, Ordering::Release);

        let worker = Worker {
            consumer,
            shared: Arc::clone(&self.shared),
            config: self.config.clone(),
            name: self.name.clone(),
        };
        runtime.spawn(worker.run(target));

        tracing::info!(
            stream = %self.name,
            kind = %kind,
            buffer = self.config.buffer_capacity(),
            "Output stream started"
        );
        Ok(())
    }

    /// Filter `data` into the ring
    ///
    /// Wanted units are written in runs; a run that does not fit is retried
    /// unit by unit and whatever still does not fit is dropped. Returns
    /// false if anything was dropped, including a trailing partial unit,
    /// or if the stream is not streaming.
    pub fn push(&mut self, data: &[u8]) -> bool {
        if !self.is_streaming() {
            return false;
        }
        let Some(producer) = self.producer.as_mut() else {
            return false;
        };

        let mut outcome = PushOutcome::default();
        let mut run_start = None;

        for (index, unit) in data.chunks(TS_PACKET_SIZE).enumerate() {
            let offset = index * TS_PACKET_SIZE;
            let whole = unit.len() == TS_PACKET_SIZE;
            let wanted = whole && self.filter.want(unit);
            let pinned = if wanted && is_pat(unit) {
                observe_pat(&mut self.pat, unit, self.config.pin_pat, &self.name)
            } else {
                None
            };

            if wanted && pinned.is_none() {
                run_start.get_or_insert(offset);
                continue;
            }

            if let Some(start) = run_start.take() {
                outcome.write(producer, &data[start..offset]);
            }
            if let Some(pat) = pinned {
                outcome.write(producer, &pat);
            }
            if !whole {
                outcome.partial = true;
            }
        }
        if let Some(start) = run_start {
            outcome.write(producer, &data[start..]);
        }

        if outcome.written > 0 {
            self.shared
                .count_in
                .fetch_add(outcome.written as u64, Ordering::Relaxed);
            self.shared.data_ready.notify_one();
        }
        if outcome.dropped > 0 {
            tracing::warn!(
                stream = %self.name,
                dropped = outcome.dropped,
                buffered = producer.size(),
                "Ring buffer full, dropping units"
            );
        }
        if outcome.partial {
            tracing::debug!(stream = %self.name, "Rejected trailing partial unit");
        }

        outcome.dropped == 0 && !outcome.partial
    }

    /// Raise the stop flag and return immediately
    pub fn stop_without_wait(&self) {
        self.handle().stop_without_wait();
    }

    /// Stop the worker and wait for it to exit
    ///
    /// Returns immediately if the stream is not streaming.
    pub async fn stop(&self) {
        if !self.is_streaming() {
            return;
        }
        self.handle().stop().await;
        tracing::info!(
            stream = %self.name,
            bytes_out = self.shared.count_out.load(Ordering::Relaxed),
            "Output stream stopped"
        );
    }

    /// Wait until the ring is empty and the sink is flushed
    ///
    /// Buffered units short of a full batch are sent without lingering.
    /// Returns false if the stream is not streaming, or stops while
    /// draining.
    pub async fn drain(&self) -> bool {
        self.handle().drain().await
    }

    /// Liveness probe
    ///
    /// A stream that has not moved a byte yet counts as alive, so a freshly
    /// added target is never reclaimed.
    pub fn check(&self) -> bool {
        let stats = self.stats();

        tracing::debug!(
            stream = %self.name,
            streaming = stats.streaming,
            bytes_in = stats.bytes_in,
            bytes_out = stats.bytes_out,
            pids = ?stats.pids,
            "Output stream status"
        );

        stats.streaming || stats.bytes_in + stats.bytes_out == 0
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::Acquire)
    }

    pub fn set_pids(&mut self, pids: &PidMap) {
        self.filter.set_pids(pids);
    }

    pub fn reset_pids(&mut self) {
        self.filter.reset_pids();
    }

    pub fn get_pids(&self, out: &mut PidMap) {
        self.filter.get_pids(out);
    }

    /// Reopen a file target under its next index
    ///
    /// While streaming, the worker rotates between two batches.
    pub fn change_file(&mut self) -> Result<()> {
        if self.kind != Some(TargetKind::File) {
            return Err(Error::InvalidTarget(self.name.clone()));
        }

        if self.is_streaming() {
            self.shared.rotate_requested.store(true, Ordering::Release);
            self.shared.data_ready.notify_one();
            return Ok(());
        }

        match self.target.as_mut() {
            Some(Target::File(file)) => {
                file.rotate()?;
                tracing::info!(stream = %self.name, index = file.index, "Output file rotated");
                Ok(())
            }
            _ => Err(Error::NotConfigured),
        }
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            kind: self.kind,
            name: self.name.clone(),
            bytes_in: self.shared.count_in.load(Ordering::Relaxed),
            bytes_out: self.shared.count_out.load(Ordering::Relaxed),
            buffered: self.producer.as_ref().map_or(0, Producer::size),
            streaming: self.is_streaming(),
            pids: self.filter.pids().clone(),
        }
    }

    /// Error that stopped the worker, if any
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error()
    }

    pub fn cached_pat(&self) -> Option<&Bytes> {
        self.pat.as_ref()
    }

    /// Whether this stream is bound to `identity`
    pub fn verify(&self, identity: &TargetIdentity) -> bool {
        self.identity.as_ref() == Some(identity)
    }

    pub fn identity(&self) -> Option<&TargetIdentity> {
        self.identity.as_ref()
    }

    pub fn kind(&self) -> Option<TargetKind> {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> StreamHandle {
        StreamHandle {
            shared: Arc::clone(&self.shared),
            poll: self.config.stop_poll_interval,
        }
    }
}

impl Default for OutputStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.stop_without_wait();
    }
}

/// Cache the first PAT; with pinning, hand back the cached one to send
/// in place of a different live PAT
fn observe_pat(cache: &mut Option<Bytes>, unit: &[u8], pin: bool, name: &str) -> Option<Bytes> {
    match cache {
        None => {
            *cache = Some(Bytes::copy_from_slice(unit));
            tracing::debug!(stream = %name, "PAT cached");
            None
        }
        Some(pat) if pin && pat[..] != unit[..] => Some(pat.clone()),
        Some(_) => None,
    }
}

#[derive(Default)]
struct PushOutcome {
    written: usize,
    dropped: usize,
    partial: bool,
}

impl PushOutcome {
    fn write(&mut self, producer: &mut Producer, data: &[u8]) {
        if producer.write(data) {
            self.written += data.len();
            return;
        }
        for unit in data.chunks(TS_PACKET_SIZE) {
            if producer.write(unit) {
                self.written += unit.len();
            } else {
                self.dropped += 1;
            }
        }
    }
}

/// Reading side of a stream, run as one tokio task
struct Worker {
    consumer: Consumer,
    shared: Arc<StreamShared>,
    config: StreamConfig,
    name: String,
}

impl Worker {
    async fn run(mut self, target: Target) {
        let kind = target.kind();

        let result = match Sink::open(target, &self.config, &self.shared.kill).await {
            Ok(mut sink) => {
                let result = self.pump(&mut sink).await;
                if result.is_ok() {
                    sink.finish(&self.config).await;
                }
                result
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tracing::debug!(stream = %self.name, kind = %kind, "Stream worker exited");
            }
            Err(e) if self.shared.kill.load(Ordering::Acquire) => {
                tracing::debug!(stream = %self.name, error = %e, "Stream worker interrupted");
            }
            Err(e) => {
                tracing::error!(stream = %self.name, kind = %kind, error = %e, "Output stream failed");
                self.shared.set_last_error(Some(e.to_string()));
                self.shared.kill.store(true, Ordering::Release);
            }
        }

        // Sink is closed by now
        self.shared.streaming.store(false, Ordering::Release);
    }

    async fn pump(&mut self, sink: &mut Sink) -> io::Result<()> {
        let kind = sink.kind();
        let batch = self.config.batch_size(kind);
        // A ring smaller than one batch could never fill it
        let threshold = batch.min(self.consumer.capacity());
        let mut partial_since: Option<Instant> = None;

        while !self.shared.kill.load(Ordering::Acquire) {
            if self.shared.rotate_requested.swap(false, Ordering::AcqRel) {
                sink.rotate().await?;
            }

            let buffered = self.consumer.size();
            if buffered < threshold {
                let flushing = self.shared.flush_requested.load(Ordering::Acquire);
                let lingered = if buffered < TS_PACKET_SIZE {
                    partial_since = None;
                    false
                } else {
                    let since = *partial_since.get_or_insert_with(Instant::now);
                    since.elapsed() >= self.config.linger
                };

                if flushing && buffered < TS_PACKET_SIZE {
                    sink.flush().await?;
                    self.shared.flush_requested.store(false, Ordering::Release);
                    continue;
                }
                if !flushing && !lingered {
                    tokio::select! {
                        _ = self.shared.data_ready.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                    continue;
                }
            }

            partial_since = None;
            self.send_batch(sink, kind, batch).await?;
        }

        Ok(())
    }

    /// Move up to one batch of whole units from the ring to the sink
    async fn send_batch(
        &mut self,
        sink: &mut Sink,
        kind: TargetKind,
        batch: usize,
    ) -> io::Result<()> {
        let view = self.consumer.acquire_read(batch);
        let len = view.len() - view.len() % TS_PACKET_SIZE;
        if len == 0 {
            return Ok(());
        }

        let sent = sink
            .transmit(&view[..len], &self.shared.kill, self.config.send_poll_interval)
            .await;
        self.consumer.release_read(len);

        match sent {
            Ok(()) => {
                self.shared.count_out.fetch_add(len as u64, Ordering::Relaxed);
                tracing::trace!(stream = %self.name, bytes = len, "Batch sent");
                Ok(())
            }
            // Datagram loss is not fatal
            Err(e) if kind == TargetKind::Udp && e.kind() != io::ErrorKind::Interrupted => {
                tracing::warn!(stream = %self.name, bytes = len, error = %e, "UDP send failed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::make_packet;
    use crate::stream::http::http_response;
    use crate::stream::target::indexed_path;
    use crate::stream::MimeType;
    use std::path::PathBuf;
    use tokio::io::AsyncReadExt;

    type Collected = Arc<Mutex<Vec<u8>>>;

    fn collector() -> (StreamCallback, Collected) {
        let seen: Collected = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let callback: StreamCallback = Arc::new(move |data: &[u8]| {
            seen_cb.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        });
        (callback, seen)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ts-fanout-{}-{}", name, std::process::id()))
    }

    #[tokio::test]
    async fn test_pid_filtering_preserves_order() {
        let (callback, seen) = collector();
        let mut stream = OutputStream::new();
        stream
            .add_callback(callback, &PidMap::from([(100, 0)]))
            .unwrap();
        tokio_test::assert_ok!(stream.start());

        let mut data = Vec::new();
        data.extend_from_slice(&make_packet(0, 1));
        data.extend_from_slice(&make_packet(100, 2));
        data.extend_from_slice(&make_packet(200, 3));
        assert!(stream.push(&data));

        wait_for(|| stream.stats().bytes_out == 2 * TS_PACKET_SIZE as u64).await;

        let seen = seen.lock().unwrap();
        assert_eq!(&seen[..TS_PACKET_SIZE], &make_packet(0, 1)[..]);
        assert_eq!(&seen[TS_PACKET_SIZE..], &make_packet(100, 2)[..]);
        assert_eq!(stream.stats().bytes_in, 2 * TS_PACKET_SIZE as u64);

        stream.stop().await;
    }

    #[tokio::test]
    async fn test_udp_sends_one_batch() {
        let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let mut stream = OutputStream::new();
        stream
            .add(&format!("udp://127.0.0.1:{}", port), &PidMap::new())
            .unwrap();
        stream.start().unwrap();

        let data: Vec<u8> = (0..7).flat_map(|_| make_packet(0, 0xAA)).collect();
        assert!(stream.push(&data));

        let mut buf = [0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(5), receiver.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 1316);
        assert_eq!(&buf[..n], &data[..]);

        wait_for(|| stream.stats().bytes_out == 1316).await;
        stream.stop().await;
        assert!(!stream.is_streaming());
    }

    #[tokio::test]
    async fn test_udp_single_units_coalesce_into_one_datagram() {
        let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let config = StreamConfig::default().linger(Duration::from_secs(2));
        let mut stream = OutputStream::with_config(config);
        stream
            .add(&format!("udp://127.0.0.1:{}", port), &PidMap::new())
            .unwrap();
        stream.start().unwrap();

        let mut sent = Vec::new();
        for cc in 0..7u8 {
            let packet = make_packet(0, cc);
            assert!(stream.push(&packet));
            sent.extend_from_slice(&packet);
            tokio::time::sleep(Duration::from_millis(3)).await;
        }

        let mut buf = [0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(1), receiver.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 1316);
        assert_eq!(&buf[..n], &sent[..]);

        stream.stop().await;
    }

    #[tokio::test]
    async fn test_drain_sends_partial_batch() {
        let (callback, seen) = collector();
        let config = StreamConfig::default().linger(Duration::from_secs(60));
        let mut stream = OutputStream::with_config(config);
        stream.add_callback(callback, &PidMap::new()).unwrap();
        stream.start().unwrap();

        assert!(stream.push(&make_packet(0, 1)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stream.stats().bytes_out, 0);

        assert!(stream.drain().await);
        assert_eq!(seen.lock().unwrap().len(), TS_PACKET_SIZE);
        stream.stop().await;
    }

    #[tokio::test]
    async fn test_http_preamble_then_chunk() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let mut stream = OutputStream::new();
        stream
            .add_socket(server_side, SocketMethod::Http, &PidMap::new())
            .unwrap();
        assert_eq!(stream.kind(), Some(TargetKind::Http));
        stream.start().unwrap();

        let packet = make_packet(0, 0x55);
        assert!(stream.push(&packet));

        let preamble = http_response(MimeType::OctetStream).into_bytes();
        let expected = preamble.len() + 4 + TS_PACKET_SIZE + 2;

        client.set_nonblocking(true).unwrap();
        let mut client = tokio::net::TcpStream::from_std(client).unwrap();
        let mut received = vec![0u8; expected];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(&received[..preamble.len()], &preamble[..]);
        let chunk = &received[preamble.len()..];
        assert_eq!(&chunk[..4], b"BC\r\n");
        assert_eq!(&chunk[4..4 + TS_PACKET_SIZE], &packet[..]);
        assert_eq!(&chunk[4 + TS_PACKET_SIZE..], b"\r\n");

        stream.stop().await;
    }

    #[tokio::test]
    async fn test_stop_when_idle_returns_immediately() {
        let stream = OutputStream::new();
        tokio::time::timeout(Duration::from_millis(100), stream.stop())
            .await
            .unwrap();
        assert!(!stream.drain().await);
    }

    #[tokio::test]
    async fn test_start_requires_target() {
        let mut stream = OutputStream::new();
        assert!(matches!(stream.start(), Err(Error::NotConfigured)));
        assert!(!stream.push(&make_packet(0, 0)));
    }

    #[test]
    fn test_start_requires_runtime() {
        let mut stream = OutputStream::new();
        stream.add_stdout(&PidMap::new()).unwrap();
        assert!(matches!(stream.start(), Err(Error::NoRuntime)));
    }

    #[tokio::test]
    async fn test_reconfigure_while_streaming_fails() {
        let (callback, _) = collector();
        let mut stream = OutputStream::new();
        stream.add_callback(callback, &PidMap::new()).unwrap();
        stream.start().unwrap();

        assert!(matches!(
            stream.add_stdout(&PidMap::new()),
            Err(Error::AlreadyStreaming)
        ));
        // Starting again is a no-op
        assert!(stream.start().is_ok());

        stream.stop().await;
        assert!(stream.add_stdout(&PidMap::new()).is_ok());
    }

    #[tokio::test]
    async fn test_full_ring_drops_units() {
        let (callback, _) = collector();
        let config = StreamConfig::default().buffer_size(2 * TS_PACKET_SIZE);
        let mut stream = OutputStream::with_config(config);
        stream.add_callback(callback, &PidMap::new()).unwrap();
        stream.start().unwrap();

        // The worker has not run yet on this single-threaded runtime
        let data: Vec<u8> = (0..3).flat_map(|_| make_packet(0, 0)).collect();
        assert!(!stream.push(&data));
        assert_eq!(stream.stats().bytes_in, 2 * TS_PACKET_SIZE as u64);
        assert_eq!(stream.stats().buffered, 2 * TS_PACKET_SIZE);

        stream.stop().await;
    }

    #[tokio::test]
    async fn test_partial_unit_rejected() {
        let (callback, seen) = collector();
        let mut stream = OutputStream::new();
        stream.add_callback(callback, &PidMap::new()).unwrap();
        stream.start().unwrap();

        let mut data = make_packet(0, 7).to_vec();
        data.extend_from_slice(&[0x47, 0x00, 0x00]);
        assert!(!stream.push(&data));

        wait_for(|| stream.stats().bytes_out == TS_PACKET_SIZE as u64).await;
        assert_eq!(seen.lock().unwrap().len(), TS_PACKET_SIZE);
        stream.stop().await;
    }

    #[tokio::test]
    async fn test_callback_error_stops_stream() {
        let callback: StreamCallback = Arc::new(|_: &[u8]| {
            Err::<usize, _>(io::Error::new(io::ErrorKind::BrokenPipe, "consumer gone"))
        });
        let mut stream = OutputStream::new();
        stream.add_callback(callback, &PidMap::new()).unwrap();
        stream.start().unwrap();
        assert!(stream.check());

        stream.push(&make_packet(0, 0));
        wait_for(|| !stream.is_streaming()).await;

        assert!(stream.last_error().unwrap().contains("consumer gone"));
        assert!(!stream.check());
    }

    #[tokio::test]
    async fn test_http_peer_disconnect_stops_stream() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let config = StreamConfig::default().linger(Duration::from_millis(1));
        let mut stream = OutputStream::with_config(config);
        stream
            .add_socket(server_side, SocketMethod::Http, &PidMap::new())
            .unwrap();
        stream.start().unwrap();
        drop(client);

        tokio::time::timeout(Duration::from_secs(5), async {
            while stream.is_streaming() {
                stream.push(&make_packet(0, 0));
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stream kept running after peer went away");

        assert!(stream.last_error().is_some());
        assert!(!stream.check());
    }

    #[tokio::test]
    async fn test_pat_cached_and_pinned() {
        let (callback, seen) = collector();
        let mut stream = OutputStream::with_config(StreamConfig::default().pin_pat(true));
        stream.add_callback(callback, &PidMap::new()).unwrap();
        stream.start().unwrap();

        let first = make_packet(0, 1);
        let second = make_packet(0, 2);
        assert!(stream.push(&first));
        assert!(stream.push(&second));
        assert_eq!(&stream.cached_pat().unwrap()[..], &first[..]);

        wait_for(|| stream.stats().bytes_out == 2 * TS_PACKET_SIZE as u64).await;
        let seen = seen.lock().unwrap();
        assert_eq!(&seen[..TS_PACKET_SIZE], &first[..]);
        assert_eq!(&seen[TS_PACKET_SIZE..], &first[..]);
    }

    #[tokio::test]
    async fn test_pids_merge_and_reset() {
        let mut stream = OutputStream::new();
        stream.add_stdout(&PidMap::from([(100, 1)])).unwrap();
        stream.set_pids(&PidMap::from([(200, 2)]));

        let mut out = PidMap::new();
        stream.get_pids(&mut out);
        assert_eq!(out, PidMap::from([(100, 1), (200, 2)]));

        stream.reset_pids();
        assert!(stream.stats().pids.is_empty());
    }

    #[tokio::test]
    async fn test_file_target_and_rotation() {
        let path = temp_path("rotate");
        let target = format!("file://{}", path.display());

        let mut stream = OutputStream::new();
        stream.add(&target, &PidMap::new()).unwrap();
        assert!(stream.verify(&TargetIdentity::Name(target.clone())));

        stream.start().unwrap();
        assert!(stream.push(&make_packet(0, 1)));
        assert!(stream.drain().await);
        assert_eq!(
            std::fs::read(indexed_path(&path, 0)).unwrap(),
            make_packet(0, 1).to_vec()
        );

        stream.change_file().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(stream.push(&make_packet(0, 1)));
        assert!(stream.drain().await);
        assert_eq!(std::fs::read(indexed_path(&path, 1)).unwrap().len(), TS_PACKET_SIZE);

        stream.stop().await;
        let _ = std::fs::remove_file(indexed_path(&path, 0));
        let _ = std::fs::remove_file(indexed_path(&path, 1));
    }

    #[tokio::test]
    async fn test_change_file_rejects_other_targets() {
        let mut stream = OutputStream::new();
        stream.add_stdout(&PidMap::new()).unwrap();
        assert!(matches!(stream.change_file(), Err(Error::InvalidTarget(_))));
    }
}
