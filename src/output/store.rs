//! Output multiplexer implementation
//!
//! Owns every target stream, fans ingested packets out to them and keeps
//! the collection tidy: duplicate destinations resolve to the existing id,
//! dead streams are reclaimed on `check()`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::packet::{is_pat, PidMap, TS_PACKET_SIZE};
use crate::server::{ClientHandler, HttpServer, ListenerConfig};
use crate::stats::{OutputStats, StreamStats};
use crate::stream::{
    OutputSink, OutputStream, SocketMethod, StreamCallback, StreamHandle, TargetIdentity,
    TargetKind, TargetSpec,
};

use super::config::{OutputConfig, OutputOptions};
use super::fanout::Fanout;
use super::TargetId;

/// Target collection, shared with the fan-out task
pub(crate) struct Targets {
    streams: BTreeMap<TargetId, OutputStream>,
    /// Next id to hand out; ids are never reused
    next_id: TargetId,
    /// First PAT ingested, used to prime late starters
    pat: Option<Bytes>,
}

impl Targets {
    fn new() -> Self {
        Self {
            streams: BTreeMap::new(),
            next_id: 0,
            pat: None,
        }
    }

    /// Live target bound to `identity`; dead ones await reclamation
    fn search(&self, identity: &TargetIdentity) -> Option<TargetId> {
        self.streams
            .iter()
            .find(|(_, stream)| stream.check() && stream.verify(identity))
            .map(|(&id, _)| id)
    }

    /// Push `data` into every streaming target
    pub(crate) fn fan_out(&mut self, data: &[u8]) -> bool {
        if self.pat.is_none() {
            if let Some(pat) = data.chunks_exact(TS_PACKET_SIZE).find(|unit| is_pat(unit)) {
                self.pat = Some(Bytes::copy_from_slice(pat));
                tracing::debug!("PAT cached for late starters");
            }
        }

        let mut delivered = true;
        for stream in self.streams.values_mut() {
            if stream.is_streaming() {
                delivered &= stream.push(data);
            }
        }
        delivered
    }

    /// Start one stream, priming it with the cached PAT
    fn start(&mut self, id: TargetId) -> Result<()> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(Error::TargetNotFound(id))?;
        if stream.is_streaming() {
            return Ok(());
        }

        stream.start()?;
        if let Some(pat) = &self.pat {
            stream.push(pat);
        }
        Ok(())
    }
}

pub(crate) fn lock_targets(targets: &Mutex<Targets>) -> MutexGuard<'_, Targets> {
    targets.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Output multiplexer
///
/// Every method takes `&self`, so one `Arc<Output>` can be shared by the
/// ingest path, a control loop and the HTTP listener.
pub struct Output {
    config: OutputConfig,
    targets: Arc<Mutex<Targets>>,
    fanout: Mutex<Option<Fanout>>,
    count_in: AtomicU64,
}

impl Output {
    /// Create a new multiplexer with default configuration
    pub fn new() -> Self {
        Self::with_config(OutputConfig::default())
    }

    /// Create a new multiplexer with custom configuration
    pub fn with_config(config: OutputConfig) -> Self {
        Self {
            config,
            targets: Arc::new(Mutex::new(Targets::new())),
            fanout: Mutex::new(None),
            count_in: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    fn targets(&self) -> MutexGuard<'_, Targets> {
        lock_targets(&self.targets)
    }

    fn fanout(&self) -> MutexGuard<'_, Option<Fanout>> {
        self.fanout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a target unless a live one bound to `identity` exists already
    ///
    /// The stream is configured without holding the target lock, since
    /// opening a destination may resolve a host and connect. The id is only
    /// consumed if configuration succeeds.
    fn add_target<F>(&self, identity: &TargetIdentity, configure: F) -> Result<TargetId>
    where
        F: FnOnce(&mut OutputStream) -> Result<()>,
    {
        if let Some(id) = self.search(identity) {
            tracing::debug!(id = id, identity = ?identity, "Target already exists");
            return Ok(id);
        }

        let mut stream = OutputStream::with_config(self.config.stream.clone());
        if let Err(e) = configure(&mut stream) {
            tracing::warn!(identity = ?identity, error = %e, "Failed to add target");
            return Err(e);
        }

        let mut targets = self.targets();
        if let Some(id) = targets.search(identity) {
            tracing::debug!(id = id, identity = ?identity, "Target added concurrently");
            return Ok(id);
        }

        let id = targets.next_id;
        targets.next_id += 1;

        tracing::info!(
            id = id,
            stream = %stream.name(),
            kind = ?stream.kind(),
            "Target added"
        );
        targets.streams.insert(id, stream);
        Ok(id)
    }

    pub fn add_callback(&self, callback: StreamCallback, pids: &PidMap) -> Result<TargetId> {
        let identity = TargetIdentity::callback(&callback);
        self.add_target(&identity, |stream| stream.add_callback(callback, pids))
    }

    pub fn add_interface(&self, sink: Arc<dyn OutputSink>, pids: &PidMap) -> Result<TargetId> {
        let identity = TargetIdentity::interface(&sink);
        self.add_target(&identity, |stream| stream.add_interface(sink, pids))
    }

    pub fn add_socket(
        &self,
        socket: std::net::TcpStream,
        method: SocketMethod,
        pids: &PidMap,
    ) -> Result<TargetId> {
        let identity = TargetIdentity::socket(&socket, method)?;
        self.add_target(&identity, |stream| stream.add_socket(socket, method, pids))
    }

    pub fn add_stdout(&self, pids: &PidMap) -> Result<TargetId> {
        self.add_target(&TargetIdentity::Stdout, |stream| stream.add_stdout(pids))
    }

    /// Add one or more comma-separated string targets
    ///
    /// Stops at the first segment that fails. Returns the id of the last
    /// segment.
    pub fn add(&self, targets: &str, pids: &PidMap) -> Result<TargetId> {
        let mut last = Err(Error::InvalidTarget(targets.to_string()));

        for target in targets.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let identity = match TargetSpec::parse(target)? {
                TargetSpec::Stdout => TargetIdentity::Stdout,
                _ => TargetIdentity::Name(target.to_string()),
            };
            last = Ok(self.add_target(&identity, |stream| stream.add(target, pids))?);
        }

        last
    }

    /// Add an accepted HTTP client and start streaming to it
    ///
    /// The client subscribes to [`OutputConfig::client_pids`].
    pub fn add_http_client(&self, socket: std::net::TcpStream) -> Result<TargetId> {
        let id = self.add_socket(socket, SocketMethod::Http, &self.config.client_pids)?;
        self.targets().start(id)?;
        Ok(id)
    }

    /// Serve HTTP clients from this multiplexer
    ///
    /// Spawns the listener on the current runtime; every accepted client
    /// becomes an HTTP target.
    pub fn add_http_server(
        self: &Arc<Self>,
        config: ListenerConfig,
    ) -> Result<JoinHandle<Result<()>>> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let server = HttpServer::new(config, Arc::clone(self));

        Ok(runtime.spawn(async move { server.run().await }))
    }

    /// Id of the live target bound to `identity`, if any
    pub fn search(&self, identity: &TargetIdentity) -> Option<TargetId> {
        self.targets().search(identity)
    }

    /// Ingest packets
    ///
    /// With a running intermediate ring the data is only buffered;
    /// otherwise it is pushed into every streaming target right away.
    /// Returns false if any unit was dropped on the way.
    pub fn push(&self, data: &[u8]) -> bool {
        self.count_in.fetch_add(data.len() as u64, Ordering::Relaxed);

        if let Some(fanout) = self.fanout().as_mut() {
            return fanout.push(data);
        }
        self.targets().fan_out(data)
    }

    /// Ingest one packet tagged with content classes
    ///
    /// Skipped (returning false) unless either side is unrestricted or the
    /// classes intersect the configured ones.
    pub fn push_with_options(&self, packet: &[u8], options: OutputOptions) -> bool {
        if !self.config.options.allows(options) {
            return false;
        }
        self.push(&packet[..packet.len().min(TS_PACKET_SIZE)])
    }

    /// Start every owned target, plus the fan-out task if configured
    pub fn start(&self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        {
            let mut targets = self.targets();
            let ids: Vec<TargetId> = targets.streams.keys().copied().collect();
            for id in ids {
                if let Err(e) = targets.start(id) {
                    tracing::warn!(id = id, error = %e, "Failed to start target");
                }
            }
        }

        if self.config.intermediate_buffer {
            let mut fanout = self.fanout();
            if fanout.is_none() {
                *fanout = Some(Fanout::spawn(
                    &runtime,
                    self.config.intermediate_capacity(),
                    Arc::clone(&self.targets),
                    self.config.stream.poll_interval,
                    self.config.stream.stop_poll_interval,
                ));
            }
        }

        tracing::info!(targets = self.len(), "Output started");
        Ok(())
    }

    /// Wait until every streaming target has sent what it holds
    ///
    /// The intermediate ring, if any, is emptied first. Returns false if a
    /// target stopped while draining.
    pub async fn drain(&self) -> bool {
        let poll = self.config.stream.stop_poll_interval;
        while self
            .fanout()
            .as_ref()
            .is_some_and(|fanout| fanout.is_running() && fanout.buffered() > 0)
        {
            tokio::time::sleep(poll).await;
        }

        let handles: Vec<StreamHandle> = self
            .targets()
            .streams
            .values()
            .filter(|stream| stream.is_streaming())
            .map(OutputStream::handle)
            .collect();

        let mut drained = true;
        for handle in &handles {
            drained &= handle.drain().await;
        }
        drained
    }

    /// Drain one target; false if it is unknown or not streaming
    pub async fn drain_target(&self, id: TargetId) -> bool {
        let handle = self.targets().streams.get(&id).map(OutputStream::handle);
        match handle {
            Some(handle) => handle.drain().await,
            None => false,
        }
    }

    /// Stop everything
    ///
    /// Every target is told to stop first, then each is waited on, so slow
    /// targets shut down in parallel.
    pub async fn stop(&self) {
        let fanout = self.fanout().take();
        if let Some(fanout) = &fanout {
            fanout.stop_without_wait();
        }

        let handles: Vec<StreamHandle> = self
            .targets()
            .streams
            .values()
            .map(|stream| {
                stream.stop_without_wait();
                stream.handle()
            })
            .collect();

        for handle in &handles {
            handle.wait().await;
        }
        if let Some(fanout) = fanout {
            fanout.stop().await;
        }

        tracing::info!(targets = handles.len(), "Output stopped");
    }

    /// Stop one target and wait for it
    pub async fn stop_target(&self, id: TargetId) -> Result<()> {
        let handle = self.targets().streams.get(&id).map(OutputStream::handle);

        match handle {
            Some(handle) => {
                handle.stop().await;
                tracing::info!(id = id, "Target stopped");
                Ok(())
            }
            None => {
                tracing::debug!(id = id, "No such target");
                Err(Error::TargetNotFound(id))
            }
        }
    }

    /// Raise every stop flag without waiting
    pub fn stop_without_wait(&self) {
        if let Some(fanout) = self.fanout().as_ref() {
            fanout.stop_without_wait();
        }
        for stream in self.targets().streams.values() {
            stream.stop_without_wait();
        }
    }

    /// Probe every target and reclaim dead ones
    ///
    /// Returns true if any target is alive.
    pub fn check(&self) -> bool {
        let (alive, dead) = {
            let targets = self.targets();
            let alive = targets.streams.values().filter(|s| s.check()).count();
            (alive, targets.streams.len() - alive)
        };

        if dead > 0 {
            tracing::info!(dead = dead, "Dead targets found");
            self.reclaim_resources();
        }

        let mut pids = PidMap::new();
        self.get_pids(&mut pids);
        if !pids.is_empty() {
            let subscribed: Vec<u16> = pids.keys().copied().collect();
            tracing::debug!(pids = ?subscribed, "Subscribed PIDs");
        }

        alive > 0
    }

    /// Remove every target that is no longer streaming
    ///
    /// Returns the number removed. Ids are not recycled.
    pub fn reclaim_resources(&self) -> usize {
        let mut targets = self.targets();

        let dead: Vec<TargetId> = targets
            .streams
            .iter()
            .filter(|(_, stream)| !stream.check())
            .map(|(&id, _)| id)
            .collect();

        for id in &dead {
            if let Some(stream) = targets.streams.remove(id) {
                tracing::info!(
                    id = *id,
                    stream = %stream.name(),
                    error = ?stream.last_error(),
                    "Target reclaimed"
                );
            }
        }

        dead.len()
    }

    /// Merge every target's subscriptions into `out`
    pub fn get_pids(&self, out: &mut PidMap) {
        for stream in self.targets().streams.values() {
            stream.get_pids(out);
        }
    }

    /// Merge `pids` into one target's subscriptions
    pub fn set_pids(&self, id: TargetId, pids: &PidMap) -> Result<()> {
        self.targets()
            .streams
            .get_mut(&id)
            .map(|stream| stream.set_pids(pids))
            .ok_or(Error::TargetNotFound(id))
    }

    /// Clear subscriptions of one target, or of all with `None`
    pub fn reset_pids(&self, id: Option<TargetId>) -> Result<()> {
        let mut targets = self.targets();

        match id {
            Some(id) => targets
                .streams
                .get_mut(&id)
                .map(OutputStream::reset_pids)
                .ok_or(Error::TargetNotFound(id)),
            None => {
                targets.streams.values_mut().for_each(OutputStream::reset_pids);
                Ok(())
            }
        }
    }

    /// One past the highest id ever assigned
    pub fn num_targets(&self) -> usize {
        self.targets().next_id
    }

    /// Targets currently owned
    pub fn len(&self) -> usize {
        self.targets().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cached_pat(&self) -> Option<Bytes> {
        self.targets().pat.clone()
    }

    pub fn target_stats(&self, id: TargetId) -> Option<StreamStats> {
        self.targets().streams.get(&id).map(OutputStream::stats)
    }

    pub fn stats(&self) -> OutputStats {
        let buffered = self.fanout().as_ref().map_or(0, Fanout::buffered);
        let targets = self.targets();

        let mut stats = OutputStats {
            num_targets: targets.next_id,
            bytes_in: self.count_in.load(Ordering::Relaxed),
            buffered,
            ..Default::default()
        };
        for stream in targets.streams.values() {
            stats.add_stream(&stream.stats());
        }
        stats
    }

    fn http_clients(&self) -> usize {
        self.targets()
            .streams
            .values()
            .filter(|s| s.kind() == Some(TargetKind::Http) && s.is_streaming())
            .count()
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientHandler for Output {
    fn on_client(&self, socket: std::net::TcpStream, peer: SocketAddr) {
        match self.add_http_client(socket) {
            Ok(id) => tracing::debug!(id = id, peer = %peer, "HTTP client streaming"),
            Err(e) => tracing::warn!(peer = %peer, error = %e, "Failed to add HTTP client"),
        }
    }

    fn client_count(&self) -> usize {
        self.http_clients()
    }
}
