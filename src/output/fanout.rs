//! Intermediate buffering stage
//!
//! With an intermediate ring, ingest only copies into one ring and returns;
//! a separate task moves whole units from there into every streaming
//! target.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::packet::TS_PACKET_SIZE;
use crate::ring::{Consumer, Producer, RingBuffer};

use super::store::{lock_targets, Targets};

struct FanoutShared {
    kill: AtomicBool,
    running: AtomicBool,
    data_ready: Notify,
    count_out: AtomicU64,
}

/// Ingest side of the intermediate ring plus control of its task
pub(crate) struct Fanout {
    producer: Producer,
    shared: Arc<FanoutShared>,
    poll: Duration,
}

impl Fanout {
    pub(crate) fn spawn(
        runtime: &Handle,
        capacity: usize,
        targets: Arc<Mutex<Targets>>,
        poll: Duration,
        stop_poll: Duration,
    ) -> Self {
        let (producer, consumer) = RingBuffer::with_capacity(capacity).split();
        let shared = Arc::new(FanoutShared {
            kill: AtomicBool::new(false),
            running: AtomicBool::new(true),
            data_ready: Notify::new(),
            count_out: AtomicU64::new(0),
        });

        runtime.spawn(run(consumer, Arc::clone(&shared), targets, poll));
        tracing::debug!(capacity = capacity, "Fan-out worker started");

        Self {
            producer,
            shared,
            poll: stop_poll,
        }
    }

    /// Copy whole units into the intermediate ring, dropping what does not fit
    pub(crate) fn push(&mut self, data: &[u8]) -> bool {
        let whole = data.len() - data.len() % TS_PACKET_SIZE;
        let (units, rest) = data.split_at(whole);

        let mut dropped = 0;
        if !self.producer.write(units) {
            dropped = units
                .chunks(TS_PACKET_SIZE)
                .filter(|unit| !self.producer.write(unit))
                .count();
        }
        if dropped < units.len() / TS_PACKET_SIZE {
            self.shared.data_ready.notify_one();
        }
        if dropped > 0 {
            tracing::warn!(
                dropped = dropped,
                buffered = self.producer.size(),
                "Intermediate buffer full, dropping units"
            );
        }

        dropped == 0 && rest.is_empty()
    }

    pub(crate) fn buffered(&self) -> usize {
        self.producer.size()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub(crate) fn stop_without_wait(&self) {
        self.shared.kill.store(true, Ordering::Release);
    }

    pub(crate) async fn stop(self) {
        self.stop_without_wait();
        while self.is_running() {
            tokio::time::sleep(self.poll).await;
        }
    }
}

impl Drop for Fanout {
    fn drop(&mut self) {
        self.stop_without_wait();
    }
}

async fn run(
    mut consumer: Consumer,
    shared: Arc<FanoutShared>,
    targets: Arc<Mutex<Targets>>,
    poll: Duration,
) {
    while !shared.kill.load(Ordering::Acquire) {
        if consumer.size() < TS_PACKET_SIZE {
            tokio::select! {
                _ = shared.data_ready.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
            continue;
        }

        let view = consumer.acquire_read(usize::MAX);
        let len = view.len() - view.len() % TS_PACKET_SIZE;
        if len > 0 {
            lock_targets(&targets).fan_out(&view[..len]);
        }
        consumer.release_read(len);
        shared.count_out.fetch_add(len as u64, Ordering::Relaxed);
    }

    shared.running.store(false, Ordering::Release);
    tracing::debug!(
        bytes_out = shared.count_out.load(Ordering::Relaxed),
        "Fan-out worker exited"
    );
}
