//! Bounded single-producer/single-consumer byte ring
//!
//! A thin layer over [`ringbuf::HeapRb`]. Writes are all-or-nothing. Reads
//! hand out a borrowed view of the buffered bytes without copying; the view
//! never wraps past the physical end of the storage, so draining a wrapped
//! region takes two acquire/release rounds.
//!
//! ```text
//!        tail (read)            head (write)
//!            │                      │
//!   ┌────────▼──────────────────────▼──────────┐
//!   │  free  │██████ buffered ██████│   free   │
//!   └────────┴──────────────────────┴──────────┘
//! ```
//!
//! [`RingBuffer`] owns both ends for single-threaded use. [`RingBuffer::split`]
//! hands the ends to two tasks; each end needs `&mut self` for its side, so
//! one writer and one reader is enforced by the type system.

use ringbuf::traits::{Consumer as _, Observer, Producer as _, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// Writing end of a split ring
pub struct Producer {
    inner: HeapProd<u8>,
    capacity: usize,
}

impl Producer {
    /// Copy `data` in if all of it fits
    ///
    /// Returns false without writing anything when free space is short.
    pub fn write(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }
        if data.len() > self.free() {
            return false;
        }

        let written = self.inner.push_slice(data);
        debug_assert_eq!(written, data.len());
        true
    }

    /// Bytes currently buffered
    pub fn size(&self) -> usize {
        self.inner.occupied_len().min(self.capacity)
    }

    /// Bytes that can still be written
    pub fn free(&self) -> usize {
        self.capacity - self.size()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Reading end of a split ring
pub struct Consumer {
    inner: HeapCons<u8>,
    capacity: usize,
    acquired: usize,
}

impl Consumer {
    /// Borrow up to `max_len` buffered bytes without copying
    ///
    /// The view is also bounded by the physical end of the storage.
    pub fn acquire_read(&mut self, max_len: usize) -> &[u8] {
        let (first, second) = self.inner.as_slices();
        let view = if first.is_empty() { second } else { first };
        let view = &view[..view.len().min(max_len)];

        self.acquired = view.len();
        view
    }

    /// Mark `len` bytes of the last acquired view as consumed
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds what the last `acquire_read` returned.
    pub fn release_read(&mut self, len: usize) {
        assert!(
            len <= self.acquired,
            "release_read({}) exceeds acquired view of {} bytes",
            len,
            self.acquired
        );
        if len == 0 {
            return;
        }

        self.acquired -= len;
        self.inner.skip(len);
    }

    /// Discard everything currently buffered
    pub fn reset(&mut self) {
        self.inner.clear();
        self.acquired = 0;
    }

    /// Bytes currently buffered
    pub fn size(&self) -> usize {
        self.inner.occupied_len().min(self.capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Ring buffer owning both ends
pub struct RingBuffer {
    producer: Producer,
    consumer: Consumer,
}

impl RingBuffer {
    /// Create a ring holding at most `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        // HeapRb needs at least one slot; a zero-capacity ring never accepts data
        let (producer, consumer) = HeapRb::<u8>::new(capacity.max(1)).split();

        Self {
            producer: Producer {
                inner: producer,
                capacity,
            },
            consumer: Consumer {
                inner: consumer,
                capacity,
                acquired: 0,
            },
        }
    }

    /// Split into a writer and a reader for use from two tasks
    pub fn split(self) -> (Producer, Consumer) {
        (self.producer, self.consumer)
    }

    /// See [`Producer::write`]
    pub fn write(&mut self, data: &[u8]) -> bool {
        self.producer.write(data)
    }

    /// See [`Consumer::acquire_read`]
    pub fn acquire_read(&mut self, max_len: usize) -> &[u8] {
        self.consumer.acquire_read(max_len)
    }

    /// See [`Consumer::release_read`]
    pub fn release_read(&mut self, len: usize) {
        self.consumer.release_read(len)
    }

    pub fn size(&self) -> usize {
        self.consumer.size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.consumer.capacity()
    }

    /// Discard all content
    pub fn reset(&mut self) {
        self.consumer.reset();
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{make_packet, TS_PACKET_SIZE};

    fn drain(ring: &mut RingBuffer, max: usize) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let view = ring.acquire_read(max);
            if view.is_empty() {
                break;
            }
            out.extend_from_slice(view);
            let len = view.len();
            ring.release_read(len);
        }
        out
    }

    #[test]
    fn test_write_then_read_in_order() {
        let mut ring = RingBuffer::with_capacity(TS_PACKET_SIZE * 8);
        let mut written = Vec::new();

        for pid in 0..8u16 {
            let pkt = make_packet(pid, pid as u8);
            assert!(ring.write(&pkt));
            written.extend_from_slice(&pkt);
        }
        assert_eq!(ring.size(), TS_PACKET_SIZE * 8);

        assert_eq!(drain(&mut ring, TS_PACKET_SIZE * 3), written);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_order_preserved_across_wrap() {
        let mut ring = RingBuffer::with_capacity(TS_PACKET_SIZE * 5);
        let mut written = Vec::new();
        let mut read = Vec::new();

        // Keep the ring partially full so positions wrap several times
        for round in 0..12u16 {
            let pkt = make_packet(round, round as u8);
            assert!(ring.write(&pkt));
            written.extend_from_slice(&pkt);

            if ring.size() >= TS_PACKET_SIZE * 3 {
                let view = ring.acquire_read(TS_PACKET_SIZE * 2);
                read.extend_from_slice(view);
                let len = view.len();
                ring.release_read(len);
            }
        }
        read.extend(drain(&mut ring, usize::MAX));

        assert_eq!(read, written);
    }

    #[test]
    fn test_view_stops_at_physical_end() {
        let mut ring = RingBuffer::with_capacity(10);
        assert!(ring.write(&[1, 2, 3, 4, 5, 6, 7, 8]));
        let len = ring.acquire_read(6).len();
        ring.release_read(len);

        // Wraps: 8, 9 at the end, 0..4 at the front
        assert!(ring.write(&[9, 10, 11, 12, 13, 14]));
        assert_eq!(ring.size(), 8);

        assert_eq!(ring.acquire_read(100), &[7, 8, 9, 10]);
        ring.release_read(4);
        assert_eq!(ring.acquire_read(100), &[11, 12, 13, 14]);
        ring.release_read(4);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_write_overflow_is_atomic() {
        let mut ring = RingBuffer::with_capacity(TS_PACKET_SIZE * 2);
        let pkt = make_packet(1, 0xaa);
        assert!(ring.write(&pkt));

        let mut big = Vec::new();
        big.extend_from_slice(&make_packet(2, 0xbb));
        big.extend_from_slice(&make_packet(3, 0xcc));
        assert!(!ring.write(&big));

        // Nothing from the failed write landed
        assert_eq!(ring.size(), TS_PACKET_SIZE);
        assert_eq!(drain(&mut ring, usize::MAX), pkt.to_vec());
    }

    #[test]
    fn test_reset() {
        let mut ring = RingBuffer::with_capacity(64);
        assert!(ring.write(&[0u8; 40]));
        let _ = ring.acquire_read(10);
        ring.release_read(10);

        ring.reset();
        assert_eq!(ring.size(), 0);
        assert!(ring.acquire_read(64).is_empty());

        // Full capacity available again
        assert!(ring.write(&[7u8; 64]));
        assert_eq!(ring.size(), 64);
    }

    #[test]
    fn test_zero_capacity() {
        let mut ring = RingBuffer::with_capacity(0);
        assert!(!ring.write(&[1]));
        assert!(ring.write(&[]));
        assert!(ring.acquire_read(10).is_empty());
        assert_eq!(ring.size(), 0);
    }

    #[test]
    #[should_panic]
    fn test_release_more_than_acquired() {
        let mut ring = RingBuffer::with_capacity(16);
        assert!(ring.write(&[0u8; 8]));
        let _ = ring.acquire_read(4);
        ring.release_read(5);
    }

    #[test]
    fn test_consumer_reset_discards() {
        let (mut producer, mut consumer) = RingBuffer::with_capacity(32).split();
        assert!(producer.write(&[1u8; 20]));
        consumer.reset();
        assert_eq!(consumer.size(), 0);
        assert_eq!(producer.free(), 32);
    }

    #[test]
    fn test_split_across_threads() {
        let (mut producer, mut consumer) = RingBuffer::with_capacity(TS_PACKET_SIZE * 4).split();
        let total = 200usize;

        let writer = std::thread::spawn(move || {
            let mut sent = 0;
            while sent < total {
                let pkt = make_packet((sent % 8000) as u16, sent as u8);
                if producer.write(&pkt) {
                    sent += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut received = 0;
        while received < total {
            let view = consumer.acquire_read(TS_PACKET_SIZE);
            if view.len() < TS_PACKET_SIZE {
                std::thread::yield_now();
                continue;
            }
            assert_eq!(view[4], received as u8);
            consumer.release_read(TS_PACKET_SIZE);
            received += 1;
        }

        writer.join().unwrap();
        assert_eq!(consumer.size(), 0);
    }
}
