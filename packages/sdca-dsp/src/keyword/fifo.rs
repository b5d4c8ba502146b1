// Fixed-capacity packet pool and FIFO for keyword pre-buffering
//
// Packet entries live in an arena allocated once. Indices move from the free
// pool to the FIFO when produced and back when consumed. The pool and the
// FIFO are guarded independently so the timer-side producer and the reader
// only meet on a single short critical section at a time. When the pool runs
// dry the producer evicts the oldest queued packet (drop-oldest overrun).
//
// `reset` bumps the queue epoch. A reader that popped an index before the
// reset leaves it alone afterwards, since the reset already refilled the pool.

use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use spin::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::{DspError, Result};

#[derive(Debug)]
struct PacketEntry {
    packet_number: u64,
    qpc: u64,
    data: Box<[u8]>,
}

/// Metrics for FIFO monitoring
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FifoStats {
    pub produced: u64,
    pub consumed: u64,
    pub evicted: u64,
    pub queued: usize,
    pub peak_queued: usize,
    pub capacity: usize,
}

/// A packet handed to the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPacket {
    pub packet_number: u64,
    pub qpc: u64,
    /// Another packet is already queued behind this one.
    pub more_data: bool,
}

#[derive(Debug)]
struct Queue {
    order: VecDeque<usize>,
    epoch: u64,
}

pub struct PacketFifo {
    entries: Box<[Mutex<PacketEntry>]>,
    pool: ArrayQueue<usize>,
    fifo: Mutex<Queue>,
    capacity: usize,

    produced: AtomicU64,
    consumed: AtomicU64,
    evicted: AtomicU64,
    peak_queued: AtomicUsize,
}

impl PacketFifo {
    /// Allocate `capacity` entries of `payload_size` bytes each.
    pub fn new(capacity: usize, payload_size: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(DspError::InvalidParameter(
                "packet pool capacity must be non-zero".to_string(),
            ));
        }

        let entries = (0..capacity)
            .map(|_| {
                Mutex::new(PacketEntry {
                    packet_number: 0,
                    qpc: 0,
                    data: vec![0u8; payload_size].into_boxed_slice(),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let pool = ArrayQueue::new(capacity);
        for index in 0..capacity {
            // Capacity matches the index count.
            let _ = pool.push(index);
        }

        Ok(Self {
            entries,
            pool,
            fifo: Mutex::new(Queue {
                order: VecDeque::with_capacity(capacity),
                epoch: 0,
            }),
            capacity,
            produced: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            peak_queued: AtomicUsize::new(0),
        })
    }

    /// Queue packet `packet_number` stamped with `qpc`.
    ///
    /// Returns true if the FIFO was empty before this packet.
    pub fn produce(&self, packet_number: u64, qpc: u64) -> bool {
        let free = self.pool.pop();
        let index = match free {
            Some(index) => index,
            None => {
                let oldest = self.fifo.lock().order.pop_front();
                match oldest {
                    Some(index) => {
                        self.evicted.fetch_add(1, Ordering::Relaxed);
                        index
                    }
                    None => {
                        // Every entry is checked out by a reader.
                        log::warn!("Packet pool exhausted; dropping packet {}", packet_number);
                        self.evicted.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                }
            }
        };

        {
            let mut entry = self.entries[index].lock();
            entry.packet_number = packet_number;
            entry.qpc = qpc;
            entry.data.fill(0);
        }

        let mut fifo = self.fifo.lock();
        let was_empty = fifo.order.is_empty();
        fifo.order.push_back(index);
        self.peak_queued.fetch_max(fifo.order.len(), Ordering::Relaxed);
        self.produced.fetch_add(1, Ordering::Relaxed);
        was_empty
    }

    /// Pop the oldest packet, handing its number and payload to `read`.
    pub fn consume<F>(&self, read: F) -> Option<ReadPacket>
    where
        F: FnOnce(u64, &[u8]),
    {
        let (index, epoch) = {
            let mut fifo = self.fifo.lock();
            (fifo.order.pop_front()?, fifo.epoch)
        };

        let (packet_number, qpc) = {
            let entry = self.entries[index].lock();
            read(entry.packet_number, &entry.data);
            (entry.packet_number, entry.qpc)
        };

        let more_data = {
            let fifo = self.fifo.lock();
            if fifo.epoch == epoch {
                // Capacity matches the index count.
                let _ = self.pool.push(index);
            }
            !fifo.order.is_empty()
        };
        self.consumed.fetch_add(1, Ordering::Relaxed);

        Some(ReadPacket {
            packet_number,
            qpc,
            more_data,
        })
    }

    /// Packet number and timestamp at the head of the FIFO.
    pub fn front(&self) -> Option<(u64, u64)> {
        let fifo = self.fifo.lock();
        let index = *fifo.order.front()?;
        let entry = self.entries[index].lock();
        Some((entry.packet_number, entry.qpc))
    }

    /// Return every entry to the pool.
    ///
    /// Must not race a producer; the detector resets only while holding its
    /// buffering lock, which the producer also holds. Readers may race.
    pub fn reset(&self) {
        let mut fifo = self.fifo.lock();
        fifo.order.clear();
        fifo.epoch += 1;
        while self.pool.pop().is_some() {}
        for index in 0..self.capacity {
            let _ = self.pool.push(index);
        }
    }

    /// Count packets skipped without ever being queued.
    pub fn record_dropped(&self, count: u64) {
        self.evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.fifo.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fifo.lock().order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn payload_size(&self) -> usize {
        self.entries.first().map_or(0, |entry| entry.lock().data.len())
    }

    pub fn stats(&self) -> FifoStats {
        FifoStats {
            produced: self.produced.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            queued: self.len(),
            peak_queued: self.peak_queued.load(Ordering::Relaxed),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(fifo: &PacketFifo) -> Vec<u64> {
        let mut numbers = Vec::new();
        while let Some(packet) = fifo.consume(|_, _| {}) {
            numbers.push(packet.packet_number);
        }
        numbers
    }

    #[test]
    fn test_overrun_keeps_newest_packets() {
        let fifo = PacketFifo::new(100, 320).unwrap();
        for n in 0..150 {
            fifo.produce(n, n * 10);
        }

        let stats = fifo.stats();
        assert_eq!(stats.queued, 100);
        assert_eq!(stats.evicted, 50);
        assert_eq!(drain(&fifo), (50..150).collect::<Vec<_>>());
    }

    #[test]
    fn test_produce_reports_empty_to_non_empty() {
        let fifo = PacketFifo::new(4, 8).unwrap();
        assert!(fifo.produce(0, 1));
        assert!(!fifo.produce(1, 2));
        drain(&fifo);
        assert!(fifo.produce(2, 3));
    }

    #[test]
    fn test_consume_reports_more_data_and_payload() {
        let fifo = PacketFifo::new(4, 8).unwrap();
        fifo.produce(7, 70);
        fifo.produce(8, 80);

        let mut payload = Vec::new();
        let first = fifo
            .consume(|_, data| payload.extend_from_slice(data))
            .unwrap();
        assert_eq!(first, ReadPacket { packet_number: 7, qpc: 70, more_data: true });
        assert_eq!(payload, vec![0u8; 8]);

        let second = fifo.consume(|_, _| {}).unwrap();
        assert!(!second.more_data);
        assert!(fifo.consume(|_, _| {}).is_none());
    }

    #[test]
    fn test_reset_returns_all_entries() {
        let fifo = PacketFifo::new(3, 4).unwrap();
        for n in 0..5 {
            fifo.produce(n, n);
        }
        fifo.reset();
        assert!(fifo.is_empty());
        assert_eq!(fifo.front(), None);

        for n in 10..13 {
            fifo.produce(n, n);
        }
        // No eviction needed after a reset.
        assert_eq!(fifo.stats().evicted, 2);
        assert_eq!(fifo.front(), Some((10, 10)));
    }

    #[test]
    fn test_reset_during_read_keeps_pool_consistent() {
        let fifo = PacketFifo::new(3, 4).unwrap();
        fifo.produce(0, 0);
        fifo.produce(1, 1);

        // A reset lands while the reader holds packet 0, and a producer
        // claims that same index from the refilled pool.
        let mut claimed = None;
        let read = fifo.consume(|_, _| {
            fifo.reset();
            claimed = fifo.pool.pop();
        });
        assert_eq!(read.map(|r| r.packet_number), Some(0));
        assert_eq!(claimed, Some(0));

        // The reader must not hand index 0 back a second time.
        assert_eq!(fifo.pool.len(), 2);
        let mut free = Vec::new();
        while let Some(index) = fifo.pool.pop() {
            free.push(index);
        }
        assert_eq!(free, vec![1, 2]);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(PacketFifo::new(0, 4).is_err());
    }
}
