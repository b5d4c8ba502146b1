// Hardware-offloaded render stream
//
// The offload engine does not self-schedule per packet. A periodic timer
// stands in for the DSP consuming one packet per period (`packets_read`)
// while the client reports how far it has written (`packets_written`)
// through `set_current_write_position`. Two packets are tracked ping-pong;
// a single packet is tracked as a circular write cursor.
//
// The final partial buffer is announced with `set_last_buffer_position`,
// which arms a one-shot timer for when that data has been played out.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::base::StreamCore;
use super::{PresentationPosition, StreamEngine, StreamState};
use crate::clock::PerformanceClock;
use crate::error::{DspError, Result};
use crate::format::{StreamFormat, HNS_PER_MS};
use crate::notify::PacketNotifier;
use crate::sink::AudioSink;
use crate::timer::NotificationTimer;

/// Fixed delay between the linear position and what is audible, 100ns units.
pub const PRESENTATION_LAG_HNS: u64 = 20 * HNS_PER_MS;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OffloadStats {
    pub packets_written: u64,
    pub packets_read: u64,
    pub starvation_events: u64,
    pub incorrect_writes: u64,
    pub end_of_stream: bool,
}

#[derive(Debug, Default)]
struct WriteTracking {
    stats: OffloadStats,
    /// Single-packet mode write cursor, bytes into the packet.
    write_cursor: usize,
    bytes_written: u64,
}

pub struct OffloadStreamEngine {
    core: StreamCore,
    sink: Mutex<Box<dyn AudioSink>>,
    tracking: Mutex<WriteTracking>,
    last_buffer_timer: Mutex<Option<Arc<NotificationTimer>>>,
    self_ref: Weak<Self>,
}

impl OffloadStreamEngine {
    pub fn new(
        format: StreamFormat,
        clock: Arc<dyn PerformanceClock>,
        notifier: Arc<dyn PacketNotifier>,
        sink: Box<dyn AudioSink>,
    ) -> Result<Arc<Self>> {
        let core = StreamCore::new("offload", format, clock, notifier)?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            core,
            sink: Mutex::new(sink),
            tracking: Mutex::new(WriteTracking::default()),
            last_buffer_timer: Mutex::new(None),
            self_ref: self_ref.clone(),
        }))
    }

    pub fn offload_stats(&self) -> OffloadStats {
        self.tracking.lock().stats
    }

    fn period(&self) -> Duration {
        let period_hns = self.core.format().bytes_to_hns(self.core.packet_size() as u64);
        Duration::from_nanos(period_hns.saturating_mul(100))
    }

    /// One DSP period elapsed: the hardware consumed a packet.
    fn on_period(&self) {
        let qpc = self.core.clock().query_counter();
        {
            let mut tracking = self.tracking.lock();
            let stats = &mut tracking.stats;
            stats.packets_read += 1;
            if stats.packets_read > stats.packets_written {
                stats.starvation_events += 1;
                log::warn!(
                    "Offload starvation: read {} packets, only {} written",
                    stats.packets_read,
                    stats.packets_written
                );
            }
        }
        let completed = self.core.advance_packet(qpc);
        self.core.notify(completed, qpc);
    }

    fn on_last_buffer_rendered(&self) {
        let qpc = self.core.clock().query_counter();
        self.tracking.lock().stats.end_of_stream = true;
        log::info!("Offload stream reached end of stream");
        self.core.notifier().last_buffer_rendered(qpc);
    }

    fn stop_last_buffer_timer(&self) {
        let timer = self.last_buffer_timer.lock().clone();
        if let Some(timer) = timer {
            timer.stop();
        }
    }

    fn geometry(&self) -> Result<(usize, usize)> {
        let count = self.core.packet_count();
        if count == 0 {
            return Err(DspError::NotPrepared);
        }
        Ok((count, self.core.packet_size()))
    }

    fn persist(&self, index: usize, ranges: &[Range<usize>]) -> Result<()> {
        self.core.with_packets(|packets| {
            let packets = packets.ok_or(DspError::NotPrepared)?;
            let buffer = packets.packet(index)?;
            let mut sink = self.sink.lock();
            for range in ranges.iter().filter(|r| !r.is_empty()) {
                sink.write(&buffer[range.clone()])?;
            }
            Ok(())
        })
    }

    /// Byte ranges written since the cursor, advancing it to `position`.
    fn advance_cursor(tracking: &mut WriteTracking, position: usize, size: usize) -> Vec<Range<usize>> {
        let cursor = tracking.write_cursor;
        let ranges = if position >= cursor {
            vec![cursor..position]
        } else {
            vec![cursor..size, 0..position]
        };
        let written: usize = ranges.iter().map(|r| r.len()).sum();
        tracking.bytes_written += written as u64;
        tracking.stats.packets_written = tracking.bytes_written / size as u64;
        tracking.write_cursor = position;
        ranges
    }

    /// Client write progress. `position` is a byte offset into the packet
    /// ring; in ping-pong mode it must sit on a packet boundary.
    pub fn set_current_write_position(&self, position: usize) -> Result<()> {
        let (count, size) = self.geometry()?;
        if position > count * size {
            return Err(DspError::InvalidParameter(format!(
                "write position {} beyond {} byte ring",
                position,
                count * size
            )));
        }

        if count == 1 {
            let ranges = {
                let mut tracking = self.tracking.lock();
                Self::advance_cursor(&mut tracking, position, size)
            };
            return self.persist(0, &ranges);
        }

        if position % size != 0 {
            return Err(DspError::InvalidParameter(format!(
                "write position {} not on a {} byte packet boundary",
                position, size
            )));
        }

        // Position 0 wraps to the end of the last packet.
        let completed = ((position / size) + count - 1) % count;
        {
            let mut tracking = self.tracking.lock();
            let stats = &mut tracking.stats;
            let expected = (stats.packets_written % count as u64) as usize;
            if completed != expected {
                stats.incorrect_writes += 1;
                log::warn!(
                    "Incorrect packet write: completed packet {}, expected {}",
                    completed,
                    expected
                );
            }
            stats.packets_written += 1;
            if stats.packets_written <= stats.packets_read {
                log::warn!(
                    "Write position behind the DSP ({} written, {} read); catching up",
                    stats.packets_written,
                    stats.packets_read
                );
                stats.packets_written = stats.packets_read + 1;
            }
        }
        self.persist(completed, &[0..size])
    }

    /// Announce the final partial buffer holding `position` valid bytes.
    pub fn set_last_buffer_position(&self, position: usize) -> Result<()> {
        let (count, size) = self.geometry()?;
        if position > size {
            return Err(DspError::InvalidParameter(format!(
                "last buffer position {} larger than packet size {}",
                position, size
            )));
        }

        let (index, ranges, end) = {
            let mut tracking = self.tracking.lock();
            if count == 1 {
                let ranges = Self::advance_cursor(&mut tracking, position, size);
                (0, ranges, tracking.bytes_written)
            } else {
                let written = tracking.stats.packets_written;
                let index = (written % count as u64) as usize;
                (index, vec![0..position], written * size as u64 + position as u64)
            }
        };

        let remaining = end.saturating_sub(self.core.linear_position());
        let delay_hns = self.core.format().bytes_to_hns(remaining) + PRESENTATION_LAG_HNS;
        let timer = self.last_buffer_timer.lock().clone();
        match timer {
            Some(timer) => timer.start(Duration::from_nanos(delay_hns.saturating_mul(100))),
            None => return Err(DspError::NotPrepared),
        }
        log::debug!(
            "Last buffer ends at byte {}, {} bytes outstanding, EOS in {} hns",
            end,
            remaining,
            delay_hns
        );

        self.persist(index, &ranges)
    }
}

impl StreamEngine for OffloadStreamEngine {
    fn prepare_hardware(&self) -> Result<()> {
        self.core.check_prepare()?;

        let engine = self.self_ref.clone();
        let period_timer = NotificationTimer::new("offload-period", move || {
            if let Some(engine) = engine.upgrade() {
                engine.on_period();
            }
        })?;
        let engine = self.self_ref.clone();
        let last_buffer_timer = NotificationTimer::new("offload-last-buffer", move || {
            if let Some(engine) = engine.upgrade() {
                engine.on_last_buffer_rendered();
            }
        })?;

        self.core.commit_prepare(period_timer)?;
        *self.last_buffer_timer.lock() = Some(Arc::new(last_buffer_timer));
        Ok(())
    }

    fn release_hardware(&self) -> Result<()> {
        self.core.check_release()?;
        let timer = self.last_buffer_timer.lock().take();
        if let Some(timer) = timer {
            timer.stop();
        }
        self.core.release()?;
        *self.tracking.lock() = WriteTracking::default();
        self.sink.lock().flush()
    }

    fn run(&self) -> Result<()> {
        self.core.begin_run()?;
        let period = self.period();
        if let Some(timer) = self.core.timer() {
            timer.start_periodic(period, period);
        }
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.core.pause()?;
        self.stop_last_buffer_timer();
        Ok(())
    }

    fn allocate_rt_packets(&self, count: usize, size: usize) -> Result<()> {
        self.core.allocate_packets(count, size)?;
        *self.tracking.lock() = WriteTracking::default();
        Ok(())
    }

    fn free_rt_packets(&self) {
        self.core.free_packets()
    }

    fn state(&self) -> StreamState {
        self.core.state()
    }

    fn format(&self) -> StreamFormat {
        self.core.format()
    }

    fn current_packet(&self) -> u64 {
        self.core.current_packet()
    }

    fn linear_buffer_position(&self) -> u64 {
        self.core.linear_position()
    }

    fn presentation_position(&self) -> PresentationPosition {
        let format = self.core.format();
        let elapsed = format.bytes_to_hns(self.core.linear_position());
        let presented = format.hns_to_bytes(elapsed.saturating_sub(PRESENTATION_LAG_HNS));
        PresentationPosition {
            frames: format.bytes_to_frames(presented),
            qpc: self.core.clock().query_counter(),
        }
    }

    fn packet_count(&self) -> usize {
        self.core.packet_count()
    }

    fn packet_size(&self) -> usize {
        self.core.packet_size()
    }
}
