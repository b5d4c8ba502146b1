// Capture stream fed from the keyword detector's packet FIFO
//
// The timer still ticks once per packet and advances `current_packet`, but
// packet production belongs to `KeywordDetector::dpc_routine`. The framework
// is notified from the tick only when the FIFO just became non-empty; while
// a backlog exists, each `get_capture_packet` announces the next one.

use std::sync::{Arc, Weak};

use super::base::{PacketEngine, StreamCore};
use super::{CapturePacket, PresentationPosition, StreamEngine, StreamState};
use crate::clock::PerformanceClock;
use crate::error::{DspError, Result};
use crate::format::StreamFormat;
use crate::keyword::KeywordDetector;
use crate::notify::{PacketNotification, PacketNotifier};

pub struct BufferedCaptureStreamEngine {
    core: StreamCore,
    detector: Arc<KeywordDetector>,
    self_ref: Weak<Self>,
}

impl BufferedCaptureStreamEngine {
    pub fn new(
        clock: Arc<dyn PerformanceClock>,
        notifier: Arc<dyn PacketNotifier>,
        detector: Arc<KeywordDetector>,
    ) -> Result<Arc<Self>> {
        let core = StreamCore::new("buffered-capture", detector.format(), clock, notifier)?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            core,
            detector,
            self_ref: self_ref.clone(),
        }))
    }

    pub fn detector(&self) -> &Arc<KeywordDetector> {
        &self.detector
    }

    fn notify_front(&self) {
        if let Some(PacketNotification { packet_number, qpc }) = self.detector.fifo_front() {
            self.core.notify(packet_number, qpc);
        }
    }

    /// Pop the oldest buffered packet into its slot in the packet ring.
    pub fn get_capture_packet(&self) -> Result<CapturePacket> {
        let read = self.core.with_packets(|packets| match packets {
            Some(packets) => self.detector.get_read_packet(packets),
            None => Err(DspError::NotPrepared),
        })?;

        if read.more_data {
            self.notify_front();
        }

        Ok(CapturePacket {
            packet_number: read.packet_number,
            qpc: read.qpc,
            more_data: read.more_data,
        })
    }

    pub fn hw_latency(&self) -> (u32, u32) {
        self.core.hw_latency()
    }
}

impl PacketEngine for BufferedCaptureStreamEngine {
    fn core(&self) -> &StreamCore {
        &self.core
    }

    fn stream_pass(&self) {
        let clock = self.core.clock();
        let qpc = clock.query_counter();
        self.core.advance_packet(qpc);

        let outcome = self.detector.dpc_routine(qpc, clock.frequency());
        if outcome.is_realtime && self.core.state() == StreamState::Run {
            if let Some(next) = outcome.next {
                self.core.notify(next.packet_number, next.qpc);
            }
        }
    }
}

impl StreamEngine for BufferedCaptureStreamEngine {
    fn prepare_hardware(&self) -> Result<()> {
        self.core.prepare(self.self_ref.clone())
    }

    fn release_hardware(&self) -> Result<()> {
        self.core.release()?;
        if self.detector.is_stream_running() {
            self.detector.stop();
        }
        Ok(())
    }

    fn run(&self) -> Result<()> {
        self.core.run(|| self.stream_pass())?;
        self.detector.run();
        self.notify_front();
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        // Timer first, so no DPC pass overlaps the window reset.
        self.core.pause()?;
        self.detector.stop();
        Ok(())
    }

    fn allocate_rt_packets(&self, count: usize, size: usize) -> Result<()> {
        self.core.allocate_packets(count, size)
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
        self.core.presentation_position()
    }

    fn packet_count(&self) -> usize {
        self.core.packet_count()
    }

    fn packet_size(&self) -> usize {
        self.core.packet_size()
    }
}
