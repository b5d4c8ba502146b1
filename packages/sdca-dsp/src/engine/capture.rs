use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use super::base::{PacketEngine, StreamCore};
use super::{CapturePacket, PresentationPosition, StreamEngine, StreamState};
use crate::clock::PerformanceClock;
use crate::error::Result;
use crate::format::StreamFormat;
use crate::notify::PacketNotifier;
use crate::source::CaptureSource;

/// Capture stream that synthesizes or replays audio into each packet as it
/// completes.
pub struct CaptureStreamEngine {
    core: StreamCore,
    source: Mutex<Box<dyn CaptureSource>>,
    self_ref: Weak<Self>,
}

impl CaptureStreamEngine {
    pub fn new(
        format: StreamFormat,
        clock: Arc<dyn PerformanceClock>,
        notifier: Arc<dyn PacketNotifier>,
        source: Box<dyn CaptureSource>,
    ) -> Result<Arc<Self>> {
        let core = StreamCore::new("capture", format, clock, notifier)?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            core,
            source: Mutex::new(source),
            self_ref: self_ref.clone(),
        }))
    }

    /// Most recently completed packet and the counter value it started at.
    pub fn get_capture_packet(&self) -> CapturePacket {
        let (packet_number, qpc) = self.core.last_completed_packet();
        CapturePacket {
            packet_number,
            qpc,
            more_data: false,
        }
    }

    pub fn hw_latency(&self) -> (u32, u32) {
        self.core.hw_latency()
    }

    /// Copy of the packet slot `index` as last filled.
    pub fn read_packet(&self, index: usize) -> Result<Vec<u8>> {
        self.core.with_packets(|packets| match packets {
            Some(packets) => packets.packet(index).map(<[u8]>::to_vec),
            None => Err(crate::error::DspError::NotPrepared),
        })
    }
}

impl PacketEngine for CaptureStreamEngine {
    fn core(&self) -> &StreamCore {
        &self.core
    }

    fn stream_pass(&self) {
        self.core.complete_pass(|buffer, _packet_number| {
            self.source.lock().fill(buffer);
            Ok(())
        });
    }
}

impl StreamEngine for CaptureStreamEngine {
    fn prepare_hardware(&self) -> Result<()> {
        self.core.prepare(self.self_ref.clone())
    }

    fn release_hardware(&self) -> Result<()> {
        self.core.release()
    }

    fn run(&self) -> Result<()> {
        self.core.run(|| self.stream_pass())
    }

    fn pause(&self) -> Result<()> {
        self.core.pause()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::format::HNS_PER_SEC;
    use crate::notify::{ChannelNotifier, NotifierEvent};
    use crate::source::{PcmReplay, SilenceSource};

    const SLOW_PACKET: usize = 320_000;

    #[test]
    fn test_packets_are_filled_from_source() {
        let clock = Arc::new(ManualClock::new(HNS_PER_SEC));
        let engine = CaptureStreamEngine::new(
            StreamFormat::default(),
            clock.clone(),
            Arc::new(crate::notify::NullNotifier),
            Box::new(PcmReplay::new(vec![7, 8]).unwrap()),
        )
        .unwrap();
        engine.allocate_rt_packets(2, SLOW_PACKET).unwrap();
        engine.prepare_hardware().unwrap();
        engine.run().unwrap();

        clock.advance_ms(10_000);
        engine.stream_pass();

        let packet = engine.read_packet(0).unwrap();
        assert_eq!(&packet[..4], &[7, 8, 7, 8]);
        assert!(engine.read_packet(1).unwrap().iter().all(|&b| b == 0));
        engine.release_hardware().unwrap();
    }

    #[test]
    fn test_capture_packet_reports_last_completed() {
        let clock = Arc::new(ManualClock::new(HNS_PER_SEC));
        let (tx, rx) = crossbeam::channel::unbounded();
        let engine = CaptureStreamEngine::new(
            StreamFormat::default(),
            clock.clone(),
            Arc::new(ChannelNotifier::new(tx)),
            Box::new(SilenceSource),
        )
        .unwrap();
        engine.allocate_rt_packets(2, SLOW_PACKET).unwrap();
        engine.prepare_hardware().unwrap();
        engine.run().unwrap();

        clock.advance_ms(10_000);
        let first_qpc = clock.query_counter();
        engine.stream_pass();
        clock.advance_ms(10_000);
        engine.stream_pass();

        let packet = engine.get_capture_packet();
        assert_eq!(packet.packet_number, 1);
        assert_eq!(packet.qpc, first_qpc);
        assert!(!packet.more_data);
        assert_eq!(engine.hw_latency(), (0, 0));

        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(
            events[1],
            NotifierEvent::PacketCompleted(n) if n.packet_number == 1
        ));
        engine.release_hardware().unwrap();
    }
}
