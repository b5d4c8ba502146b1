use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use super::base::{PacketEngine, StreamCore};
use super::{PresentationPosition, StreamEngine, StreamState};
use crate::clock::PerformanceClock;
use crate::error::{DspError, Result};
use crate::format::StreamFormat;
use crate::notify::PacketNotifier;
use crate::sink::AudioSink;

/// Render stream that persists every completed packet to an `AudioSink`.
pub struct RenderStreamEngine {
    core: StreamCore,
    sink: Mutex<Box<dyn AudioSink>>,
    self_ref: Weak<Self>,
}

impl RenderStreamEngine {
    pub fn new(
        format: StreamFormat,
        clock: Arc<dyn PerformanceClock>,
        notifier: Arc<dyn PacketNotifier>,
        sink: Box<dyn AudioSink>,
    ) -> Result<Arc<Self>> {
        let core = StreamCore::new("render", format, clock, notifier)?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            core,
            sink: Mutex::new(sink),
            self_ref: self_ref.clone(),
        }))
    }

    /// Client side: copy `data` into packet slot `index` ahead of playback.
    pub fn write_packet(&self, index: usize, data: &[u8]) -> Result<()> {
        self.core.with_packets(|packets| {
            let packets = packets.ok_or(DspError::NotPrepared)?;
            let slot = packets.packet_mut(index)?;
            if data.len() > slot.len() {
                return Err(DspError::BufferOverflow {
                    required: data.len(),
                });
            }
            slot[..data.len()].copy_from_slice(data);
            Ok(())
        })
    }

    fn process_packet(&self, buffer: &[u8]) -> Result<()> {
        self.sink.lock().write(buffer)
    }
}

impl PacketEngine for RenderStreamEngine {
    fn core(&self) -> &StreamCore {
        &self.core
    }

    fn stream_pass(&self) {
        self.core
            .complete_pass(|buffer, _packet_number| self.process_packet(buffer));
    }
}

impl StreamEngine for RenderStreamEngine {
    fn prepare_hardware(&self) -> Result<()> {
        self.core.prepare(self.self_ref.clone())
    }

    fn release_hardware(&self) -> Result<()> {
        self.core.release()?;
        self.sink.lock().flush()
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
    use crate::notify::NullNotifier;
    use crate::sink::MemorySink;

    const SLOW_PACKET: usize = 320_000;

    fn engine() -> (Arc<RenderStreamEngine>, Arc<ManualClock>, MemorySink) {
        let clock = Arc::new(ManualClock::new(HNS_PER_SEC));
        let sink = MemorySink::new();
        let engine = RenderStreamEngine::new(
            StreamFormat::default(),
            clock.clone(),
            Arc::new(NullNotifier),
            Box::new(sink.clone()),
        )
        .unwrap();
        (engine, clock, sink)
    }

    fn assert_rejected(result: Result<()>, from: StreamState, to: StreamState) {
        match result {
            Err(DspError::InvalidStateTransition { from: f, to: t }) => {
                assert_eq!((f, t), (from, to));
            }
            other => panic!("expected invalid transition, got {:?}", other),
        }
    }

    #[test]
    fn test_illegal_transitions_leave_state_unchanged() {
        let (engine, _clock, _sink) = engine();

        assert_rejected(engine.run(), StreamState::Stop, StreamState::Run);
        assert_rejected(engine.pause(), StreamState::Stop, StreamState::Pause);
        assert_rejected(engine.release_hardware(), StreamState::Stop, StreamState::Stop);
        assert_eq!(engine.state(), StreamState::Stop);

        engine.allocate_rt_packets(2, SLOW_PACKET).unwrap();
        engine.prepare_hardware().unwrap();
        assert_rejected(engine.prepare_hardware(), StreamState::Pause, StreamState::Pause);
        assert_rejected(engine.pause(), StreamState::Pause, StreamState::Pause);
        assert_eq!(engine.state(), StreamState::Pause);

        engine.run().unwrap();
        assert_rejected(engine.prepare_hardware(), StreamState::Run, StreamState::Pause);
        assert_eq!(engine.state(), StreamState::Run);

        engine.release_hardware().unwrap();
        assert_eq!(engine.state(), StreamState::Stop);
    }

    #[test]
    fn test_double_run_keeps_current_packet() {
        let (engine, clock, _sink) = engine();
        engine.allocate_rt_packets(2, SLOW_PACKET).unwrap();
        engine.prepare_hardware().unwrap();
        engine.run().unwrap();

        clock.advance_ms(10_000);
        engine.stream_pass();
        assert_eq!(engine.current_packet(), 1);

        assert_rejected(engine.run(), StreamState::Run, StreamState::Run);
        assert_eq!(engine.current_packet(), 1);
        assert_eq!(engine.state(), StreamState::Run);
        engine.release_hardware().unwrap();
    }

    #[test]
    fn test_run_without_packets_is_not_prepared() {
        let (engine, _clock, _sink) = engine();
        engine.prepare_hardware().unwrap();
        assert!(matches!(engine.run(), Err(DspError::NotPrepared)));
        assert_eq!(engine.state(), StreamState::Pause);
    }

    #[test]
    fn test_completed_packets_reach_sink_in_ring_order() {
        let (engine, clock, sink) = engine();
        engine.allocate_rt_packets(2, SLOW_PACKET).unwrap();
        engine.prepare_hardware().unwrap();
        engine.run().unwrap();

        for _ in 0..3 {
            clock.advance_ms(10_000);
            engine.stream_pass();
        }
        assert_eq!(engine.current_packet(), 3);
        assert_eq!(sink.writes(), 3);
        assert_eq!(sink.len(), 3 * SLOW_PACKET);

        engine.pause().unwrap();
        assert_eq!(engine.linear_buffer_position(), 3 * SLOW_PACKET as u64);
        engine.release_hardware().unwrap();
    }

    #[test]
    fn test_client_writes_are_rendered() {
        let (engine, clock, sink) = engine();
        engine.allocate_rt_packets(2, SLOW_PACKET).unwrap();
        assert!(engine.write_packet(0, &vec![0u8; SLOW_PACKET + 1]).is_err());
        engine.write_packet(0, &[5; 4]).unwrap();
        engine.prepare_hardware().unwrap();
        engine.run().unwrap();

        clock.advance_ms(10_000);
        engine.stream_pass();
        assert_eq!(&sink.contents()[..5], &[5, 5, 5, 5, 0]);
        engine.release_hardware().unwrap();
        assert!(matches!(engine.write_packet(0, &[1]), Err(DspError::NotPrepared)));
    }

    #[test]
    fn test_release_zeroes_position_and_packets() {
        let (engine, clock, _sink) = engine();
        engine.allocate_rt_packets(1, SLOW_PACKET).unwrap();
        engine.prepare_hardware().unwrap();
        engine.run().unwrap();
        clock.advance_ms(10_000);
        engine.stream_pass();

        engine.release_hardware().unwrap();
        assert_eq!(engine.current_packet(), 0);
        assert_eq!(engine.linear_buffer_position(), 0);
        assert_eq!(engine.packet_count(), 0);
    }
}
