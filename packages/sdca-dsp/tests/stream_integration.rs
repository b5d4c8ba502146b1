use crossbeam::channel::Receiver;
use sdca_dsp::packets::PAGE_SIZE;
use sdca_dsp::sink::MemorySink;
use sdca_dsp::source::ToneGenerator;
use sdca_dsp::{
    CaptureStreamEngine, ChannelNotifier, DspError, ManualClock, NotifierEvent, NullNotifier,
    OffloadStreamEngine, PerformanceClock, RenderStreamEngine, RtPackets, StreamEngine,
    StreamFormat, StreamState, SystemClock,
};
use std::sync::Arc;
use std::time::Duration;

/// 10ms at 16 kHz mono 16-bit
const PACKET_10MS: usize = 320;
/// 10s packets keep the engine timer idle for the whole test
const PACKET_10S: usize = 320_000;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn completed(rx: &Receiver<NotifierEvent>) -> Vec<u64> {
    rx.try_iter()
        .filter_map(|event| match event {
            NotifierEvent::PacketCompleted(n) => Some(n.packet_number),
            _ => None,
        })
        .collect()
}

fn render_engine(clock: Arc<dyn PerformanceClock>) -> (Arc<RenderStreamEngine>, MemorySink) {
    let sink = MemorySink::new();
    let engine = RenderStreamEngine::new(
        StreamFormat::default(),
        clock,
        Arc::new(NullNotifier),
        Box::new(sink.clone()),
    )
    .unwrap();
    (engine, sink)
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Prepare,
    Run,
    Pause,
    Release,
}

fn apply(engine: &dyn StreamEngine, op: Op) -> Result<(), DspError> {
    match op {
        Op::Prepare => engine.prepare_hardware(),
        Op::Run => engine.run(),
        Op::Pause => engine.pause(),
        Op::Release => engine.release_hardware(),
    }
}

fn expected_transition(from: StreamState, op: Op) -> Option<StreamState> {
    match (from, op) {
        (StreamState::Stop, Op::Prepare) => Some(StreamState::Pause),
        (StreamState::Pause, Op::Run) => Some(StreamState::Run),
        (StreamState::Run, Op::Pause) => Some(StreamState::Pause),
        (StreamState::Pause | StreamState::Run, Op::Release) => Some(StreamState::Stop),
        _ => None,
    }
}

#[test]
fn test_state_machine_accepts_only_legal_transitions() {
    init_logging();
    let clock = Arc::new(ManualClock::new(10_000_000));
    let (engine, _sink) = render_engine(clock);
    let ops = [Op::Prepare, Op::Run, Op::Pause, Op::Release];

    // Every sequence of three operations from each reachable state.
    for a in ops {
        for b in ops {
            for c in ops {
                if engine.state() != StreamState::Stop {
                    engine.release_hardware().unwrap();
                }
                for op in [a, b, c] {
                    let before = engine.state();
                    if engine.packet_count() == 0 {
                        engine.allocate_rt_packets(2, PACKET_10S).unwrap();
                    }
                    let result = apply(engine.as_ref(), op);
                    match expected_transition(before, op) {
                        Some(after) => {
                            assert!(result.is_ok(), "{:?} from {} failed: {:?}", op, before, result);
                            assert_eq!(engine.state(), after);
                        }
                        None => {
                            assert!(
                                matches!(result, Err(DspError::InvalidStateTransition { .. })),
                                "{:?} from {} should be rejected",
                                op,
                                before
                            );
                            assert_eq!(engine.state(), before);
                        }
                    }
                }
            }
        }
    }
}

#[test]
fn test_pause_preserves_presentation_position() {
    init_logging();
    let clock = Arc::new(ManualClock::new(10_000_000));
    let (engine, _sink) = render_engine(clock.clone());
    engine.allocate_rt_packets(2, PACKET_10S).unwrap();
    engine.prepare_hardware().unwrap();

    let mut last = engine.presentation_position().frames;
    for cycle in 0..3 {
        engine.run().unwrap();
        for _ in 0..4 {
            clock.advance_ms(125);
            let frames = engine.presentation_position().frames;
            assert!(frames >= last, "cycle {}: {} < {}", cycle, frames, last);
            last = frames;
        }

        engine.pause().unwrap();
        let at_pause = engine.presentation_position().frames;
        clock.advance_ms(3_000);
        assert_eq!(engine.presentation_position().frames, at_pause);

        engine.run().unwrap();
        assert_eq!(engine.presentation_position().frames, at_pause);
        engine.pause().unwrap();
        last = at_pause;
    }
    // Three cycles of 500ms at 16 kHz.
    assert_eq!(last, 24_000);
    engine.release_hardware().unwrap();
}

#[test]
fn test_packet_buffers_end_on_page_boundaries() {
    for count in 1..=2 {
        for size in [1, 160, 320, 4096, 5000, 9000] {
            let packets = RtPackets::allocate(count, size).unwrap();
            let base = packets.base_ptr() as usize;
            let offset = packets.first_packet_offset();
            assert_eq!((base + offset + size) % PAGE_SIZE, 0, "count {} size {}", count, size);
            if count == 2 {
                let second = packets.packet(1).unwrap().as_ptr() as usize;
                assert_eq!(second % PAGE_SIZE, 0, "size {}", size);
            }
        }
    }
    assert!(RtPackets::allocate(3, 320).is_err());
}

#[test]
fn test_render_delivers_contiguous_packets_in_real_time() {
    init_logging();
    let (tx, rx) = crossbeam::channel::unbounded();
    let sink = MemorySink::new();
    let engine = RenderStreamEngine::new(
        StreamFormat::default(),
        Arc::new(SystemClock::new()),
        Arc::new(ChannelNotifier::new(tx)),
        Box::new(sink.clone()),
    )
    .unwrap();
    engine.allocate_rt_packets(2, PACKET_10MS).unwrap();
    engine.prepare_hardware().unwrap();

    engine.run().unwrap();
    std::thread::sleep(Duration::from_millis(150));
    engine.pause().unwrap();

    let numbers = completed(&rx);
    assert!(numbers.len() >= 5, "only {} packets completed", numbers.len());
    assert_eq!(numbers, (0..numbers.len() as u64).collect::<Vec<_>>());
    assert_eq!(engine.current_packet(), numbers.len() as u64);
    assert_eq!(sink.len(), numbers.len() * PACKET_10MS);

    // Paused: nothing further completes.
    std::thread::sleep(Duration::from_millis(50));
    assert!(completed(&rx).is_empty());

    engine.release_hardware().unwrap();
    assert_eq!(engine.current_packet(), 0);
}

#[test]
fn test_capture_tone_fills_packets() {
    init_logging();
    let format = StreamFormat::default();
    let (tx, rx) = crossbeam::channel::unbounded();
    let engine = CaptureStreamEngine::new(
        format,
        Arc::new(SystemClock::new()),
        Arc::new(ChannelNotifier::new(tx)),
        Box::new(ToneGenerator::new(440.0, format).unwrap()),
    )
    .unwrap();
    engine.allocate_rt_packets(2, PACKET_10MS).unwrap();
    engine.prepare_hardware().unwrap();
    engine.run().unwrap();

    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(first, NotifierEvent::PacketCompleted(n) if n.packet_number == 0));
    engine.pause().unwrap();

    let packet = engine.read_packet(0).unwrap();
    assert!(packet.iter().any(|&b| b != 0));
    engine.release_hardware().unwrap();
}

#[test]
fn test_offload_period_timer_counts_reads() {
    init_logging();
    let engine = OffloadStreamEngine::new(
        StreamFormat::default(),
        Arc::new(SystemClock::new()),
        Arc::new(NullNotifier),
        Box::new(MemorySink::new()),
    )
    .unwrap();
    engine.allocate_rt_packets(2, PACKET_10MS).unwrap();
    engine.prepare_hardware().unwrap();

    engine.set_current_write_position(PACKET_10MS).unwrap();
    engine.run().unwrap();
    std::thread::sleep(Duration::from_millis(80));
    engine.pause().unwrap();

    let stats = engine.offload_stats();
    assert!(stats.packets_read >= 3, "read {}", stats.packets_read);
    assert_eq!(engine.current_packet(), stats.packets_read);
    // Only one packet was ever written.
    assert_eq!(stats.starvation_events, stats.packets_read - 1);
    engine.release_hardware().unwrap();
    assert_eq!(engine.offload_stats(), Default::default());
}
