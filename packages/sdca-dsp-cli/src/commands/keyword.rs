use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError};
use sdca_dsp::keyword::{FifoStats, SimulatedSdcaDevice};
use sdca_dsp::{
    BufferedCaptureStreamEngine, ChannelNotifier, DspError, KeywordDetector, NotifierEvent,
    SimulationConfig, StreamEngine, SystemClock, VadPortState, KEYWORD_DETECTOR_1,
};

use super::SequenceTracker;
use crate::cli::KeywordArgs;
use crate::output;

const PORT_STATE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Serialize)]
struct KeywordReport {
    config: SimulationConfig,
    suspend_cycles_completed: u32,
    configure_requests: usize,
    cleanup_requests: usize,
    keyword_start: u64,
    keyword_stop: u64,
    packets_read: u64,
    first_packet: Option<u64>,
    last_packet: Option<u64>,
    packet_gaps: u64,
    fifo: FifoStats,
    final_port_state: VadPortState,
}

pub fn execute(args: KeywordArgs) -> i32 {
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => return super::fail("invalid keyword configuration", e),
    };

    match simulate(config) {
        Ok(report) => output::emit(&report, args.compact, args.output.as_deref()),
        Err(e) => super::fail("keyword simulation failed", e),
    }
}

fn load_config(args: &KeywordArgs) -> Result<SimulationConfig, DspError> {
    let mut config = match &args.config {
        Some(path) => SimulationConfig::from_file(path)?,
        None => SimulationConfig::default(),
    };
    if let Some(prebuffer_ms) = args.prebuffer_ms {
        config.prebuffer_ms = prebuffer_ms;
    }
    if let Some(duration_ms) = args.duration_ms {
        config.duration_ms = duration_ms;
    }
    if let Some(cycles) = args.suspend_cycles {
        config.suspend_cycles = cycles;
    }
    if !(1..=2).contains(&config.packet_count) {
        return Err(DspError::InvalidParameter(format!(
            "packet ring must hold 1 or 2 packets, got {}",
            config.packet_count
        )));
    }
    config.detector.validate()?;
    Ok(config)
}

fn expect_port_state(detector: &KeywordDetector, expected: VadPortState) -> Result<(), DspError> {
    if detector.wait_for_port_state(expected, PORT_STATE_TIMEOUT) {
        Ok(())
    } else {
        Err(DspError::Timeout(PORT_STATE_TIMEOUT))
    }
}

fn simulate(config: SimulationConfig) -> Result<KeywordReport, DspError> {
    let device = Arc::new(SimulatedSdcaDevice::new());
    device.set_latency(Duration::from_millis(config.device_latency_ms));
    let clock = Arc::new(SystemClock::new());
    let detector = KeywordDetector::new(device.clone(), clock.clone(), config.detector.clone())?;

    detector.set_armed(&KEYWORD_DETECTOR_1, true)?;
    expect_port_state(&detector, VadPortState::ArmedPrepared)?;
    log::info!("Keyword detector armed");

    let handle = detector.notification_handle();
    for cycle in 0..config.suspend_cycles {
        handle.signal_suspend();
        expect_port_state(&detector, VadPortState::ArmedSuspended)?;
        handle.signal_resume();
        expect_port_state(&detector, VadPortState::ArmedPrepared)?;
        log::debug!("Suspend/resume cycle {} complete", cycle + 1);
    }

    std::thread::sleep(Duration::from_millis(config.prebuffer_ms));
    detector.notify_detection();
    let (keyword_start, keyword_stop) = detector.keyword_timestamps();

    let (tx, rx) = channel::unbounded();
    let engine =
        BufferedCaptureStreamEngine::new(clock, Arc::new(ChannelNotifier::new(tx)), detector.clone())?;
    engine.allocate_rt_packets(config.packet_count, config.detector.packet_bytes())?;
    engine.prepare_hardware()?;
    engine.run()?;

    let mut tracker = SequenceTracker::default();
    let mut first_packet = None;
    let mut last_packet = None;
    let deadline = Instant::now() + Duration::from_millis(config.duration_ms);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(NotifierEvent::PacketCompleted(_)) => match engine.get_capture_packet() {
                Ok(packet) => {
                    tracker.observe(packet.packet_number);
                    first_packet.get_or_insert(packet.packet_number);
                    last_packet = Some(packet.packet_number);
                }
                Err(DspError::NoData) => {}
                Err(e) => return Err(e),
            },
            Ok(NotifierEvent::LastBufferRendered { .. }) => {}
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    engine.pause()?;
    let fifo = detector.fifo_stats();
    engine.release_hardware()?;

    detector.set_armed(&KEYWORD_DETECTOR_1, false)?;
    let final_port_state = detector.vad_port_state();

    Ok(KeywordReport {
        suspend_cycles_completed: config.suspend_cycles,
        configure_requests: device.configure_calls(),
        cleanup_requests: device.cleanup_calls(),
        keyword_start,
        keyword_stop,
        packets_read: tracker.seen,
        first_packet,
        last_packet,
        packet_gaps: tracker.gaps,
        fifo,
        final_port_state,
        config,
    })
}
