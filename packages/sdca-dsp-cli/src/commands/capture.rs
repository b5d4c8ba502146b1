use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError};
use sdca_dsp::source::ToneGenerator;
use sdca_dsp::{
    CaptureStreamEngine, ChannelNotifier, DspError, NotifierEvent, StreamEngine, SystemClock,
};

use super::{SequenceTracker, StreamReport};
use crate::cli::CaptureArgs;
use crate::output;

pub fn execute(args: CaptureArgs) -> i32 {
    match capture(&args) {
        Ok(report) => output::emit(&report, args.stream.compact, args.stream.output.as_deref()),
        Err(e) => super::fail("capture failed", e),
    }
}

fn capture(args: &CaptureArgs) -> Result<StreamReport, DspError> {
    let stream = &args.stream;
    let (format, packet_size) = super::stream_format(stream)?;
    let source = ToneGenerator::new(stream.tone_hz, format)?;
    let mut sink = super::open_sink(stream.audio.as_deref())?;

    let (tx, rx) = channel::unbounded();
    let engine = CaptureStreamEngine::new(
        format,
        Arc::new(SystemClock::new()),
        Arc::new(ChannelNotifier::new(tx)),
        Box::new(source),
    )?;
    engine.allocate_rt_packets(stream.packets, packet_size)?;
    engine.prepare_hardware()?;
    engine.run()?;
    log::info!(
        "Capturing {} ms in {} byte packets ({} Hz, {} ch, {} bit)",
        stream.duration_ms,
        packet_size,
        format.samples_per_sec,
        format.channels,
        format.bits_per_sample
    );

    let mut tracker = SequenceTracker::default();
    let deadline = Instant::now() + Duration::from_millis(stream.duration_ms);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(NotifierEvent::PacketCompleted(notification)) => {
                tracker.observe(notification.packet_number);
                let index = (notification.packet_number % stream.packets as u64) as usize;
                sink.write(&engine.read_packet(index)?)?;
            }
            Ok(NotifierEvent::LastBufferRendered { .. }) => {}
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let (linear_position, presentation_position) = super::finish_stream(&*engine)?;
    sink.flush()?;

    Ok(StreamReport {
        mode: "capture",
        format,
        packet_size,
        packet_count: stream.packets,
        packets_completed: tracker.seen,
        packet_gaps: tracker.gaps,
        linear_position,
        presentation_position,
        audio_path: stream.audio.clone(),
    })
}
