use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError};
use sdca_dsp::source::{CaptureSource, ToneGenerator};
use sdca_dsp::{
    ChannelNotifier, DspError, NotifierEvent, RenderStreamEngine, StreamEngine, SystemClock,
};

use super::{SequenceTracker, StreamReport};
use crate::cli::RenderArgs;
use crate::output;

pub fn execute(args: RenderArgs) -> i32 {
    match render(&args) {
        Ok(report) => output::emit(&report, args.stream.compact, args.stream.output.as_deref()),
        Err(e) => super::fail("render failed", e),
    }
}

fn render(args: &RenderArgs) -> Result<StreamReport, DspError> {
    let stream = &args.stream;
    let (format, packet_size) = super::stream_format(stream)?;
    let mut client = ToneGenerator::new(stream.tone_hz, format)?;
    let sink = super::open_sink(stream.audio.as_deref())?;

    let (tx, rx) = channel::unbounded();
    let engine = RenderStreamEngine::new(
        format,
        Arc::new(SystemClock::new()),
        Arc::new(ChannelNotifier::new(tx)),
        sink,
    )?;
    engine.allocate_rt_packets(stream.packets, packet_size)?;

    let mut scratch = vec![0u8; packet_size];
    for index in 0..stream.packets {
        client.fill(&mut scratch);
        engine.write_packet(index, &scratch)?;
    }

    engine.prepare_hardware()?;
    engine.run()?;
    log::info!("Rendering {} ms in {} byte packets", stream.duration_ms, packet_size);

    let mut tracker = SequenceTracker::default();
    let deadline = Instant::now() + Duration::from_millis(stream.duration_ms);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(NotifierEvent::PacketCompleted(notification)) => {
                tracker.observe(notification.packet_number);
                // The slot just played is free for the client again.
                let index = (notification.packet_number % stream.packets as u64) as usize;
                client.fill(&mut scratch);
                engine.write_packet(index, &scratch)?;
            }
            Ok(NotifierEvent::LastBufferRendered { .. }) => {}
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let (linear_position, presentation_position) = super::finish_stream(&*engine)?;

    Ok(StreamReport {
        mode: "render",
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
