pub mod capture;
pub mod info;
pub mod keyword;
pub mod render;

use serde::Serialize;
use sdca_dsp::sink::{AudioSink, FileSink, NullSink};
use sdca_dsp::{DspError, PresentationPosition, StreamEngine, StreamFormat};

use crate::cli::StreamArgs;
use crate::exit_codes;

/// Report shared by the capture and render commands.
#[derive(Serialize)]
pub struct StreamReport {
    pub mode: &'static str,
    pub format: StreamFormat,
    pub packet_size: usize,
    pub packet_count: usize,
    pub packets_completed: u64,
    pub packet_gaps: u64,
    pub linear_position: u64,
    pub presentation_position: PresentationPosition,
    pub audio_path: Option<String>,
}

/// Print `error` and map it to an exit code.
pub fn fail(context: &str, error: DspError) -> i32 {
    log::error!("{}: {}", context, error);
    eprintln!("Error: {}: {}", context, error);
    exit_codes::for_error(&error)
}

/// Longest packet the stream commands accept.
const MAX_PACKET_MS: u32 = 1_000;

pub fn stream_format(args: &StreamArgs) -> Result<(StreamFormat, usize), DspError> {
    let format = StreamFormat::try_pcm(args.rate, args.channels, args.bits)?;
    if !(1..=MAX_PACKET_MS).contains(&args.packet_ms) {
        return Err(DspError::InvalidParameter(format!(
            "packet length must be 1 to {} ms, got {}",
            MAX_PACKET_MS, args.packet_ms
        )));
    }
    if !(1..=2).contains(&args.packets) {
        return Err(DspError::InvalidParameter(format!(
            "packet ring must hold 1 or 2 packets, got {}",
            args.packets
        )));
    }
    let packet_size = usize::try_from(format.bytes_for_ms(args.packet_ms)).map_err(|_| {
        DspError::InvalidParameter(format!("{} ms packets do not fit in memory", args.packet_ms))
    })?;
    Ok((format, packet_size))
}

pub fn open_sink(path: Option<&str>) -> Result<Box<dyn AudioSink>, DspError> {
    Ok(match path {
        Some(path) => Box::new(FileSink::create(path)?),
        None => Box::new(NullSink),
    })
}

/// Tracks completion notifications and counts skipped packet numbers.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    next: Option<u64>,
    pub seen: u64,
    pub gaps: u64,
}

impl SequenceTracker {
    pub fn observe(&mut self, packet_number: u64) {
        if let Some(expected) = self.next {
            if packet_number != expected {
                log::warn!("Expected packet {}, got {}", expected, packet_number);
                self.gaps += packet_number.saturating_sub(expected).max(1);
            }
        }
        self.next = Some(packet_number + 1);
        self.seen += 1;
    }
}

/// Pause the engine, snapshot its position and release it.
pub fn finish_stream<E: StreamEngine + ?Sized>(
    engine: &E,
) -> Result<(u64, PresentationPosition), DspError> {
    engine.pause()?;
    let snapshot = (engine.linear_buffer_position(), engine.presentation_position());
    engine.release_hardware()?;
    Ok(snapshot)
}
