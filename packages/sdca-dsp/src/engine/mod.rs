// Real-time stream engines
//
// One engine owns one stream's lifecycle (Stop -> Pause -> Run) and paces
// packet completion off a `PerformanceClock` and a `NotificationTimer`.
//
// Variants:
// - `render`:   persists each completed packet to an `AudioSink`
// - `offload`:  period-timer pacing with ping-pong write tracking and EOS timer
// - `capture`:  fills each completed packet from a `CaptureSource`
// - `buffered`: defers packet production to the `KeywordDetector` FIFO

pub(crate) mod base;
pub mod buffered;
pub mod capture;
pub mod offload;
pub mod render;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use crate::format::StreamFormat;

pub use buffered::BufferedCaptureStreamEngine;
pub use capture::CaptureStreamEngine;
pub use offload::{OffloadStats, OffloadStreamEngine, PRESENTATION_LAG_HNS};
pub use render::RenderStreamEngine;

/// Synchronous catch-up passes allowed per scheduling call before the rest
/// of the backlog is handed back to the timer thread.
pub const MAX_CATCH_UP_PASSES: usize = 8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum StreamState {
    #[default]
    Stop,
    Pause,
    Run,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Stop => "Stop",
            StreamState::Pause => "Pause",
            StreamState::Run => "Run",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PresentationPosition {
    /// Position in whole frames (blocks).
    pub frames: u64,
    /// Performance counter value the position was sampled at.
    pub qpc: u64,
}

/// Result of a capture packet query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapturePacket {
    pub packet_number: u64,
    pub qpc: u64,
    pub more_data: bool,
}

/// Capability set shared by every stream engine variant.
pub trait StreamEngine: Send + Sync {
    /// Stop -> Pause. Creates the notification timer(s).
    fn prepare_hardware(&self) -> Result<()>;

    /// Pause/Run -> Stop. Tears down timers and resets position state.
    fn release_hardware(&self) -> Result<()>;

    /// Pause -> Run.
    fn run(&self) -> Result<()>;

    /// Run -> Pause. Waits for any in-flight timer callback.
    fn pause(&self) -> Result<()>;

    fn allocate_rt_packets(&self, count: usize, size: usize) -> Result<()>;

    fn free_rt_packets(&self);

    fn state(&self) -> StreamState;

    fn format(&self) -> StreamFormat;

    /// Number of packets completed since the stream was prepared.
    fn current_packet(&self) -> u64;

    /// Bytes transferred since the stream was prepared.
    fn linear_buffer_position(&self) -> u64;

    fn presentation_position(&self) -> PresentationPosition;

    fn packet_count(&self) -> usize;

    fn packet_size(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display_and_default() {
        assert_eq!(StreamState::default(), StreamState::Stop);
        assert_eq!(StreamState::Run.to_string(), "Run");
        let json = serde_json::to_string(&StreamState::Pause).unwrap();
        assert_eq!(json, "\"Pause\"");
    }
}
