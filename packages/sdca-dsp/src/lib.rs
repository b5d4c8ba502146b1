pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod keyword;
pub mod notify;
pub mod packets;
pub mod sink;
pub mod source;
pub mod timer;

pub use clock::{ManualClock, PerformanceClock, SystemClock};
pub use config::{DetectorConfig, SimulationConfig};
pub use engine::{
    BufferedCaptureStreamEngine, CapturePacket, CaptureStreamEngine, OffloadStats,
    OffloadStreamEngine, PresentationPosition, RenderStreamEngine, StreamEngine, StreamState,
};
pub use error::{DspError, Result};
pub use format::StreamFormat;
pub use keyword::{
    DetectorCapabilities, DpcOutcome, KeywordDetector, VadNotificationHandle, VadPortState,
    KEYWORD_DETECTOR_1, KEYWORD_DETECTOR_2,
};
pub use notify::{ChannelNotifier, NotifierEvent, NullNotifier, PacketNotification, PacketNotifier};
pub use packets::RtPackets;
