use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "sdcadsp",
    version,
    about = "Virtual SoundWire/SDCA DSP streaming simulator",
    long_about = "Drive the virtual SDCA DSP stream engines and keyword detector on the host clock.\n\
                  Reports are written as JSON; raw PCM can be persisted with --audio."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show packet geometry and keyword detector defaults
    Info(InfoArgs),
    /// Run a capture stream fed by a sine tone
    Capture(CaptureArgs),
    /// Run a render stream fed by a client writing a sine tone
    Render(RenderArgs),
    /// Arm the keyword detector, cycle suspend/resume and stream the pre-buffer
    Keyword(KeywordArgs),
}

#[derive(Args)]
pub struct InfoArgs {
    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Clone)]
pub struct StreamArgs {
    /// Streaming time in milliseconds
    #[arg(long, default_value_t = 200)]
    pub duration_ms: u64,

    /// Packet length in milliseconds (1 to 1000)
    #[arg(long, default_value_t = 10)]
    pub packet_ms: u32,

    /// Sample rate in Hz
    #[arg(long, default_value_t = 16_000)]
    pub rate: u32,

    /// Interleaved channels
    #[arg(long, default_value_t = 1)]
    pub channels: u16,

    /// Bits per sample (8, 16, 24 or 32)
    #[arg(long, default_value_t = 16)]
    pub bits: u16,

    /// Packets in the ring (1 or 2)
    #[arg(long, default_value_t = 2)]
    pub packets: usize,

    /// Tone frequency in Hz
    #[arg(long, default_value_t = 440.0)]
    pub tone_hz: f64,

    /// Raw PCM file receiving the streamed audio
    #[arg(long)]
    pub audio: Option<String>,

    /// Report file (default: stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,
}

#[derive(Args)]
pub struct CaptureArgs {
    #[command(flatten)]
    pub stream: StreamArgs,
}

#[derive(Args)]
pub struct RenderArgs {
    #[command(flatten)]
    pub stream: StreamArgs,
}

#[derive(Args)]
pub struct KeywordArgs {
    /// JSON simulation config
    #[arg(long, env = "SDCA_DSP_CONFIG")]
    pub config: Option<String>,

    /// Audio buffered between arming and the detection
    #[arg(long)]
    pub prebuffer_ms: Option<u64>,

    /// Streaming time after the detection
    #[arg(long)]
    pub duration_ms: Option<u64>,

    /// Suspend/resume cycles sent by the simulated codec
    #[arg(long)]
    pub suspend_cycles: Option<u32>,

    /// Report file (default: stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,
}
