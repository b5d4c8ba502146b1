use crate::cli::InfoArgs;
use crate::exit_codes;
use crate::output;
use sdca_dsp::engine::{MAX_CATCH_UP_PASSES, PRESENTATION_LAG_HNS};
use sdca_dsp::format::HNS_PER_MS;
use sdca_dsp::keyword::REQUEST_TIMEOUT;
use sdca_dsp::{DetectorConfig, StreamFormat, KEYWORD_DETECTOR_1, KEYWORD_DETECTOR_2};
use serde::Serialize;

#[derive(Serialize)]
struct InfoOutput {
    cli_version: String,
    platform: String,
    arch: String,
    default_format: StreamFormat,
    max_catch_up_passes: usize,
    offload_presentation_lag_ms: u64,
    sdca_request_timeout_ms: u128,
    detector: DetectorConfig,
    detector_pool_packets: usize,
    detector_packet_bytes: usize,
    keyword_detectors: Vec<String>,
}

pub fn execute(args: InfoArgs) -> i32 {
    let detector = DetectorConfig::default();
    let info = InfoOutput {
        cli_version: env!("CARGO_PKG_VERSION").to_string(),
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        default_format: StreamFormat::default(),
        max_catch_up_passes: MAX_CATCH_UP_PASSES,
        offload_presentation_lag_ms: PRESENTATION_LAG_HNS / HNS_PER_MS,
        sdca_request_timeout_ms: REQUEST_TIMEOUT.as_millis(),
        detector_pool_packets: detector.pool_capacity(),
        detector_packet_bytes: detector.packet_bytes(),
        detector,
        keyword_detectors: vec![KEYWORD_DETECTOR_1.to_string(), KEYWORD_DETECTOR_2.to_string()],
    };

    if args.json {
        return output::emit(&info, false, None);
    }

    let format = info.default_format;
    println!("sdcadsp v{}", info.cli_version);
    println!("Platform: {} ({})", info.platform, info.arch);
    println!();
    println!(
        "Default stream: {} Hz, {} ch, {} bit",
        format.samples_per_sec, format.channels, format.bits_per_sample
    );
    println!("Catch-up passes per tick: {}", info.max_catch_up_passes);
    println!("Offload presentation lag: {} ms", info.offload_presentation_lag_ms);
    println!("SDCA request timeout: {} ms", info.sdca_request_timeout_ms);
    println!(
        "Keyword pool: {} packets of {} bytes",
        info.detector_pool_packets, info.detector_packet_bytes
    );
    println!("Keyword detectors: {}", info.keyword_detectors.join(", "));

    exit_codes::SUCCESS
}
