use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{DspError, Result};
use crate::format::StreamFormat;

/// Keyword detector configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DetectorConfig {
    pub samples_per_second: u32,
    /// 10ms at the default rate
    pub samples_per_packet: u32,
    pub bytes_per_sample: u16,
    pub channels: u16,
    /// Pre-buffer depth kept in the packet pool
    pub buffer_seconds: u32,
    pub vad_port: u32,
    pub request_timeout_ms: u64,
    /// Fixed keyword window reported by `notify_detection`, in counter ticks.
    pub keyword_start_override: Option<u64>,
    pub keyword_stop_override: Option<u64>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            samples_per_second: 16_000,
            samples_per_packet: 160,
            bytes_per_sample: 2,
            channels: 1,
            buffer_seconds: 1,
            vad_port: 1,
            request_timeout_ms: 5_000,
            keyword_start_override: None,
            keyword_stop_override: None,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.samples_per_second == 0 || self.samples_per_packet == 0 {
            return Err(DspError::InvalidParameter(
                "detector sample rate and packet length must be non-zero".to_string(),
            ));
        }
        if self.samples_per_packet > self.samples_per_second {
            return Err(DspError::InvalidParameter(format!(
                "packet of {} samples is longer than one second at {} Hz",
                self.samples_per_packet, self.samples_per_second
            )));
        }
        if self.buffer_seconds == 0 {
            return Err(DspError::InvalidParameter(
                "detector buffer must hold at least one second".to_string(),
            ));
        }
        if self.bytes_per_sample.checked_mul(8).is_none() {
            return Err(DspError::InvalidParameter(format!(
                "{} bytes per sample is out of range",
                self.bytes_per_sample
            )));
        }
        self.format().validate()
    }

    pub fn format(&self) -> StreamFormat {
        StreamFormat::pcm(
            self.samples_per_second,
            self.channels,
            self.bytes_per_sample.saturating_mul(8),
        )
    }

    /// Packets held by the pool: `buffer_seconds` worth.
    pub fn pool_capacity(&self) -> usize {
        (self.buffer_seconds as u64 * self.samples_per_second as u64
            / self.samples_per_packet as u64) as usize
    }

    pub fn packet_bytes(&self) -> usize {
        self.samples_per_packet as usize * self.bytes_per_sample as usize * self.channels as usize
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Keyword simulation run by the command line front end
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SimulationConfig {
    pub detector: DetectorConfig,
    pub packet_count: usize,
    /// Audio buffered before the stream starts
    pub prebuffer_ms: u64,
    /// Streaming time after `run`
    pub duration_ms: u64,
    pub suspend_cycles: u32,
    pub device_latency_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            packet_count: 2,
            prebuffer_ms: 500,
            duration_ms: 300,
            suspend_cycles: 1,
            device_latency_ms: 0,
        }
    }
}

impl SimulationConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            DspError::InvalidParameter(format!("invalid config {}: {}", path.display(), e))
        })?;
        config.detector.validate()?;
        Ok(config)
    }
}
