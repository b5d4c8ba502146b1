use serde::{Deserialize, Serialize};

use crate::error::{DspError, Result};

pub const HNS_PER_SEC: u64 = 10_000_000;
pub const HNS_PER_MS: u64 = 10_000;

/// PCM stream format handed down by the circuit/pin layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamFormat {
    pub samples_per_sec: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub block_align: u16,
    pub avg_bytes_per_sec: u32,
}

impl StreamFormat {
    /// Integer PCM format with derived block alignment and byte rate.
    /// Derived fields saturate; `validate` rejects the result if they did.
    pub fn pcm(samples_per_sec: u32, channels: u16, bits_per_sample: u16) -> Self {
        let block_align = channels.saturating_mul(bits_per_sample / 8);
        Self {
            samples_per_sec,
            channels,
            bits_per_sample,
            block_align,
            avg_bytes_per_sec: samples_per_sec.saturating_mul(block_align as u32),
        }
    }

    /// `pcm` followed by `validate`.
    pub fn try_pcm(samples_per_sec: u32, channels: u16, bits_per_sample: u16) -> Result<Self> {
        let format = Self::pcm(samples_per_sec, channels, bits_per_sample);
        format.validate()?;
        Ok(format)
    }

    pub fn validate(&self) -> Result<()> {
        if self.samples_per_sec == 0 || self.channels == 0 || self.bits_per_sample == 0 {
            return Err(DspError::InvalidParameter(format!(
                "format fields must be non-zero: {:?}",
                self
            )));
        }
        if self.bits_per_sample % 8 != 0 {
            return Err(DspError::InvalidParameter(format!(
                "unsupported bits per sample: {}",
                self.bits_per_sample
            )));
        }
        let expected_align = self
            .channels
            .checked_mul(self.bits_per_sample / 8)
            .ok_or_else(|| {
                DspError::InvalidParameter(format!(
                    "{} channels x {} bits does not fit a frame",
                    self.channels, self.bits_per_sample
                ))
            })?;
        if self.block_align != expected_align {
            return Err(DspError::InvalidParameter(format!(
                "block align {} does not match {} channels x {} bits",
                self.block_align, self.channels, self.bits_per_sample
            )));
        }
        let expected_rate = self
            .samples_per_sec
            .checked_mul(self.block_align as u32)
            .ok_or_else(|| {
                DspError::InvalidParameter(format!(
                    "{} Hz x {} bytes overflows the byte rate",
                    self.samples_per_sec, self.block_align
                ))
            })?;
        if self.avg_bytes_per_sec != expected_rate {
            return Err(DspError::InvalidParameter(format!(
                "average bytes per second {} does not match {} Hz x {} bytes",
                self.avg_bytes_per_sec, self.samples_per_sec, self.block_align
            )));
        }
        Ok(())
    }

    pub fn bytes_to_hns(&self, bytes: u64) -> u64 {
        (bytes as u128 * HNS_PER_SEC as u128 / self.avg_bytes_per_sec.max(1) as u128) as u64
    }

    pub fn hns_to_bytes(&self, hns: u64) -> u64 {
        (hns as u128 * self.avg_bytes_per_sec as u128 / HNS_PER_SEC as u128) as u64
    }

    pub fn bytes_to_frames(&self, bytes: u64) -> u64 {
        bytes / self.block_align.max(1) as u64
    }

    /// Bytes covering `ms` milliseconds, rounded down to whole frames.
    pub fn bytes_for_ms(&self, ms: u32) -> u64 {
        let frames = self.samples_per_sec as u64 * ms as u64 / 1000;
        frames * self.block_align as u64
    }
}

impl Default for StreamFormat {
    /// 16 kHz mono 16-bit, the keyword-spotter format.
    fn default() -> Self {
        Self::pcm(16_000, 1, 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_derivation() {
        let format = StreamFormat::pcm(48_000, 2, 16);
        assert_eq!(format.block_align, 4);
        assert_eq!(format.avg_bytes_per_sec, 192_000);
        assert!(format.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inconsistent_format() {
        let mut format = StreamFormat::pcm(48_000, 2, 16);
        format.block_align = 3;
        assert!(matches!(
            format.validate(),
            Err(DspError::InvalidParameter(_))
        ));

        let zero = StreamFormat::pcm(0, 2, 16);
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_oversized_format_is_rejected_not_wrapped() {
        let wide = StreamFormat::pcm(48_000, 40_000, 16);
        assert_eq!(wide.block_align, u16::MAX);
        assert!(matches!(wide.validate(), Err(DspError::InvalidParameter(_))));
        assert!(StreamFormat::try_pcm(48_000, 40_000, 16).is_err());

        let fast = StreamFormat::pcm(u32::MAX, 2, 16);
        assert!(matches!(fast.validate(), Err(DspError::InvalidParameter(_))));

        assert_eq!(
            StreamFormat::try_pcm(48_000, 2, 16).unwrap(),
            StreamFormat::pcm(48_000, 2, 16)
        );
    }

    #[test]
    fn test_bytes_for_long_durations_do_not_truncate() {
        let format = StreamFormat::pcm(192_000, 8, 32);
        assert_eq!(format.bytes_for_ms(u32::MAX), 192 * 32 * u32::MAX as u64);
    }

    #[test]
    fn test_time_conversions() {
        let format = StreamFormat::default();
        // 10ms at 16 kHz mono 16-bit
        assert_eq!(format.bytes_for_ms(10), 320);
        assert_eq!(format.bytes_to_hns(320), 10 * HNS_PER_MS);
        assert_eq!(format.hns_to_bytes(HNS_PER_SEC), 32_000);
        assert_eq!(format.bytes_to_frames(320), 160);
    }
}
