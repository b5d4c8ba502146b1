// Capture data sources
//
// Capture engines fill each completed packet from a `CaptureSource`: either a
// synthesized sine tone or a looping PCM image standing in for a wave file.

use std::f64::consts::PI;

use crate::error::{DspError, Result};
use crate::format::StreamFormat;

pub trait CaptureSource: Send {
    /// Fill `buffer` with the next run of interleaved samples.
    fn fill(&mut self, buffer: &mut [u8]);
}

/// Phase-continuous sine generator producing little-endian integer PCM.
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    frequency: f64,
    amplitude: f64,
    format: StreamFormat,
    phase: f64,
}

impl ToneGenerator {
    pub fn new(frequency: f64, format: StreamFormat) -> Result<Self> {
        format.validate()?;
        if !(frequency > 0.0 && frequency < format.samples_per_sec as f64 / 2.0) {
            return Err(DspError::InvalidParameter(format!(
                "tone frequency {} Hz outside (0, {}) Hz",
                frequency,
                format.samples_per_sec / 2
            )));
        }
        if !matches!(format.bits_per_sample, 8 | 16 | 24 | 32) {
            return Err(DspError::InvalidParameter(format!(
                "unsupported tone bit depth {}",
                format.bits_per_sample
            )));
        }
        Ok(Self {
            frequency,
            amplitude: 0.5,
            format,
            phase: 0.0,
        })
    }

    pub fn with_amplitude(mut self, amplitude: f64) -> Self {
        self.amplitude = amplitude.clamp(0.0, 1.0);
        self
    }

    fn write_sample(&self, value: f64, out: &mut [u8]) {
        match self.format.bits_per_sample {
            8 => out[0] = ((value * i8::MAX as f64) as i8 as i16 + 128) as u8,
            16 => out.copy_from_slice(&((value * i16::MAX as f64) as i16).to_le_bytes()),
            24 => {
                let sample = (value * 8_388_607.0) as i32;
                out.copy_from_slice(&sample.to_le_bytes()[..3]);
            }
            _ => out.copy_from_slice(&((value * i32::MAX as f64) as i32).to_le_bytes()),
        }
    }
}

impl CaptureSource for ToneGenerator {
    fn fill(&mut self, buffer: &mut [u8]) {
        let sample_bytes = (self.format.bits_per_sample / 8) as usize;
        let block = self.format.block_align as usize;
        let step = 2.0 * PI * self.frequency / self.format.samples_per_sec as f64;

        for frame in buffer.chunks_exact_mut(block) {
            let value = self.amplitude * self.phase.sin();
            for sample in frame.chunks_exact_mut(sample_bytes) {
                self.write_sample(value, sample);
            }
            self.phase += step;
            if self.phase >= 2.0 * PI {
                self.phase -= 2.0 * PI;
            }
        }
        // Trailing bytes that do not form a whole frame stay silent.
        let tail = buffer.len() - buffer.len() % block;
        buffer[tail..].fill(0);
    }
}

/// Loops over an in-memory PCM image.
#[derive(Debug, Clone)]
pub struct PcmReplay {
    data: Vec<u8>,
    cursor: usize,
}

impl PcmReplay {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(DspError::InvalidParameter(
                "replay data must not be empty".to_string(),
            ));
        }
        Ok(Self { data, cursor: 0 })
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::new(std::fs::read(path)?)
    }
}

impl CaptureSource for PcmReplay {
    fn fill(&mut self, buffer: &mut [u8]) {
        let mut written = 0;
        while written < buffer.len() {
            let available = self.data.len() - self.cursor;
            let take = available.min(buffer.len() - written);
            buffer[written..written + take]
                .copy_from_slice(&self.data[self.cursor..self.cursor + take]);
            written += take;
            self.cursor = (self.cursor + take) % self.data.len();
        }
    }
}

/// Silence.
#[derive(Debug, Default)]
pub struct SilenceSource;

impl CaptureSource for SilenceSource {
    fn fill(&mut self, buffer: &mut [u8]) {
        buffer.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tone_is_phase_continuous() {
        let format = StreamFormat::pcm(16_000, 1, 16);
        let mut tone = ToneGenerator::new(1000.0, format).unwrap();
        let mut a = vec![0u8; 320];
        let mut b = vec![0u8; 320];
        tone.fill(&mut a);
        tone.fill(&mut b);

        // 1 kHz at 16 kHz repeats every 16 samples; 160 samples is 10 periods
        let decode = |bytes: &[u8]| -> Vec<i16> {
            bytes
                .chunks_exact(2)
                .map(|s| i16::from_le_bytes([s[0], s[1]]))
                .collect()
        };
        for (x, y) in decode(&a).iter().zip(decode(&b).iter()) {
            assert!((*x as i32 - *y as i32).abs() <= 1);
        }
        assert!(a.iter().any(|&x| x != 0));
    }

    #[test]
    fn test_tone_rejects_out_of_band_frequency() {
        let format = StreamFormat::pcm(16_000, 1, 16);
        assert!(ToneGenerator::new(9000.0, format).is_err());
        assert!(ToneGenerator::new(0.0, format).is_err());
    }

    #[test]
    fn test_stereo_tone_duplicates_channels() {
        let format = StreamFormat::pcm(48_000, 2, 16);
        let mut tone = ToneGenerator::new(440.0, format).unwrap();
        let mut buffer = vec![0u8; 64];
        tone.fill(&mut buffer);
        for frame in buffer.chunks_exact(4) {
            assert_eq!(frame[0..2], frame[2..4]);
        }
    }

    #[test]
    fn test_replay_wraps_around() {
        let mut replay = PcmReplay::new(vec![1, 2, 3]).unwrap();
        let mut buffer = vec![0u8; 7];
        replay.fill(&mut buffer);
        assert_eq!(buffer, vec![1, 2, 3, 1, 2, 3, 1]);
        replay.fill(&mut buffer[..2]);
        assert_eq!(&buffer[..2], &[2, 3]);
    }
}
