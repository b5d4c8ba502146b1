// Persistence sinks for rendered audio
//
// Render and offload engines hand every completed buffer to an `AudioSink`.
// Sinks store raw PCM; container formats are left to the caller.

use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;

pub trait AudioSink: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Drops all data.
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn write(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Accumulates data in memory; clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
    writes: Arc<Mutex<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    /// Number of `write` calls received.
    pub fn writes(&self) -> usize {
        *self.writes.lock()
    }
}

impl AudioSink for MemorySink {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.data.lock().extend_from_slice(data);
        *self.writes.lock() += 1;
        Ok(())
    }
}

/// Raw PCM file writer.
pub struct FileSink {
    writer: BufWriter<File>,
    bytes_written: u64,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        log::info!("Persisting audio to {}", path.as_ref().display());
        Ok(Self {
            writer: BufWriter::new(file),
            bytes_written: 0,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl AudioSink for FileSink {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            log::warn!("Failed to flush audio sink: {}", e);
        }
    }
}
