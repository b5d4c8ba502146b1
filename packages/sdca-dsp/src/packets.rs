//! Real-time packet buffers shared with the client.
//!
//! All packets live in one anonymous page-aligned mapping. Packet 0 is pushed
//! to the end of its first page run so every packet ends on a page boundary
//! and the padding in front of it is freshly zeroed memory.

use memmap2::MmapMut;

use crate::error::{DspError, Result};

pub const MAX_PACKET_COUNT: usize = 2;
pub const PAGE_SIZE: usize = 4096;

fn round_to_pages(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

pub struct RtPackets {
    mapping: MmapMut,
    count: usize,
    packet_size: usize,
    first_packet_offset: usize,
}

impl RtPackets {
    pub fn allocate(count: usize, packet_size: usize) -> Result<Self> {
        if count == 0 || count > MAX_PACKET_COUNT {
            return Err(DspError::InvalidParameter(format!(
                "packet count {} outside 1..={}",
                count, MAX_PACKET_COUNT
            )));
        }
        if packet_size == 0 {
            return Err(DspError::InvalidParameter(
                "packet size must be non-zero".to_string(),
            ));
        }

        let alloc_size = round_to_pages(packet_size);
        let first_packet_offset = alloc_size - packet_size;
        let total = alloc_size.checked_mul(count).ok_or_else(|| {
            DspError::InvalidParameter(format!("packet size {} too large", packet_size))
        })?;

        let mapping = MmapMut::map_anon(total).map_err(|e| {
            DspError::InsufficientResources(format!(
                "failed to map {} bytes of packet memory: {}",
                total, e
            ))
        })?;

        log::debug!(
            "Allocated {} RT packets of {} bytes (offset {}, mapping {} bytes)",
            count,
            packet_size,
            first_packet_offset,
            total
        );

        Ok(Self {
            mapping,
            count,
            packet_size,
            first_packet_offset,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn first_packet_offset(&self) -> usize {
        self.first_packet_offset
    }

    pub fn base_ptr(&self) -> *const u8 {
        self.mapping.as_ptr()
    }

    fn range(&self, index: usize) -> Result<std::ops::Range<usize>> {
        if index >= self.count {
            return Err(DspError::InvalidParameter(format!(
                "packet index {} out of range ({} packets)",
                index, self.count
            )));
        }
        let start = self.first_packet_offset + index * self.packet_size;
        Ok(start..start + self.packet_size)
    }

    pub fn packet(&self, index: usize) -> Result<&[u8]> {
        let range = self.range(index)?;
        Ok(&self.mapping[range])
    }

    pub fn packet_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let range = self.range(index)?;
        Ok(&mut self.mapping[range])
    }

    /// All packets as one contiguous cyclic buffer.
    pub fn linear(&self) -> &[u8] {
        let start = self.first_packet_offset;
        &self.mapping[start..start + self.count * self.packet_size]
    }
}

impl std::fmt::Debug for RtPackets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtPackets")
            .field("count", &self.count)
            .field("packet_size", &self.packet_size)
            .field("first_packet_offset", &self.first_packet_offset)
            .finish()
    }
}
