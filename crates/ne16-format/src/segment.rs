//! Segment table entries

use serde::{Deserialize, Serialize};

use crate::encoder::{ImageReader, ImageWriter};
use crate::FormatResult;

/// Size of one on-disk segment table entry
pub const SEGMENT_ENTRY_SIZE: usize = 8;

/// Segment flag bits
pub mod flags {
    /// Data segment (clear for code)
    pub const DATA: u16 = 0x0001;
    /// Segment has been allocated a selector
    pub const ALLOCATED: u16 = 0x0002;
    /// Segment data has been loaded
    pub const LOADED: u16 = 0x0004;
    /// Segment may be moved in memory
    pub const MOVEABLE: u16 = 0x0010;
    /// Segment may be shared between instances
    pub const SHAREABLE: u16 = 0x0020;
    /// Segment is loaded on demand
    pub const PRELOAD: u16 = 0x0040;
    /// Segment carries relocation records
    pub const RELOCINFO: u16 = 0x0100;
    /// Segment may be discarded
    pub const DISCARDABLE: u16 = 0x1000;
}

/// One on-disk segment descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SegmentEntry {
    /// File position in alignment units (0 = no file data)
    pub file_pos: u16,
    /// Bytes of data in the file (0 = 64K)
    pub size: u16,
    /// Segment flags
    pub flags: u16,
    /// Minimum allocation in memory (0 = 64K)
    pub min_size: u16,
}

impl SegmentEntry {
    /// Decode one entry
    pub fn decode(reader: &mut ImageReader<'_>) -> FormatResult<Self> {
        Ok(Self {
            file_pos: reader.read_u16()?,
            size: reader.read_u16()?,
            flags: reader.read_u16()?,
            min_size: reader.read_u16()?,
        })
    }

    /// Encode one entry
    pub fn encode(&self, writer: &mut ImageWriter) {
        writer.emit_u16(self.file_pos);
        writer.emit_u16(self.size);
        writer.emit_u16(self.flags);
        writer.emit_u16(self.min_size);
    }

    /// Absolute file offset of the segment data
    pub fn file_offset(&self, align_shift: u16) -> u64 {
        (self.file_pos as u64) << align_shift
    }

    /// Bytes of file data, with 0 meaning 64K when the segment has file data
    pub fn data_len(&self) -> u32 {
        match (self.file_pos, self.size) {
            (0, _) => 0,
            (_, 0) => 0x10000,
            (_, n) => n as u32,
        }
    }

    /// Bytes to allocate in memory, with 0 meaning 64K
    pub fn alloc_len(&self) -> u32 {
        if self.min_size == 0 {
            0x10000
        } else {
            self.min_size as u32
        }
    }

    /// Whether this is a data segment
    pub fn is_data(&self) -> bool {
        self.flags & flags::DATA != 0
    }
}
