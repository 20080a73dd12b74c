//! Little-endian encoding and decoding utilities
//!
//! `ImageReader` walks a byte slice and reports short reads as
//! [`FormatError::Truncated`] with the absolute image offset, so callers can
//! decode a table that was read from the middle of a file and still get
//! useful positions in errors.

use crate::FormatError;

/// Writer for building little-endian binary tables
pub struct ImageWriter {
    /// Internal buffer containing the encoded bytes
    pub(crate) buffer: Vec<u8>,
}

impl ImageWriter {
    /// Create a new writer
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Create a new writer with capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Get the current buffer
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the buffer
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get the current offset (length of the buffer)
    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    /// Emit a raw byte
    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Emit a 16-bit unsigned integer (little-endian)
    pub fn emit_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit unsigned integer (little-endian)
    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit raw bytes
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Emit a length-prefixed string (u8 length + bytes)
    ///
    /// Names longer than 255 bytes are cut at 255.
    pub fn emit_pascal(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(u8::MAX as usize);
        self.buffer.push(len as u8);
        self.buffer.extend_from_slice(&bytes[..len]);
    }

    /// Pad with zeros until the offset is a multiple of `align`
    pub fn pad_to_alignment(&mut self, align: usize) {
        if align > 1 {
            let rem = self.buffer.len() % align;
            if rem != 0 {
                self.buffer.resize(self.buffer.len() + align - rem, 0);
            }
        }
    }

    /// Pad with zeros up to an absolute offset
    pub fn pad_to(&mut self, offset: usize) {
        if self.buffer.len() < offset {
            self.buffer.resize(offset, 0);
        }
    }

    /// Patch a previously emitted u16 value at the given offset
    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        self.buffer[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Patch a previously emitted u32 value at the given offset
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Reserve space for a u16 value (returns offset for later patching)
    pub fn reserve_u16(&mut self) -> usize {
        let offset = self.offset();
        self.emit_u16(0);
        offset
    }

    /// Reserve space for a u32 value (returns offset for later patching)
    pub fn reserve_u32(&mut self) -> usize {
        let offset = self.offset();
        self.emit_u32(0);
        offset
    }
}

impl Default for ImageWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader for little-endian binary tables
pub struct ImageReader<'a> {
    buffer: &'a [u8],
    position: usize,
    /// Absolute image offset of `buffer[0]`, used in error reports
    base: u64,
}

impl<'a> ImageReader<'a> {
    /// Create a new reader over a buffer that starts at image offset 0
    pub fn new(buffer: &'a [u8]) -> Self {
        Self::with_base(buffer, 0)
    }

    /// Create a new reader over a buffer that was read from `base`
    pub fn with_base(buffer: &'a [u8], base: u64) -> Self {
        Self {
            buffer,
            position: 0,
            base,
        }
    }

    /// Get the current position in the buffer
    pub fn position(&self) -> usize {
        self.position
    }

    /// Get the remaining bytes in the buffer
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Check if there are more bytes to read
    pub fn has_more(&self) -> bool {
        self.position < self.buffer.len()
    }

    /// Seek to a specific position
    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], FormatError> {
        let end = self
            .position
            .checked_add(count)
            .filter(|&end| end <= self.buffer.len())
            .ok_or(FormatError::Truncated {
                offset: self.base + self.position as u64,
                len: count,
            })?;
        let bytes = &self.buffer[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    /// Read a single byte
    pub fn read_u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.take(1)?[0])
    }

    /// Read a 16-bit unsigned integer (little-endian)
    pub fn read_u16(&mut self) -> Result<u16, FormatError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Read a 32-bit unsigned integer (little-endian)
    pub fn read_u32(&mut self) -> Result<u32, FormatError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Borrow a fixed number of bytes
    pub fn read_slice(&mut self, count: usize) -> Result<&'a [u8], FormatError> {
        self.take(count)
    }

    /// Read a fixed number of bytes
    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, FormatError> {
        Ok(self.take(count)?.to_vec())
    }

    /// Skip `count` bytes
    pub fn skip(&mut self, count: usize) -> Result<(), FormatError> {
        self.take(count).map(|_| ())
    }

    /// Read a length-prefixed string (u8 length + bytes)
    ///
    /// Name tables hold 8-bit OEM text; bytes outside ASCII are decoded lossily.
    pub fn read_pascal(&mut self) -> Result<String, FormatError> {
        let len = self.read_u8()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_emission() {
        let mut writer = ImageWriter::new();
        writer.emit_u8(0x42);
        writer.emit_u16(0x1234);
        writer.emit_u32(0xABCD_EF01);

        let bytes = writer.buffer();
        assert_eq!(bytes[0], 0x42);
        assert_eq!(bytes[1], 0x34); // Little-endian
        assert_eq!(bytes[2], 0x12);
        assert_eq!(bytes[3], 0x01);
        assert_eq!(bytes[6], 0xAB);
    }

    #[test]
    fn test_patch_and_pad() {
        let mut writer = ImageWriter::new();
        let at = writer.reserve_u16();
        writer.emit_u8(1);
        writer.pad_to_alignment(16);
        assert_eq!(writer.offset(), 16);
        writer.patch_u16(at, 0xBEEF);
        assert_eq!(&writer.buffer()[..2], &[0xEF, 0xBE]);

        writer.pad_to(20);
        assert_eq!(writer.offset(), 20);
        writer.pad_to(4);
        assert_eq!(writer.offset(), 20);
    }

    #[test]
    fn test_pascal_strings() {
        let mut writer = ImageWriter::new();
        writer.emit_pascal("KERNEL");
        writer.emit_pascal("");
        let bytes = writer.into_bytes();

        let mut reader = ImageReader::new(&bytes);
        assert_eq!(reader.read_pascal().unwrap(), "KERNEL");
        assert_eq!(reader.read_pascal().unwrap(), "");
        assert!(!reader.has_more());
    }

    #[test]
    fn test_truncated_read_reports_absolute_offset() {
        let bytes = [1u8, 2, 3];
        let mut reader = ImageReader::with_base(&bytes, 0x400);
        reader.read_u16().unwrap();
        let err = reader.read_u16().unwrap_err();
        assert_eq!(
            err,
            FormatError::Truncated {
                offset: 0x402,
                len: 2
            }
        );
        // Failed reads do not advance
        assert_eq!(reader.position(), 2);
        assert_eq!(reader.remaining(), 1);
    }
}
