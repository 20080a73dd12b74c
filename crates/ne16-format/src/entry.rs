//! Bundle-encoded entry tables
//!
//! An entry table is a sequence of bundles. Each bundle starts with a count
//! byte and a kind byte; a zero count ends the table. The kind selects the
//! record shape:
//!
//! | kind        | record                                         |
//! |-------------|------------------------------------------------|
//! | `0x00`      | none; the ordinals in range are unassigned      |
//! | `0xFF`      | 6 bytes: flags, `INT 3Fh`, segment, offset      |
//! | `0x01-0xFE` | 3 bytes: flags, offset; the kind is the segment |
//!
//! Ordinals are numbered from 1 and accumulate across bundles.

use serde::Serialize;

use crate::encoder::{ImageReader, ImageWriter};
use crate::{FormatError, FormatResult};

/// Segment index that denotes an absolute (constant) value
pub const CONSTANT_SEGMENT: u8 = 0xFE;

/// Kind byte of a moveable bundle
pub const MOVEABLE_KIND: u8 = 0xFF;

/// Kind byte of an unused bundle
pub const UNUSED_KIND: u8 = 0x00;

/// The `INT 3Fh` opcode stored in every moveable record
pub const INT3F: u16 = 0x3FCD;

/// Entry flag: the entry is exported
pub const ENTRY_EXPORTED: u8 = 0x01;

/// Record shape of a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "segment", rename_all = "snake_case")]
pub enum BundleKind {
    /// Placeholder ordinals with no records
    Unused,
    /// 6-byte records naming their own segment
    Moveable,
    /// 3-byte records in the given 1-based segment
    Fixed(u8),
}

impl BundleKind {
    /// Decode a kind byte
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            UNUSED_KIND => BundleKind::Unused,
            MOVEABLE_KIND => BundleKind::Moveable,
            segment => BundleKind::Fixed(segment),
        }
    }

    /// Encode as a kind byte
    pub fn to_byte(self) -> u8 {
        match self {
            BundleKind::Unused => UNUSED_KIND,
            BundleKind::Moveable => MOVEABLE_KIND,
            BundleKind::Fixed(segment) => segment,
        }
    }

    /// Size of one record of this kind
    pub fn record_size(self) -> usize {
        match self {
            BundleKind::Unused => 0,
            BundleKind::Moveable => 6,
            BundleKind::Fixed(_) => 3,
        }
    }
}

/// One decoded bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Bundle {
    /// Ordinal of the first record
    pub first_ordinal: u16,
    /// Number of ordinals covered
    pub count: u8,
    /// Record shape
    pub kind: BundleKind,
    /// Offset of the first record within the table
    pub data_offset: usize,
}

impl Bundle {
    /// Last ordinal covered by this bundle
    pub fn last_ordinal(&self) -> u16 {
        self.first_ordinal + self.count as u16 - 1
    }

    /// Whether `ordinal` falls within this bundle
    pub fn contains(&self, ordinal: u16) -> bool {
        ordinal >= self.first_ordinal && ordinal <= self.last_ordinal()
    }

    /// Offset within the table of the record for `ordinal`
    fn record_offset(&self, ordinal: u16) -> usize {
        self.data_offset + (ordinal - self.first_ordinal) as usize * self.kind.record_size()
    }
}

/// A resolved entry-table record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntryPoint {
    /// Ordinal number
    pub ordinal: u16,
    /// Entry flags
    pub flags: u8,
    /// 1-based segment index, or [`CONSTANT_SEGMENT`]
    pub segment: u8,
    /// Offset within the segment (or the absolute value)
    pub offset: u16,
    /// Whether the record came from a moveable bundle
    pub moveable: bool,
}

/// Iterator over the bundles of a raw entry table
pub struct Bundles<'a> {
    table: &'a [u8],
    position: usize,
    next_ordinal: u16,
    done: bool,
}

impl<'a> Bundles<'a> {
    /// Iterate the bundles of `table`
    pub fn new(table: &'a [u8]) -> Self {
        Self {
            table,
            position: 0,
            next_ordinal: 1,
            done: false,
        }
    }

    fn next_bundle(&mut self) -> FormatResult<Option<Bundle>> {
        // A table may end without a terminator when its declared length is exact
        if self.position >= self.table.len() {
            return Ok(None);
        }
        let mut reader = ImageReader::new(self.table);
        reader.seek(self.position);
        let count = reader.read_u8()?;
        if count == 0 {
            return Ok(None);
        }
        let kind = BundleKind::from_byte(reader.read_u8()?);
        let data_offset = reader.position();
        reader.skip(count as usize * kind.record_size())?;

        let first_ordinal = self.next_ordinal;
        self.next_ordinal = first_ordinal
            .checked_add(count as u16)
            .ok_or(FormatError::InvalidLayout("entry table ordinal overflow"))?;
        self.position = reader.position();
        Ok(Some(Bundle {
            first_ordinal,
            count,
            kind,
            data_offset,
        }))
    }
}

impl<'a> Iterator for Bundles<'a> {
    type Item = FormatResult<Bundle>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_bundle() {
            Ok(Some(bundle)) => Some(Ok(bundle)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Decode the record of `bundle` for `ordinal`
fn decode_record(table: &[u8], bundle: &Bundle, ordinal: u16) -> FormatResult<Option<EntryPoint>> {
    let mut reader = ImageReader::new(table);
    reader.seek(bundle.record_offset(ordinal));
    let entry = match bundle.kind {
        BundleKind::Unused => return Ok(None),
        BundleKind::Moveable => {
            let flags = reader.read_u8()?;
            let _int3f = reader.read_u16()?;
            let segment = reader.read_u8()?;
            let offset = reader.read_u16()?;
            EntryPoint {
                ordinal,
                flags,
                segment,
                offset,
                moveable: true,
            }
        }
        BundleKind::Fixed(segment) => {
            let flags = reader.read_u8()?;
            let offset = reader.read_u16()?;
            EntryPoint {
                ordinal,
                flags,
                segment,
                offset,
                moveable: false,
            }
        }
    };
    Ok(Some(entry))
}

/// Look up `ordinal` in a raw entry table
///
/// Returns `Ok(None)` when the ordinal is zero, lies past the last bundle or
/// falls in an unused bundle.
pub fn find_entry(table: &[u8], ordinal: u16) -> FormatResult<Option<EntryPoint>> {
    if ordinal == 0 {
        return Ok(None);
    }
    for bundle in Bundles::new(table) {
        let bundle = bundle?;
        if bundle.contains(ordinal) {
            return decode_record(table, &bundle, ordinal);
        }
        if bundle.first_ordinal > ordinal {
            break;
        }
    }
    Ok(None)
}

/// Decode every assigned entry in a raw entry table
pub fn entries(table: &[u8]) -> FormatResult<Vec<EntryPoint>> {
    let mut out = Vec::new();
    for bundle in Bundles::new(table) {
        let bundle = bundle?;
        for ordinal in bundle.first_ordinal..=bundle.last_ordinal() {
            if let Some(entry) = decode_record(table, &bundle, ordinal)? {
                out.push(entry);
            }
        }
    }
    Ok(out)
}

/// Overwrite the offset of an existing entry
///
/// Only the offset field changes. Returns `false` when no record exists for
/// the ordinal; no entry is ever created.
pub fn patch_entry(table: &mut [u8], ordinal: u16, offset: u16) -> bool {
    if ordinal == 0 {
        return false;
    }
    let mut found = None;
    for bundle in Bundles::new(table) {
        match bundle {
            Ok(bundle) if bundle.contains(ordinal) => {
                found = Some(bundle);
                break;
            }
            Ok(_) => {}
            Err(_) => return false,
        }
    }
    let Some(bundle) = found else {
        return false;
    };
    let field = match bundle.kind {
        BundleKind::Unused => return false,
        BundleKind::Moveable => bundle.record_offset(ordinal) + 4,
        BundleKind::Fixed(_) => bundle.record_offset(ordinal) + 1,
    };
    table[field..field + 2].copy_from_slice(&offset.to_le_bytes());
    true
}

/// Encode one bundle of records
///
/// For [`BundleKind::Unused`] only `count` matters and `records` is ignored.
pub fn encode_bundle(writer: &mut ImageWriter, kind: BundleKind, count: u8, records: &[EntryPoint]) {
    writer.emit_u8(count);
    writer.emit_u8(kind.to_byte());
    match kind {
        BundleKind::Unused => {}
        BundleKind::Moveable => {
            for record in records {
                writer.emit_u8(record.flags);
                writer.emit_u16(INT3F);
                writer.emit_u8(record.segment);
                writer.emit_u16(record.offset);
            }
        }
        BundleKind::Fixed(_) => {
            for record in records {
                writer.emit_u8(record.flags);
                writer.emit_u16(record.offset);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(segment: u8, offset: u16) -> EntryPoint {
        EntryPoint {
            ordinal: 0,
            flags: ENTRY_EXPORTED,
            segment,
            offset,
            moveable: false,
        }
    }

    /// ordinals 1-2 fixed in segment 1, 3-4 unused, 5 moveable in segment 2
    fn sample_table() -> Vec<u8> {
        let mut w = ImageWriter::new();
        encode_bundle(&mut w, BundleKind::Fixed(1), 2, &[ep(1, 0x10), ep(1, 0x30)]);
        encode_bundle(&mut w, BundleKind::Unused, 2, &[]);
        encode_bundle(&mut w, BundleKind::Moveable, 1, &[ep(2, 0x44)]);
        w.emit_u8(0);
        w.into_bytes()
    }

    #[test]
    fn test_bundle_walk() {
        let table = sample_table();
        let bundles: Vec<_> = Bundles::new(&table).map(|b| b.unwrap()).collect();
        assert_eq!(bundles.len(), 3);
        assert_eq!(bundles[1].first_ordinal, 3);
        assert_eq!(bundles[2].first_ordinal, 5);
        assert_eq!(bundles[2].kind, BundleKind::Moveable);
    }

    #[test]
    fn test_find_entry() {
        let table = sample_table();
        let e = find_entry(&table, 2).unwrap().unwrap();
        assert_eq!((e.segment, e.offset, e.moveable), (1, 0x30, false));

        let e = find_entry(&table, 5).unwrap().unwrap();
        assert_eq!((e.segment, e.offset, e.moveable), (2, 0x44, true));

        assert_eq!(find_entry(&table, 0).unwrap(), None);
        assert_eq!(find_entry(&table, 3).unwrap(), None);
        assert_eq!(find_entry(&table, 6).unwrap(), None);
        assert_eq!(entries(&table).unwrap().len(), 3);
    }

    #[test]
    fn test_patch_entry() {
        let mut table = sample_table();
        assert!(patch_entry(&mut table, 5, 0x1234));
        assert!(patch_entry(&mut table, 1, 0x0002));
        assert!(!patch_entry(&mut table, 4, 0x1));
        assert!(!patch_entry(&mut table, 9, 0x1));

        assert_eq!(find_entry(&table, 5).unwrap().unwrap().offset, 0x1234);
        assert_eq!(find_entry(&table, 5).unwrap().unwrap().segment, 2);
        assert_eq!(find_entry(&table, 1).unwrap().unwrap().offset, 0x0002);
        assert_eq!(find_entry(&table, 2).unwrap().unwrap().offset, 0x30);
    }

    #[test]
    fn test_truncated_bundle() {
        let table = [2u8, 1, 0, 0x10];
        assert!(matches!(
            find_entry(&table, 1),
            Err(FormatError::Truncated { .. })
        ));
    }
}
