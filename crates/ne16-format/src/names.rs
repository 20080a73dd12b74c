//! Resident and non-resident name tables
//!
//! Both tables are lists of `{len: u8, bytes, ordinal: u16}` terminated by a
//! zero length byte. The first entry is the module name (resident table) or
//! the module description (non-resident table) and is not an export.

use serde::{Deserialize, Serialize};

use crate::encoder::{ImageReader, ImageWriter};
use crate::FormatResult;

/// One name table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameEntry {
    /// Exported name as stored (normally uppercase)
    pub name: String,
    /// Ordinal the name refers to
    pub ordinal: u16,
}

/// A borrowed raw name table
#[derive(Debug, Clone, Copy)]
pub struct NameTable<'a> {
    bytes: &'a [u8],
}

impl<'a> NameTable<'a> {
    /// Wrap a raw table
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Decode every entry, including the leading module name
    pub fn entries(&self) -> FormatResult<Vec<NameEntry>> {
        let mut reader = ImageReader::new(self.bytes);
        let mut out = Vec::new();
        while reader.has_more() {
            let name = reader.read_pascal()?;
            if name.is_empty() {
                break;
            }
            let ordinal = reader.read_u16()?;
            out.push(NameEntry { name, ordinal });
        }
        Ok(out)
    }

    /// The first entry's name, if any
    pub fn first_name(&self) -> FormatResult<Option<String>> {
        let mut reader = ImageReader::new(self.bytes);
        if !reader.has_more() {
            return Ok(None);
        }
        let name = reader.read_pascal()?;
        Ok((!name.is_empty()).then_some(name))
    }

    /// Find the ordinal exported under `name`
    ///
    /// The comparison is exact on bytes; callers uppercase first. The first
    /// entry is skipped.
    pub fn find_ordinal(&self, name: &str) -> FormatResult<Option<u16>> {
        let needle = name.as_bytes();
        let mut reader = ImageReader::new(self.bytes);
        let mut first = true;
        while reader.has_more() {
            let len = reader.read_u8()? as usize;
            if len == 0 {
                break;
            }
            let candidate = reader.read_slice(len)?;
            let ordinal = reader.read_u16()?;
            if first {
                first = false;
                continue;
            }
            if candidate == needle {
                return Ok(Some(ordinal));
            }
        }
        Ok(None)
    }
}

/// Encode a name table from its entries, appending the terminator
pub fn encode_names(writer: &mut ImageWriter, entries: &[NameEntry]) {
    for entry in entries {
        writer.emit_pascal(&entry.name);
        writer.emit_u16(entry.ordinal);
    }
    writer.emit_u8(0);
}

/// Read the Pascal string at `offset` within the imported-name table
pub fn imported_name(table: &[u8], offset: u16) -> FormatResult<String> {
    let mut reader = ImageReader::new(table);
    reader.seek(offset as usize);
    reader.read_pascal()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, ordinal: u16) -> NameEntry {
        NameEntry {
            name: name.to_string(),
            ordinal,
        }
    }

    #[test]
    fn test_find_ordinal_skips_module_name() {
        let mut w = ImageWriter::new();
        encode_names(
            &mut w,
            &[entry("USER", 0), entry("MESSAGEBOX", 1), entry("USER", 7)],
        );
        let table = NameTable::new(w.buffer());
        assert_eq!(table.find_ordinal("MESSAGEBOX").unwrap(), Some(1));
        assert_eq!(table.find_ordinal("USER").unwrap(), Some(7));
        assert_eq!(table.find_ordinal("messagebox").unwrap(), None);
        assert_eq!(table.first_name().unwrap().as_deref(), Some("USER"));
        assert_eq!(table.entries().unwrap().len(), 3);
    }

    #[test]
    fn test_empty_table() {
        let table = NameTable::new(&[]);
        assert_eq!(table.first_name().unwrap(), None);
        assert!(table.entries().unwrap().is_empty());
        assert_eq!(table.find_ordinal("X").unwrap(), None);
    }

    #[test]
    fn test_imported_name() {
        let table = [0u8, 3, b'G', b'D', b'I', 4, b'U', b'S', b'E', b'R'];
        assert_eq!(imported_name(&table, 1).unwrap(), "GDI");
        assert_eq!(imported_name(&table, 5).unwrap(), "USER");
        assert!(imported_name(&table, 9).is_err());
    }
}
