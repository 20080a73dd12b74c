//! Synthesizing NE images
//!
//! `ImageBuilder` lays out a complete, valid image from a high-level
//! description. Tables follow the NE header in the conventional order
//! (segment, resource, resident names, module references, imported names,
//! entries), then the non-resident names, then segment data.

use tracing::debug;

use crate::encoder::ImageWriter;
use crate::entry::{encode_bundle, BundleKind, EntryPoint, ENTRY_EXPORTED};
use crate::header::{
    exe_type, flags, other_flags, MzHeader, NeHeader, MZ_HEADER_SIZE, MZ_SIGNATURE,
    NE_HEADER_SIZE, NE_SIGNATURE,
};
use crate::names::{encode_names, NameEntry};
use crate::segment::{SegmentEntry, SEGMENT_ENTRY_SIZE};
use crate::{FormatError, FormatResult};

/// File offset of the NE header in built images
const NE_OFFSET: usize = MZ_HEADER_SIZE;

/// One segment to emit
#[derive(Debug, Clone, Default)]
pub struct SegmentSpec {
    /// Segment flags
    pub flags: u16,
    /// Bytes stored in the file; empty for an uninitialized segment
    pub data: Vec<u8>,
    /// Minimum in-memory size (0 = 64K)
    pub min_size: u16,
}

impl SegmentSpec {
    /// A code segment with the given contents
    pub fn code(data: Vec<u8>) -> Self {
        let min_size = data.len() as u16;
        Self {
            flags: 0,
            data,
            min_size,
        }
    }

    /// A data segment with the given contents
    pub fn data(data: Vec<u8>) -> Self {
        let min_size = data.len() as u16;
        Self {
            flags: crate::segment::flags::DATA,
            data,
            min_size,
        }
    }
}

/// One ordinal in the entry table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySpec {
    /// Unassigned ordinal
    Unused,
    /// Entry in a fixed segment
    Fixed {
        /// 1-based segment index
        segment: u8,
        /// Offset within the segment
        offset: u16,
    },
    /// Entry in a moveable segment
    Moveable {
        /// 1-based segment index
        segment: u8,
        /// Offset within the segment
        offset: u16,
    },
}

impl EntrySpec {
    fn kind(&self) -> BundleKind {
        match *self {
            EntrySpec::Unused => BundleKind::Unused,
            EntrySpec::Fixed { segment, .. } => BundleKind::Fixed(segment),
            EntrySpec::Moveable { .. } => BundleKind::Moveable,
        }
    }

    fn record(&self) -> EntryPoint {
        let (segment, offset) = match *self {
            EntrySpec::Unused => (0, 0),
            EntrySpec::Fixed { segment, offset } | EntrySpec::Moveable { segment, offset } => {
                (segment, offset)
            }
        };
        EntryPoint {
            ordinal: 0,
            flags: ENTRY_EXPORTED,
            segment,
            offset,
            moveable: matches!(self, EntrySpec::Moveable { .. }),
        }
    }
}

/// Builder for synthetic NE images
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    module_name: String,
    description: String,
    signature: u16,
    flags: u16,
    exe_type: u8,
    expected_version: u16,
    align_shift: u16,
    autodata: u16,
    heap: u16,
    stack: u16,
    cs_ip: u32,
    ss_sp: u32,
    segments: Vec<SegmentSpec>,
    references: Vec<String>,
    entries: Vec<EntrySpec>,
    resident: Vec<NameEntry>,
    nonresident: Vec<NameEntry>,
    resources: Vec<u8>,
    fast_load: bool,
}

impl ImageBuilder {
    /// Start a library image named `module_name`
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            description: String::new(),
            signature: NE_SIGNATURE,
            flags: flags::LIBMODULE | flags::SINGLEDATA,
            exe_type: exe_type::WINDOWS,
            expected_version: 0x030A,
            align_shift: 4,
            autodata: 0,
            heap: 0,
            stack: 0,
            cs_ip: 0,
            ss_sp: 0,
            segments: Vec::new(),
            references: Vec::new(),
            entries: Vec::new(),
            resident: Vec::new(),
            nonresident: Vec::new(),
            resources: Vec::new(),
            fast_load: false,
        }
    }

    /// Make the image a task (program) rather than a library
    pub fn task(mut self) -> Self {
        self.flags &= !flags::LIBMODULE;
        self
    }

    /// Replace the module flags
    pub fn flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    /// Override the NE signature (to synthesize foreign images)
    pub fn signature(mut self, signature: u16) -> Self {
        self.signature = signature;
        self
    }

    /// Set the target OS byte
    pub fn exe_type(mut self, exe_type: u8) -> Self {
        self.exe_type = exe_type;
        self
    }

    /// Set the expected Windows version
    pub fn expected_version(mut self, version: u16) -> Self {
        self.expected_version = version;
        self
    }

    /// Set the alignment shift used for segment data
    pub fn align_shift(mut self, shift: u16) -> Self {
        self.align_shift = shift;
        self
    }

    /// Set the module description (first non-resident name)
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the automatic data segment, heap and stack sizes
    pub fn data_sizes(mut self, autodata: u16, heap: u16, stack: u16) -> Self {
        self.autodata = autodata;
        self.heap = heap;
        self.stack = stack;
        self
    }

    /// Set the initial CS:IP and SS:SP
    pub fn registers(mut self, cs_ip: u32, ss_sp: u32) -> Self {
        self.cs_ip = cs_ip;
        self.ss_sp = ss_sp;
        self
    }

    /// Append a segment
    pub fn segment(mut self, segment: SegmentSpec) -> Self {
        self.segments.push(segment);
        self
    }

    /// Append a module reference
    pub fn reference(mut self, name: impl Into<String>) -> Self {
        self.references.push(name.into());
        self
    }

    /// Append the next ordinal to the entry table
    pub fn entry(mut self, entry: EntrySpec) -> Self {
        self.entries.push(entry);
        self
    }

    /// Export `name` in the resident-name table
    pub fn export(mut self, name: impl Into<String>, ordinal: u16) -> Self {
        self.resident.push(NameEntry {
            name: name.into(),
            ordinal,
        });
        self
    }

    /// Export `name` in the non-resident-name table
    pub fn nonresident_export(mut self, name: impl Into<String>, ordinal: u16) -> Self {
        self.nonresident.push(NameEntry {
            name: name.into(),
            ordinal,
        });
        self
    }

    /// Store a raw resource table
    pub fn resources(mut self, table: Vec<u8>) -> Self {
        self.resources = table;
        self
    }

    /// Emit a fast-load area covering the header tables
    pub fn fast_load(mut self, enabled: bool) -> Self {
        self.fast_load = enabled;
        self
    }

    fn encode_entries(&self, w: &mut ImageWriter) {
        let mut i = 0;
        while i < self.entries.len() {
            let kind = self.entries[i].kind();
            let mut j = i;
            while j < self.entries.len() && self.entries[j].kind() == kind && j - i < 255 {
                j += 1;
            }
            let records: Vec<EntryPoint> = self.entries[i..j].iter().map(|e| e.record()).collect();
            encode_bundle(w, kind, (j - i) as u8, &records);
            i = j;
        }
        w.emit_u8(0);
    }

    /// Table offset relative to the NE header
    fn rel(w: &ImageWriter) -> FormatResult<u16> {
        u16::try_from(w.offset() - NE_OFFSET)
            .map_err(|_| FormatError::InvalidLayout("tables exceed 64K"))
    }

    /// Lay out and encode the image
    pub fn build(&self) -> FormatResult<Vec<u8>> {
        if self.segments.len() > u16::MAX as usize || self.references.len() > u16::MAX as usize {
            return Err(FormatError::InvalidLayout("too many segments or references"));
        }
        let align = 1usize << self.align_shift;

        let mut w = ImageWriter::with_capacity(1024);
        MzHeader {
            magic: MZ_SIGNATURE,
            lfanew: NE_OFFSET as u32,
        }
        .encode(&mut w);
        w.pad_to(NE_OFFSET + NE_HEADER_SIZE);

        let mut header = NeHeader {
            magic: self.signature,
            ver: 5,
            rev: 1,
            flags: self.flags & !flags::BUILTIN,
            autodata: self.autodata,
            heap: self.heap,
            stack: self.stack,
            csip: self.cs_ip,
            sssp: self.ss_sp,
            cseg: self.segments.len() as u16,
            cmod: self.references.len() as u16,
            align: self.align_shift,
            exetyp: self.exe_type,
            expver: self.expected_version,
            cmovent: self
                .entries
                .iter()
                .filter(|e| matches!(e, EntrySpec::Moveable { .. }))
                .count() as u16,
            ..Default::default()
        };

        // Segment table, patched once data offsets are known
        header.segtab = Self::rel(&w)?;
        let segtab_at = w.offset();
        w.pad_to(segtab_at + self.segments.len() * SEGMENT_ENTRY_SIZE);

        header.rsrctab = Self::rel(&w)?;
        w.emit_bytes(&self.resources);

        header.restab = Self::rel(&w)?;
        let mut resident = vec![NameEntry {
            name: self.module_name.clone(),
            ordinal: 0,
        }];
        resident.extend(self.resident.iter().cloned());
        encode_names(&mut w, &resident);

        // Module reference table, then the imported names it points into
        header.modtab = Self::rel(&w)?;
        let modtab_at = w.offset();
        w.pad_to(modtab_at + self.references.len() * 2);

        header.imptab = Self::rel(&w)?;
        let imptab_at = w.offset();
        w.emit_u8(0);
        for (i, name) in self.references.iter().enumerate() {
            let name_offset = u16::try_from(w.offset() - imptab_at)
                .map_err(|_| FormatError::InvalidLayout("imported names exceed 64K"))?;
            w.patch_u16(modtab_at + i * 2, name_offset);
            w.emit_pascal(name);
        }

        header.enttab = Self::rel(&w)?;
        let enttab_at = w.offset();
        self.encode_entries(&mut w);
        header.cbenttab = (w.offset() - enttab_at) as u16;

        let tables_end = w.offset();

        if !self.description.is_empty() || !self.nonresident.is_empty() {
            header.nrestab = w.offset() as u32;
            let nrestab_at = w.offset();
            // An empty first name would read as the terminator
            let description = if self.description.is_empty() {
                &self.module_name
            } else {
                &self.description
            };
            let mut names = vec![NameEntry {
                name: description.clone(),
                ordinal: 0,
            }];
            names.extend(self.nonresident.iter().cloned());
            encode_names(&mut w, &names);
            header.cbnrestab = (w.offset() - nrestab_at) as u16;
        }

        if self.fast_load {
            let start = NE_OFFSET / align * align;
            let len = (tables_end - start).div_ceil(align);
            header.flagsothers |= other_flags::FASTLOAD;
            header.pretthunks = (start / align) as u16;
            header.psegrefbytes = len as u16;
            w.pad_to(start + len * align);
        }

        for (i, segment) in self.segments.iter().enumerate() {
            let mut entry = SegmentEntry {
                file_pos: 0,
                size: segment.data.len() as u16,
                flags: segment.flags,
                min_size: segment.min_size,
            };
            if !segment.data.is_empty() {
                w.pad_to_alignment(align);
                entry.file_pos = u16::try_from(w.offset() >> self.align_shift)
                    .map_err(|_| FormatError::InvalidLayout("segment data past alignment range"))?;
                w.emit_bytes(&segment.data);
            }
            let mut seg_bytes = ImageWriter::new();
            entry.encode(&mut seg_bytes);
            let at = segtab_at + i * SEGMENT_ENTRY_SIZE;
            w.buffer[at..at + SEGMENT_ENTRY_SIZE].copy_from_slice(seg_bytes.buffer());
        }

        let mut header_bytes = ImageWriter::with_capacity(NE_HEADER_SIZE);
        header.encode(&mut header_bytes);
        w.buffer[NE_OFFSET..NE_OFFSET + NE_HEADER_SIZE].copy_from_slice(header_bytes.buffer());

        debug!(
            module = %self.module_name,
            segments = self.segments.len(),
            references = self.references.len(),
            size = w.offset(),
            "built image"
        );
        Ok(w.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::find_entry;
    use crate::names::{imported_name, NameTable};
    use crate::ImageReader;

    fn decode(bytes: &[u8]) -> NeHeader {
        let mz = MzHeader::decode(bytes).unwrap();
        let at = mz.lfanew as usize;
        NeHeader::decode(&bytes[at..at + NE_HEADER_SIZE], at as u64).unwrap()
    }

    #[test]
    fn test_build_minimal_library() {
        let image = ImageBuilder::new("A")
            .segment(SegmentSpec::code(vec![0xC3; 16]))
            .segment(SegmentSpec::data(vec![]))
            .reference("B")
            .entry(EntrySpec::Moveable {
                segment: 1,
                offset: 0x20,
            })
            .export("FOO", 1)
            .build()
            .unwrap();

        let header = decode(&image);
        assert_eq!(header.cseg, 2);
        assert_eq!(header.cmod, 1);
        assert_eq!(header.cmovent, 1);
        assert!(header.is_library());
        assert!(!header.has_resources());

        let base = NE_OFFSET;
        let seg_at = base + header.segtab as usize;
        let mut r = ImageReader::new(&image[seg_at..]);
        let code = SegmentEntry::decode(&mut r).unwrap();
        let data = SegmentEntry::decode(&mut r).unwrap();
        let code_at = code.file_offset(header.align) as usize;
        assert_eq!(&image[code_at..code_at + 16], &[0xC3; 16]);
        assert_eq!(data.file_pos, 0);

        let modtab = base + header.modtab as usize;
        let name_offset = u16::from_le_bytes([image[modtab], image[modtab + 1]]);
        let imptab = &image[base + header.imptab as usize..base + header.enttab as usize];
        assert_eq!(imported_name(imptab, name_offset).unwrap(), "B");

        let enttab = base + header.enttab as usize;
        let entries = &image[enttab..enttab + header.cbenttab as usize];
        let e = find_entry(entries, 1).unwrap().unwrap();
        assert_eq!((e.segment, e.offset), (1, 0x20));

        let restab = &image[base + header.restab as usize..base + header.modtab as usize];
        assert_eq!(NameTable::new(restab).find_ordinal("FOO").unwrap(), Some(1));
    }

    #[test]
    fn test_fast_load_area_covers_tables() {
        let image = ImageBuilder::new("FAST")
            .reference("KERNEL")
            .fast_load(true)
            .build()
            .unwrap();
        let header = decode(&image);
        let (offset, len) = header.fast_load_area().unwrap();
        assert_eq!(offset, NE_OFFSET as u64);
        assert!(offset as usize + len <= image.len());
        assert!(offset as usize + len >= NE_OFFSET + header.enttab as usize);
    }

    #[test]
    fn test_entry_bundling() {
        let image = ImageBuilder::new("E")
            .entry(EntrySpec::Fixed {
                segment: 1,
                offset: 1,
            })
            .entry(EntrySpec::Fixed {
                segment: 1,
                offset: 2,
            })
            .entry(EntrySpec::Unused)
            .entry(EntrySpec::Fixed {
                segment: 2,
                offset: 3,
            })
            .build()
            .unwrap();
        let header = decode(&image);
        // 3 bundles: 2 + 2*3, 2, 2 + 3, plus the terminator
        assert_eq!(header.cbenttab, 8 + 2 + 5 + 1);
    }
}
