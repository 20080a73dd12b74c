//! In-arena module records
//!
//! A module record is one arena block: a fixed header followed by the
//! copied tables of the image in a fixed order. Every section is located by
//! an offset from the start of the block, so a record can be inspected from
//! nothing but its handle.
//!
//! ```text
//! +----------------------+ 0
//! | RecordHeader         |
//! +----------------------+ RECORD_HEADER_SIZE
//! | file info            |  u16 length + path bytes
//! | segment table        |  10-byte runtime entries
//! | resource table       |  optional, raw
//! | resident names       |  raw
//! | module references    |  10-byte slots
//! | imported names       |  raw
//! | entry table          |  raw bundles
//! +----------------------+
//! ```
//!
//! The non-resident names and the initialize-list are separate blocks
//! referenced from the header.

use std::fmt;
use std::ops::Range;

use ne16_format::header::flags;
use ne16_format::names::imported_name;
use ne16_format::{ImageReader, ImageWriter, NameTable, SegmentEntry};
use serde::Serialize;

use crate::arena::{Arena, ArenaError, ArenaPtr, ArenaResult};

/// Magic stored at the start of every live record
pub const RECORD_MAGIC: u16 = 0x454E;

/// Encoded size of [`RecordHeader`]
pub const RECORD_HEADER_SIZE: usize = 112;

/// Size of one runtime segment entry
pub const RUNTIME_SEGMENT_SIZE: usize = 10;

/// Size of an encoded [`ModuleHandle`]
pub const HANDLE_SLOT_SIZE: usize = 8;

/// Size of one module-reference slot: name offset plus handle
pub const MODREF_SLOT_SIZE: usize = 2 + HANDLE_SLOT_SIZE;

/// Size of one initialize-list slot
pub const INIT_SLOT_SIZE: usize = HANDLE_SLOT_SIZE;

/// Identity of a loaded module
///
/// The arena pointer of its record plus the generation stamped into the
/// record when it was built. Arena blocks are reused after a module is
/// freed; the generation keeps an old handle from naming the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ModuleHandle {
    ptr: ArenaPtr,
    generation: u32,
}

impl ModuleHandle {
    /// Handle for the record at `ptr` built with `generation`
    pub const fn new(ptr: ArenaPtr, generation: u32) -> Self {
        Self { ptr, generation }
    }

    /// The record's arena pointer
    pub const fn ptr(self) -> ArenaPtr {
        self.ptr
    }

    /// Generation of the record
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Encode for a slot; an all-zero slot means "none"
    pub(crate) fn to_slot(self) -> [u8; HANDLE_SLOT_SIZE] {
        let mut slot = [0u8; HANDLE_SLOT_SIZE];
        slot[..4].copy_from_slice(&self.ptr.raw().to_le_bytes());
        slot[4..].copy_from_slice(&self.generation.to_le_bytes());
        slot
    }

    /// Decode a slot
    pub(crate) fn from_slot(slot: &[u8]) -> Option<Self> {
        let ptr = u32::from_le_bytes(slot.get(..4)?.try_into().ok()?);
        let generation = u32::from_le_bytes(slot.get(4..HANDLE_SLOT_SIZE)?.try_into().ok()?);
        (ptr != 0).then(|| Self::new(ArenaPtr::from_raw(ptr), generation))
    }
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ptr, self.generation)
    }
}

/// Location of a section within a record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Section {
    /// Offset from the start of the record
    pub offset: u32,
    /// Length in bytes
    pub len: u32,
}

impl Section {
    fn range(&self) -> Range<usize> {
        self.offset as usize..(self.offset + self.len) as usize
    }

    /// Whether the section holds no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Fixed header at the start of every record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub struct RecordHeader {
    pub magic: u16,
    /// Reference count
    pub usage: u16,
    pub flags: u16,
    pub expected_version: u16,
    pub autodata: u16,
    pub heap: u16,
    pub stack: u16,
    pub segment_count: u16,
    pub modref_count: u16,
    pub moveable_entries: u16,
    pub align_shift: u16,
    pub swap_area: u16,
    pub exe_type: u8,
    pub other_flags: u8,
    pub cs_ip: u32,
    pub ss_sp: u32,
    pub file_info: Section,
    pub segments: Section,
    pub resources: Section,
    pub resident_names: Section,
    pub modrefs: Section,
    pub imported_names: Section,
    pub entries: Section,
    /// Separate block holding the non-resident names
    pub nonresident_names: Option<ArenaPtr>,
    pub nonresident_len: u32,
    /// Separate block holding the initialize-list
    pub init_list: Option<ArenaPtr>,
    /// Generation the record was built with
    pub generation: u32,
}

fn read_section(r: &mut ImageReader<'_>) -> ne16_format::FormatResult<Section> {
    Ok(Section {
        offset: r.read_u32()?,
        len: r.read_u32()?,
    })
}

fn write_section(w: &mut ImageWriter, section: Section) {
    w.emit_u32(section.offset);
    w.emit_u32(section.len);
}

fn ptr_slot(ptr: Option<ArenaPtr>) -> u32 {
    ptr.map_or(0, ArenaPtr::raw)
}

fn slot_ptr(raw: u32) -> Option<ArenaPtr> {
    (raw != 0).then(|| ArenaPtr::from_raw(raw))
}

impl RecordHeader {
    /// Encode into exactly [`RECORD_HEADER_SIZE`] bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ImageWriter::with_capacity(RECORD_HEADER_SIZE);
        for value in [
            self.magic,
            self.usage,
            self.flags,
            self.expected_version,
            self.autodata,
            self.heap,
            self.stack,
            self.segment_count,
            self.modref_count,
            self.moveable_entries,
            self.align_shift,
            self.swap_area,
        ] {
            w.emit_u16(value);
        }
        w.emit_u8(self.exe_type);
        w.emit_u8(self.other_flags);
        w.emit_u32(self.cs_ip);
        w.emit_u32(self.ss_sp);
        for section in [
            self.file_info,
            self.segments,
            self.resources,
            self.resident_names,
            self.modrefs,
            self.imported_names,
            self.entries,
        ] {
            write_section(&mut w, section);
        }
        w.emit_u32(ptr_slot(self.nonresident_names));
        w.emit_u32(self.nonresident_len);
        w.emit_u32(ptr_slot(self.init_list));
        w.emit_u32(self.generation);
        w.pad_to(RECORD_HEADER_SIZE);
        w.into_bytes()
    }

    /// Decode from the start of a record block
    pub fn decode(bytes: &[u8]) -> ne16_format::FormatResult<Self> {
        let mut r = ImageReader::new(bytes);
        Ok(Self {
            magic: r.read_u16()?,
            usage: r.read_u16()?,
            flags: r.read_u16()?,
            expected_version: r.read_u16()?,
            autodata: r.read_u16()?,
            heap: r.read_u16()?,
            stack: r.read_u16()?,
            segment_count: r.read_u16()?,
            modref_count: r.read_u16()?,
            moveable_entries: r.read_u16()?,
            align_shift: r.read_u16()?,
            swap_area: r.read_u16()?,
            exe_type: r.read_u8()?,
            other_flags: r.read_u8()?,
            cs_ip: r.read_u32()?,
            ss_sp: r.read_u32()?,
            file_info: read_section(&mut r)?,
            segments: read_section(&mut r)?,
            resources: read_section(&mut r)?,
            resident_names: read_section(&mut r)?,
            modrefs: read_section(&mut r)?,
            imported_names: read_section(&mut r)?,
            entries: read_section(&mut r)?,
            nonresident_names: slot_ptr(r.read_u32()?),
            nonresident_len: r.read_u32()?,
            init_list: slot_ptr(r.read_u32()?),
            generation: r.read_u32()?,
        })
    }

    /// Whether the module is a library
    pub fn is_library(&self) -> bool {
        self.flags & flags::LIBMODULE != 0
    }

    /// Whether the record came from a builtin provider
    pub fn is_builtin(&self) -> bool {
        self.flags & flags::BUILTIN != 0
    }
}

/// Section sizes of a record about to be built
#[derive(Debug, Clone, Copy, Default)]
#[allow(missing_docs)]
pub struct RecordLayout {
    pub file_info: Section,
    pub segments: Section,
    pub resources: Section,
    pub resident_names: Section,
    pub modrefs: Section,
    pub imported_names: Section,
    pub entries: Section,
    /// Total block size
    pub total: usize,
}

impl RecordLayout {
    /// Place every section back to back after the header
    pub fn new(
        path_len: usize,
        segment_count: usize,
        resources_len: usize,
        resident_len: usize,
        modref_count: usize,
        imported_len: usize,
        entries_len: usize,
    ) -> Self {
        let mut cursor = RECORD_HEADER_SIZE as u32;
        let mut place = |len: usize| {
            let section = Section {
                offset: cursor,
                len: len as u32,
            };
            cursor += len as u32;
            section
        };
        let file_info = place(2 + path_len);
        let segments = place(segment_count * RUNTIME_SEGMENT_SIZE);
        let resources = place(resources_len);
        let resident_names = place(resident_len);
        let modrefs = place(modref_count * MODREF_SLOT_SIZE);
        let imported_names = place(imported_len);
        let entries = place(entries_len);
        Self {
            file_info,
            segments,
            resources,
            resident_names,
            modrefs,
            imported_names,
            entries,
            total: cursor as usize,
        }
    }
}

/// A segment table entry widened with its runtime selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeSegment {
    /// Entry as stored on disk
    pub entry: SegmentEntry,
    /// Selector assigned by the host; 0 until segments are loaded
    pub selector: u16,
}

impl RuntimeSegment {
    pub(crate) fn encode(&self, out: &mut [u8]) {
        let mut w = ImageWriter::with_capacity(RUNTIME_SEGMENT_SIZE);
        self.entry.encode(&mut w);
        w.emit_u16(self.selector);
        out.copy_from_slice(w.buffer());
    }

    pub(crate) fn decode(bytes: &[u8]) -> ne16_format::FormatResult<Self> {
        let mut r = ImageReader::new(bytes);
        let entry = SegmentEntry::decode(&mut r)?;
        let selector = r.read_u16()?;
        Ok(Self { entry, selector })
    }
}

/// A decoded module-reference slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleRef {
    /// Name as stored in the imported-name table
    pub name: String,
    /// Target once resolved
    pub resolved: Option<ModuleHandle>,
}

fn corrupt(handle: ModuleHandle) -> ArenaError {
    ArenaError::InvalidPointer(handle.ptr())
}

/// Read-only view of a live record
pub struct ModuleView<'a> {
    arena: &'a Arena,
    handle: ModuleHandle,
    header: RecordHeader,
    bytes: &'a [u8],
}

impl<'a> ModuleView<'a> {
    /// Open the record at `handle`
    pub fn new(arena: &'a Arena, handle: ModuleHandle) -> ArenaResult<Self> {
        let bytes = arena.payload(handle.ptr())?;
        let header = RecordHeader::decode(bytes).map_err(|_| corrupt(handle))?;
        if header.magic != RECORD_MAGIC
            || header.generation != handle.generation()
            || header.entries.range().end > bytes.len()
        {
            return Err(corrupt(handle));
        }
        Ok(Self {
            arena,
            handle,
            header,
            bytes,
        })
    }

    /// Handle of this record
    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    /// Decoded header
    pub fn header(&self) -> &RecordHeader {
        &self.header
    }

    /// Current reference count
    pub fn usage(&self) -> u16 {
        self.header.usage
    }

    /// Whether the module is a library
    pub fn is_library(&self) -> bool {
        self.header.is_library()
    }

    fn section(&self, section: Section) -> &'a [u8] {
        &self.bytes[section.range()]
    }

    /// Module name: the first resident name
    pub fn name(&self) -> String {
        self.resident_names()
            .first_name()
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    /// Path the module was loaded from, if it came from a file
    pub fn file_name(&self) -> Option<String> {
        let info = self.section(self.header.file_info);
        let mut r = ImageReader::new(info);
        let len = r.read_u16().ok()? as usize;
        if len == 0 {
            return None;
        }
        let path = r.read_slice(len).ok()?;
        Some(String::from_utf8_lossy(path).into_owned())
    }

    /// Runtime segment `index` (0-based)
    pub fn segment(&self, index: usize) -> Option<RuntimeSegment> {
        if index >= self.header.segment_count as usize {
            return None;
        }
        let start = index * RUNTIME_SEGMENT_SIZE;
        let table = self.section(self.header.segments);
        RuntimeSegment::decode(&table[start..start + RUNTIME_SEGMENT_SIZE]).ok()
    }

    /// Every runtime segment in table order
    pub fn segments(&self) -> Vec<RuntimeSegment> {
        (0..self.header.segment_count as usize)
            .filter_map(|i| self.segment(i))
            .collect()
    }

    /// Raw resource table, if the image had one
    pub fn resource_table(&self) -> Option<&'a [u8]> {
        (!self.header.resources.is_empty()).then(|| self.section(self.header.resources))
    }

    /// Resident-name table
    pub fn resident_names(&self) -> NameTable<'a> {
        NameTable::new(self.section(self.header.resident_names))
    }

    /// Non-resident-name table, if present
    pub fn nonresident_names(&self) -> Option<NameTable<'a>> {
        let ptr = self.header.nonresident_names?;
        let block = self.arena.payload(ptr).ok()?;
        let len = (self.header.nonresident_len as usize).min(block.len());
        Some(NameTable::new(&block[..len]))
    }

    /// Raw imported-name table
    pub fn imported_names(&self) -> &'a [u8] {
        self.section(self.header.imported_names)
    }

    /// Raw entry table
    pub fn entry_table(&self) -> &'a [u8] {
        self.section(self.header.entries)
    }

    fn modref_slot(&self, index: usize) -> Option<(u16, Option<ModuleHandle>)> {
        if index >= self.header.modref_count as usize {
            return None;
        }
        let table = self.section(self.header.modrefs);
        let slot = &table[index * MODREF_SLOT_SIZE..(index + 1) * MODREF_SLOT_SIZE];
        let name_offset = u16::from_le_bytes([slot[0], slot[1]]);
        Some((name_offset, ModuleHandle::from_slot(&slot[2..])))
    }

    /// Module reference `index` (0-based)
    pub fn modref(&self, index: usize) -> Option<ModuleRef> {
        let (name_offset, resolved) = self.modref_slot(index)?;
        let name = imported_name(self.imported_names(), name_offset).ok()?;
        Some(ModuleRef {
            name,
            resolved,
        })
    }

    /// Every module reference in declaration order
    pub fn modrefs(&self) -> Vec<ModuleRef> {
        (0..self.header.modref_count as usize)
            .filter_map(|i| self.modref(i))
            .collect()
    }

    /// Handle stored in reference slot `index`, if resolved
    pub fn resolved_ref(&self, index: usize) -> Option<ModuleHandle> {
        self.modref_slot(index).and_then(|(_, resolved)| resolved)
    }

    /// Modules to initialize before this one, in append order
    pub fn init_list(&self) -> Vec<ModuleHandle> {
        match self.header.init_list {
            Some(ptr) => read_init_list(self.arena, ptr),
            None => Vec::new(),
        }
    }
}

/// Mutable access to a live record
pub(crate) struct RecordMut<'a> {
    bytes: &'a mut [u8],
    header: RecordHeader,
}

impl<'a> RecordMut<'a> {
    pub(crate) fn new(arena: &'a mut Arena, handle: ModuleHandle) -> ArenaResult<Self> {
        let bytes = arena.payload_mut(handle.ptr())?;
        let header = RecordHeader::decode(bytes).map_err(|_| corrupt(handle))?;
        if header.magic != RECORD_MAGIC || header.generation != handle.generation() {
            return Err(corrupt(handle));
        }
        Ok(Self { bytes, header })
    }

    pub(crate) fn header(&self) -> &RecordHeader {
        &self.header
    }

    /// Rewrite the header after changing it
    pub(crate) fn update_header(&mut self, f: impl FnOnce(&mut RecordHeader)) {
        f(&mut self.header);
        self.bytes[..RECORD_HEADER_SIZE].copy_from_slice(&self.header.encode());
    }

    pub(crate) fn set_usage(&mut self, usage: u16) {
        self.update_header(|h| h.usage = usage);
    }

    pub(crate) fn set_modref(&mut self, index: usize, target: Option<ModuleHandle>) {
        let at = self.header.modrefs.offset as usize + index * MODREF_SLOT_SIZE + 2;
        let slot = target.map_or([0; HANDLE_SLOT_SIZE], ModuleHandle::to_slot);
        self.bytes[at..at + HANDLE_SLOT_SIZE].copy_from_slice(&slot);
    }

    pub(crate) fn write_segments(&mut self, segments: &[RuntimeSegment]) {
        let base = self.header.segments.offset as usize;
        for (i, segment) in segments
            .iter()
            .take(self.header.segment_count as usize)
            .enumerate()
        {
            let at = base + i * RUNTIME_SEGMENT_SIZE;
            segment.encode(&mut self.bytes[at..at + RUNTIME_SEGMENT_SIZE]);
        }
    }

    pub(crate) fn entry_table_mut(&mut self) -> &mut [u8] {
        let range = self.header.entries.range();
        &mut self.bytes[range]
    }

    /// Invalidate the record before its block is released
    pub(crate) fn clear_magic(&mut self) {
        self.update_header(|h| h.magic = 0);
    }
}

/// Read every non-empty slot of an initialize-list block
pub(crate) fn read_init_list(arena: &Arena, ptr: ArenaPtr) -> Vec<ModuleHandle> {
    let Ok(block) = arena.payload(ptr) else {
        return Vec::new();
    };
    block
        .chunks_exact(INIT_SLOT_SIZE)
        .map_while(ModuleHandle::from_slot)
        .collect()
}

/// Append `handle` to an initialize-list unless already present
///
/// Returns `false` when the list is full or already holds the handle.
pub(crate) fn push_init_list(arena: &mut Arena, ptr: ArenaPtr, capacity: usize, handle: ModuleHandle) -> bool {
    let Ok(block) = arena.payload_mut(ptr) else {
        return false;
    };
    // The last slot always stays zero as the terminator
    let encoded = handle.to_slot();
    for slot in block.chunks_exact_mut(INIT_SLOT_SIZE).take(capacity) {
        match ModuleHandle::from_slot(slot) {
            Some(existing) if existing == handle => return false,
            Some(_) => {}
            None => {
                slot.copy_from_slice(&encoded);
                return true;
            }
        }
    }
    false
}
