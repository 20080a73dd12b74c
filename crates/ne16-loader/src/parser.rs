//! Image parser
//!
//! Validates the headers of an image and copies every table into one arena
//! block laid out as a module record. Nothing of the source is retained, so
//! the source may be dropped as soon as parsing returns.

use std::io;

use ne16_format::header::flags;
use ne16_format::{FormatError, MzHeader, NeHeader, MZ_HEADER_SIZE, NE_HEADER_SIZE, SEGMENT_ENTRY_SIZE};
use ne16_format::{ImageReader, SegmentEntry};
use tracing::debug;

use crate::arena::{Arena, ArenaError, ArenaPtr};
use crate::config::LoaderConfig;
use crate::error::{LoadError, LoadResult};
use crate::record::{
    ModuleHandle, RecordHeader, RecordLayout, RuntimeSegment, Section, INIT_SLOT_SIZE,
    MODREF_SLOT_SIZE, RECORD_MAGIC, RUNTIME_SEGMENT_SIZE,
};
use crate::source::{ImageSource, StagedReader};

/// Result of a successful parse
#[derive(Debug, Clone)]
pub struct ParsedModule {
    /// Handle of the new record
    pub handle: ModuleHandle,
    /// Module name from the resident-name table
    pub name: String,
    /// Whether the module is a library
    pub is_library: bool,
    /// Number of reads served from the fast-load area
    pub staged_reads: usize,
}

/// Options for one parse
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    /// Use the fast-load area if present
    pub fast_load: bool,
    /// Stack floor for task modules
    pub min_task_stack: u16,
    /// Mark the record as coming from a builtin provider
    pub builtin: bool,
    /// Generation stamped into the record and its handle
    pub generation: u32,
}

impl ParseOptions {
    /// Options derived from a loader configuration
    pub fn from_config(config: &LoaderConfig) -> Self {
        Self {
            fast_load: config.fast_load,
            min_task_stack: config.min_task_stack,
            builtin: false,
            generation: 1,
        }
    }
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self::from_config(&LoaderConfig::default())
    }
}

/// Blocks allocated so far for one record, freed together on failure
struct Allocations<'a> {
    arena: &'a mut Arena,
    blocks: Vec<ArenaPtr>,
}

impl<'a> Allocations<'a> {
    fn allocate(&mut self, module: &str, size: usize) -> LoadResult<ArenaPtr> {
        let ptr = self.arena.allocate(size).map_err(|e| match e {
            ArenaError::Exhausted { requested } => LoadError::ResourceExhaustion {
                module: module.to_string(),
                requested,
            },
            _ => LoadError::ResourceExhaustion {
                module: module.to_string(),
                requested: size,
            },
        })?;
        self.blocks.push(ptr);
        Ok(ptr)
    }

    fn release(self) {
        for ptr in self.blocks {
            // Blocks were allocated above; free cannot fail for them
            let _ = self.arena.free(ptr);
        }
    }
}

fn read_error(module: &str, offset: u64, len: usize, e: io::Error) -> LoadError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        LoadError::Format {
            module: module.to_string(),
            source: FormatError::Truncated { offset, len },
        }
    } else {
        LoadError::Io {
            module: module.to_string(),
            source: e,
        }
    }
}

fn format_error(module: &str, source: FormatError) -> LoadError {
    LoadError::Format {
        module: module.to_string(),
        source,
    }
}

fn read(reader: &mut StagedReader<'_>, module: &str, offset: u64, len: usize) -> LoadResult<Vec<u8>> {
    reader
        .read_vec(offset, len)
        .map_err(|e| read_error(module, offset, len, e))
}

/// Parse an image into a new record
///
/// `label` names the module in errors until its real name is known. `path` is
/// stored as the record's file name.
pub fn parse_image(
    arena: &mut Arena,
    source: &mut dyn ImageSource,
    label: &str,
    path: &str,
    options: ParseOptions,
) -> LoadResult<ParsedModule> {
    let mut reader = StagedReader::new(source);

    let mz_bytes = read(&mut reader, label, 0, MZ_HEADER_SIZE)?;
    let mz = MzHeader::decode(&mz_bytes).map_err(|e| format_error(label, e))?;
    let lfanew = mz.lfanew as u64;

    let ne_bytes = read(&mut reader, label, lfanew, NE_HEADER_SIZE)?;
    let ne = NeHeader::decode(&ne_bytes, lfanew).map_err(|e| format_error(label, e))?;
    validate_layout(&ne).map_err(|e| format_error(label, e))?;

    if options.fast_load {
        if let Some((offset, len)) = ne.fast_load_area() {
            reader.stage(offset, len);
        }
    }

    let mut allocations = Allocations {
        arena,
        blocks: Vec::new(),
    };
    match build_record(&mut allocations, &mut reader, &ne, lfanew, label, path, options) {
        Ok(parsed) => Ok(parsed),
        Err(e) => {
            allocations.release();
            Err(e)
        }
    }
}

fn validate_layout(ne: &NeHeader) -> Result<(), FormatError> {
    if ne.modtab < ne.restab {
        return Err(FormatError::InvalidLayout("resident names end before they start"));
    }
    if ne.enttab < ne.imptab {
        return Err(FormatError::InvalidLayout("imported names end before they start"));
    }
    if (ne.segtab as usize) < NE_HEADER_SIZE && ne.cseg > 0 {
        return Err(FormatError::InvalidLayout("segment table overlaps header"));
    }
    Ok(())
}

fn build_record(
    allocations: &mut Allocations<'_>,
    reader: &mut StagedReader<'_>,
    ne: &NeHeader,
    lfanew: u64,
    label: &str,
    path: &str,
    options: ParseOptions,
) -> LoadResult<ParsedModule> {
    let seg_count = ne.cseg as usize;
    let modref_count = ne.cmod as usize;
    let path_bytes = &path.as_bytes()[..path.len().min(u16::MAX as usize)];

    let layout = RecordLayout::new(
        path_bytes.len(),
        seg_count,
        ne.resource_len(),
        ne.resident_names_len(),
        modref_count,
        ne.imported_names_len(),
        ne.cbenttab as usize,
    );
    let record = allocations.allocate(label, layout.total)?;

    // Read each table, then copy it into the record
    let at = |rel: u16| lfanew + rel as u64;

    let seg_raw = read(reader, label, at(ne.segtab), seg_count * SEGMENT_ENTRY_SIZE)?;
    let resources = if ne.has_resources() {
        read(reader, label, at(ne.rsrctab), ne.resource_len())?
    } else {
        Vec::new()
    };
    let resident = read(reader, label, at(ne.restab), ne.resident_names_len())?;
    let modref_raw = read(reader, label, at(ne.modtab), modref_count * 2)?;
    let imported = read(reader, label, at(ne.imptab), ne.imported_names_len())?;
    let entries = read(reader, label, at(ne.enttab), ne.cbenttab as usize)?;
    debug!(
        module = label,
        segments = seg_count,
        references = modref_count,
        resources = resources.len(),
        entry_bytes = entries.len(),
        "copied tables"
    );

    let mut flags_word = ne.flags & !flags::BUILTIN;
    if options.builtin {
        flags_word |= flags::BUILTIN;
    }
    let is_library = flags_word & flags::LIBMODULE != 0;
    let stack = if is_library {
        ne.stack
    } else {
        ne.stack.max(options.min_task_stack)
    };

    let mut header = RecordHeader {
        magic: RECORD_MAGIC,
        usage: 1,
        flags: flags_word,
        expected_version: ne.expver,
        autodata: ne.autodata,
        heap: ne.heap,
        stack,
        segment_count: ne.cseg,
        modref_count: ne.cmod,
        moveable_entries: ne.cmovent,
        align_shift: ne.align,
        swap_area: ne.swaparea,
        exe_type: ne.exetyp,
        other_flags: ne.flagsothers,
        cs_ip: ne.csip,
        ss_sp: ne.sssp,
        file_info: layout.file_info,
        segments: layout.segments,
        resources: layout.resources,
        resident_names: layout.resident_names,
        modrefs: layout.modrefs,
        imported_names: layout.imported_names,
        entries: layout.entries,
        nonresident_names: None,
        nonresident_len: 0,
        init_list: None,
        generation: options.generation,
    };

    if ne.cbnrestab > 0 {
        let len = ne.cbnrestab as usize;
        let names = read(reader, label, ne.nrestab as u64, len)?;
        let block = allocations.allocate(label, len)?;
        copy_into(allocations.arena, block, 0, &names)?;
        header.nonresident_names = Some(block);
        header.nonresident_len = len as u32;
    }

    if modref_count > 0 {
        let block = allocations.allocate(label, (modref_count + 1) * INIT_SLOT_SIZE)?;
        header.init_list = Some(block);
    }

    let arena = &mut *allocations.arena;

    let mut file_info = Vec::with_capacity(2 + path_bytes.len());
    file_info.extend_from_slice(&(path_bytes.len() as u16).to_le_bytes());
    file_info.extend_from_slice(path_bytes);
    copy_section(arena, record, layout.file_info, &file_info)?;

    let mut segments = vec![0u8; seg_count * RUNTIME_SEGMENT_SIZE];
    let mut seg_reader = ImageReader::with_base(&seg_raw, at(ne.segtab));
    for i in 0..seg_count {
        let entry = SegmentEntry::decode(&mut seg_reader).map_err(|e| format_error(label, e))?;
        let start = i * RUNTIME_SEGMENT_SIZE;
        RuntimeSegment { entry, selector: 0 }.encode(&mut segments[start..start + RUNTIME_SEGMENT_SIZE]);
    }
    copy_section(arena, record, layout.segments, &segments)?;
    copy_section(arena, record, layout.resources, &resources)?;
    copy_section(arena, record, layout.resident_names, &resident)?;

    let mut modrefs = vec![0u8; modref_count * MODREF_SLOT_SIZE];
    for (i, raw) in modref_raw.chunks_exact(2).enumerate() {
        let start = i * MODREF_SLOT_SIZE;
        modrefs[start..start + 2].copy_from_slice(raw);
    }
    copy_section(arena, record, layout.modrefs, &modrefs)?;
    copy_section(arena, record, layout.imported_names, &imported)?;
    copy_section(arena, record, layout.entries, &entries)?;
    copy_into(arena, record, 0, &header.encode())?;

    let name = ne16_format::NameTable::new(&resident)
        .first_name()
        .map_err(|e| format_error(label, e))?
        .ok_or_else(|| format_error(label, FormatError::InvalidLayout("module has no name")))?;

    debug!(
        module = %name,
        handle = %record,
        size = layout.total,
        staged = reader.is_staged(),
        "parsed module"
    );
    Ok(ParsedModule {
        handle: ModuleHandle::new(record, options.generation),
        name,
        is_library,
        staged_reads: reader.staged_reads(),
    })
}

fn copy_into(arena: &mut Arena, block: ArenaPtr, offset: usize, bytes: &[u8]) -> LoadResult<()> {
    let payload = arena
        .payload_mut(block)
        .map_err(|_| LoadError::InvalidHandle(ModuleHandle::new(block, 0)))?;
    payload[offset..offset + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn copy_section(arena: &mut Arena, record: ArenaPtr, section: Section, bytes: &[u8]) -> LoadResult<()> {
    debug_assert_eq!(section.len as usize, bytes.len());
    copy_into(arena, record, section.offset as usize, bytes)
}
