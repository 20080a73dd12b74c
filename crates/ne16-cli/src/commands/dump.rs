//! `ne16 dump`: Show one image's headers and tables.

use std::path::Path;

use anyhow::Context;
use ne16_format::{MzHeader, NeHeader, MZ_HEADER_SIZE, NE_HEADER_SIZE};
use ne16_loader::{
    parse_image, Arena, LoaderConfig, MemoryImage, ModuleInfo, ModuleState, ModuleView, ParseOptions,
};
use serde::Serialize;

use crate::output::StyledOutput;

#[derive(Serialize)]
struct DumpReport {
    file: String,
    header: NeHeader,
    module: ModuleInfo,
}

fn read_header(bytes: &[u8]) -> anyhow::Result<NeHeader> {
    let mz = MzHeader::decode(bytes.get(..MZ_HEADER_SIZE).unwrap_or(bytes))?;
    let at = mz.lfanew as usize;
    let ne = bytes
        .get(at..at + NE_HEADER_SIZE)
        .context("secondary header lies past the end of the file")?;
    Ok(NeHeader::decode(ne, at as u64)?)
}

pub fn execute(out: &mut StyledOutput, config: &LoaderConfig, file: &Path, json: bool) -> anyhow::Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let path = file.to_string_lossy().into_owned();

    let mut arena = Arena::new(config.arena_capacity)?;
    let mut image = MemoryImage::new(bytes.clone());
    let parsed = parse_image(&mut arena, &mut image, &path, &path, ParseOptions::from_config(config))?;
    let header = read_header(&bytes)?;
    let view = ModuleView::new(&arena, parsed.handle)?;
    let report = DumpReport {
        file: path,
        header,
        module: ModuleInfo::from_view(&view, ModuleState::HeaderParsed),
    };

    if json {
        return out.json(&report);
    }
    print_report(out, &report, parsed.staged_reads);
    Ok(())
}

fn print_report(out: &mut StyledOutput, report: &DumpReport, staged_reads: usize) {
    let module = &report.module;
    let header = &report.header;

    out.heading(&format!("{} ({})", module.name, report.file));
    out.field("type", if module.is_library { "library" } else { "task" });
    out.field("linker", format!("{}.{}", header.ver, header.rev));
    out.field("flags", format!("{:#06x}", module.flags));
    out.field("expected version", format!("{}.{:02}", module.expected_version >> 8, module.expected_version & 0xFF));
    out.field("target os", header.exetyp);
    out.field("auto data", module.autodata);
    out.field("heap / stack", format!("{:#06x} / {:#06x}", module.heap, module.stack));
    out.field("cs:ip", format!("{:04x}:{:04x}", module.cs_ip >> 16, module.cs_ip & 0xFFFF));
    out.field("ss:sp", format!("{:04x}:{:04x}", module.ss_sp >> 16, module.ss_sp & 0xFFFF));
    out.field("alignment", format!("{} bytes", 1u32 << module.align_shift.min(31)));
    out.field("resources", format!("{} bytes", module.resource_table_len));
    if let Some((offset, len)) = header.fast_load_area() {
        out.field("fast-load area", format!("{:#x}+{:#x} ({} reads)", offset, len, staged_reads));
    }
    out.newline();

    out.heading(&format!("Segments ({})", module.segments.len()));
    for (i, segment) in module.segments.iter().enumerate() {
        let entry = &segment.entry;
        let kind = if entry.is_data() { "DATA" } else { "CODE" };
        out.plain(&format!(
            "  {:>3}  {}  file {:#07x}  size {:#06x}  alloc {:#07x}  flags {:#06x}\n",
            i + 1,
            kind,
            entry.file_offset(module.align_shift),
            entry.data_len(),
            entry.alloc_len(),
            entry.flags
        ));
    }
    out.newline();

    out.heading(&format!("References ({})", module.references.len()));
    for reference in &module.references {
        out.plain(&format!("  {}\n", reference.name));
    }
    out.newline();

    out.heading(&format!("Entries ({})", module.entries.len()));
    for entry in &module.entries {
        let kind = if entry.moveable { "moveable" } else { "fixed" };
        out.plain(&format!(
            "  @{:<5} seg {:>3}  offset {:#06x}  {}\n",
            entry.ordinal, entry.segment, entry.offset, kind
        ));
    }
    out.newline();

    out.heading("Names");
    for name in module.resident_names.iter().skip(1) {
        out.plain(&format!("  @{:<5} {}\n", name.ordinal, name.name));
    }
    for name in module.nonresident_names.iter().skip(1) {
        out.plain(&format!("  @{:<5} {} (non-resident)\n", name.ordinal, name.name));
    }
    if let Some(description) = module.nonresident_names.first() {
        out.field("description", &description.name);
    }
}
