//! `ne16 load`: Load modules into an address space and report the result.

use std::path::PathBuf;

use ne16_loader::{
    AddressSpace, ArenaInfo, FarPtr, LoadError, LoaderConfig, ModuleState, SearchPathOpener,
    StubSegmentHost,
};
use serde::Serialize;
use tracing::debug;

use crate::output::StyledOutput;

/// Arguments of `ne16 load`.
pub struct LoadOptions {
    pub modules: Vec<String>,
    pub search_paths: Vec<PathBuf>,
    pub hint: Option<PathBuf>,
    pub procs: Vec<String>,
    pub json: bool,
}

#[derive(Serialize)]
struct LoadedModule {
    name: String,
    file: Option<String>,
    state: ModuleState,
    usage: u16,
    segments: usize,
}

#[derive(Serialize)]
struct ResolvedProc {
    name: String,
    address: Option<FarPtr>,
    error: Option<String>,
}

#[derive(Serialize)]
struct LoadReport {
    modules: Vec<LoadedModule>,
    initialization_order: Vec<String>,
    procs: Vec<ResolvedProc>,
    arena: ArenaInfo,
    largest_free: usize,
}

fn describe_failure(err: &LoadError) -> String {
    let chain = err.dependency_chain();
    if chain.is_empty() {
        err.to_string()
    } else {
        format!("{} ({})", err.root_cause(), chain.join(" -> "))
    }
}

pub fn execute(out: &mut StyledOutput, mut config: LoaderConfig, options: LoadOptions) -> anyhow::Result<()> {
    config.search_paths.extend(options.search_paths);
    config.validate()?;

    let host = StubSegmentHost::new();
    let opener = SearchPathOpener::new(config.search_paths.clone());
    let space = AddressSpace::new(config, Box::new(opener), Box::new(host.clone()))?;

    let mut roots = Vec::new();
    for name in &options.modules {
        match space.load_module(name, options.hint.as_deref()) {
            Ok(handle) => {
                debug!(module = %name, %handle, "loaded from command line");
                roots.push(handle);
            }
            Err(e) => anyhow::bail!("cannot load {}: {}", name, describe_failure(&e)),
        }
    }

    let mut procs = Vec::new();
    if let Some(&first) = roots.first() {
        for name in &options.procs {
            let resolved = space.get_proc_address(first, name);
            procs.push(ResolvedProc {
                name: name.clone(),
                address: resolved.as_ref().ok().copied(),
                error: resolved.err().map(|e| e.to_string()),
            });
        }
    }

    let mut modules = Vec::new();
    for entry in space.walk_modules() {
        let info = space.module_info(entry.handle)?;
        modules.push(LoadedModule {
            name: entry.name,
            file: entry.path,
            state: entry.state,
            usage: info.usage,
            segments: info.segments.len(),
        });
    }
    let report = LoadReport {
        modules,
        initialization_order: host.initialized(),
        procs,
        arena: space.arena_info(),
        largest_free: space.largest_free(),
    };

    if options.json {
        return out.json(&report);
    }
    print_report(out, &report);
    Ok(())
}

fn print_report(out: &mut StyledOutput, report: &LoadReport) {
    out.heading(&format!("Loaded modules ({})", report.modules.len()));
    for module in &report.modules {
        out.plain(&format!(
            "  {:<12} usage {:>3}  {:>3} segments  {:<16} {}\n",
            module.name,
            module.usage,
            module.segments,
            module.state.to_string(),
            module.file.as_deref().unwrap_or("-")
        ));
    }
    out.newline();

    out.heading("Initialization order");
    out.plain(&format!("  {}\n", report.initialization_order.join(", ")));
    out.newline();

    if !report.procs.is_empty() {
        out.heading("Exports");
        for proc in &report.procs {
            out.plain(&format!("  {:<24} ", proc.name));
            match (&proc.address, &proc.error) {
                (Some(address), _) => out.success(&address.to_string()),
                (None, Some(error)) => out.warning(error),
                (None, None) => {}
            }
            out.newline();
        }
        out.newline();
    }

    out.heading("Arena");
    out.field("blocks in use", report.arena.blocks_in_use);
    out.field("free bytes", report.arena.free_bytes);
    out.field("largest free run", report.largest_free);
}
