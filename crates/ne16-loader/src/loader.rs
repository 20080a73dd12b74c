//! Dependency resolution and initialization
//!
//! `LoaderState` holds everything one address space owns. A load runs as a
//! single pass: the requested module and every module it pulls in are parsed
//! depth-first, then handed to the segment host for segment loading and
//! relocation, then initialized children first. A failure anywhere discards
//! every record the pass created, so no partially loaded module survives.

use std::io;
use std::path::{Path, PathBuf};

use ne16_format::entry::patch_entry;
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::arena::Arena;
use crate::config::LoaderConfig;
use crate::error::{EntryError, LoadError, LoadResult};
use crate::host::{resolve_in_view, FarPtr, FixupContext, SegmentHost, SegmentTableMut};
use crate::parser::{parse_image, ParseOptions};
use crate::record::{push_init_list, ModuleHandle, ModuleView, RecordMut};
use crate::registry::{ModuleRegistry, ModuleState};
use crate::source::{has_extension, ModuleOpener, OpenedImage};

/// Ordinal exported under `name`
///
/// `#nnn` names an ordinal directly. Otherwise the uppercased name is looked
/// up in the resident names, then the non-resident names.
pub(crate) fn ordinal_in_view(view: &ModuleView<'_>, name: &str) -> Option<u16> {
    if let Some(number) = name.strip_prefix('#') {
        return number.parse().ok();
    }
    let upper = name.to_ascii_uppercase();
    if let Ok(Some(ordinal)) = view.resident_names().find_ordinal(&upper) {
        return Some(ordinal);
    }
    view.nonresident_names()?.find_ordinal(&upper).ok().flatten()
}

/// Bookkeeping for one `load_module` call
#[derive(Debug, Default)]
struct LoadPass {
    /// Records created by this pass, in creation order
    created: Vec<ModuleHandle>,
    /// Records whose references are all resolved, in completion order
    completed: Vec<ModuleHandle>,
    /// Modules loaded before this pass whose usage it raised
    bumped: Vec<ModuleHandle>,
}

impl LoadPass {
    fn is_new(&self, handle: ModuleHandle) -> bool {
        self.created.contains(&handle)
    }
}

/// Arena, registry and collaborators of one address space
pub(crate) struct LoaderState {
    pub(crate) arena: Arena,
    pub(crate) registry: ModuleRegistry,
    pub(crate) config: LoaderConfig,
    opener: Box<dyn ModuleOpener>,
    host: Box<dyn SegmentHost>,
    next_generation: u32,
}

impl LoaderState {
    pub(crate) fn new(
        arena: Arena,
        config: LoaderConfig,
        opener: Box<dyn ModuleOpener>,
        host: Box<dyn SegmentHost>,
    ) -> Self {
        Self {
            arena,
            registry: ModuleRegistry::new(),
            config,
            opener,
            host,
            next_generation: 1,
        }
    }

    pub(crate) fn view(&self, handle: ModuleHandle) -> LoadResult<ModuleView<'_>> {
        if !self.registry.contains(handle) {
            return Err(LoadError::InvalidHandle(handle));
        }
        ModuleView::new(&self.arena, handle).map_err(|_| LoadError::InvalidHandle(handle))
    }

    fn record_mut(&mut self, handle: ModuleHandle) -> LoadResult<RecordMut<'_>> {
        RecordMut::new(&mut self.arena, handle).map_err(|_| LoadError::InvalidHandle(handle))
    }

    fn take_generation(&mut self) -> u32 {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.checked_add(1).unwrap_or(1);
        generation
    }

    fn bump_usage(&mut self, handle: ModuleHandle) -> LoadResult<u16> {
        let mut record = self.record_mut(handle)?;
        let usage = record.header().usage.saturating_add(1);
        record.set_usage(usage);
        Ok(usage)
    }

    /// Load `name` and everything it references
    pub(crate) fn load_module(&mut self, name: &str, hint: Option<&Path>) -> LoadResult<ModuleHandle> {
        if let Some(handle) = self.registry.find_by_name(name) {
            let usage = self.bump_usage(handle)?;
            debug!(module = name, %handle, usage, "already loaded");
            return Ok(handle);
        }

        let mut pass = LoadPass::default();
        let result = self
            .load_tree(name, hint, None, &mut pass)
            .and_then(|root| self.finish_pass(root, &pass).map(|()| root));
        match result {
            Ok(root) => {
                info!(module = name, handle = %root, modules = pass.created.len(), "loaded");
                Ok(root)
            }
            Err(e) => {
                warn!(module = name, error = %e, "load failed");
                self.discard_pass(&pass);
                Err(e)
            }
        }
    }

    fn open_image(
        &mut self,
        name: &str,
        hint: Option<&Path>,
        fallback: Option<&Path>,
    ) -> LoadResult<(OpenedImage, bool)> {
        if let Some(image) = self.opener.try_load_builtin(name) {
            return Ok((image, true));
        }
        if let Some(image) = self.opener.try_load_native(name) {
            return Ok((image, false));
        }
        let first = self.opener.open(name, hint);
        let opened = match (first, fallback) {
            (Err(e), Some(dir)) if e.kind() == io::ErrorKind::NotFound => {
                debug!(module = name, dir = %dir.display(), "retrying in requester's directory");
                self.opener.open(name, Some(dir))
            }
            (result, _) => result,
        };
        match opened {
            Ok(image) => Ok((image, false)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(LoadError::NotFound(name.to_string())),
            Err(e) => Err(LoadError::Io {
                module: name.to_string(),
                source: e,
            }),
        }
    }

    /// Parse `name` and resolve its references, depth-first
    fn load_tree(
        &mut self,
        name: &str,
        hint: Option<&Path>,
        fallback: Option<&Path>,
        pass: &mut LoadPass,
    ) -> LoadResult<ModuleHandle> {
        let (mut image, builtin) = self.open_image(name, hint, fallback)?;
        let options = ParseOptions {
            builtin,
            generation: self.take_generation(),
            ..ParseOptions::from_config(&self.config)
        };
        let parsed = parse_image(&mut self.arena, image.source.as_mut(), name, &image.path, options)?;
        let path = image.path;
        drop(image.source);

        let handle = parsed.handle;
        let stored_path = (!path.is_empty()).then(|| path.clone());
        if let Err(existing) =
            self.registry
                .insert(handle, &parsed.name, stored_path, ModuleState::HeaderParsed)
        {
            // A different file name for a module already loaded
            warn!(module = %parsed.name, requested = name, "already loaded under another name");
            self.free_blocks(handle);
            self.bump_usage(existing)?;
            if !pass.is_new(existing) {
                pass.bumped.push(existing);
            }
            return Ok(existing);
        }
        pass.created.push(handle);
        self.registry.advance(handle, ModuleState::ResolvingDependencies);

        let requester_dir = Path::new(&path)
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(PathBuf::from);
        let (modref_count, init_list) = {
            let view = self.view(handle)?;
            (view.header().modref_count as usize, view.header().init_list)
        };

        for index in 0..modref_count {
            let reference = self.view(handle)?.modref(index).ok_or_else(|| LoadError::Format {
                module: parsed.name.clone(),
                source: ne16_format::FormatError::InvalidLayout("module reference outside imported names"),
            })?;

            let target = match self.registry.find_by_name(&reference.name) {
                Some(found) => {
                    self.bump_usage(found)?;
                    if !pass.is_new(found) {
                        pass.bumped.push(found);
                    }
                    debug!(module = %parsed.name, dependency = %reference.name, handle = %found, "resolved to loaded module");
                    found
                }
                None => {
                    let file_name = if has_extension(&reference.name) {
                        reference.name.clone()
                    } else {
                        format!("{}{}", reference.name, self.config.default_extension)
                    };
                    self.load_tree(&file_name, None, requester_dir.as_deref(), pass)
                        .map_err(|e| LoadError::Dependency {
                            module: parsed.name.clone(),
                            dependency: reference.name.clone(),
                            source: Box::new(e),
                        })?
                }
            };

            self.record_mut(handle)?.set_modref(index, Some(target));
            let pending = self
                .registry
                .state(target)
                .is_some_and(|state| state < ModuleState::Initialized);
            if let (true, Some(list)) = (pending, init_list) {
                push_init_list(&mut self.arena, list, modref_count, target);
            }
        }

        // Uses taken by descendants during a cycle are not counted
        self.record_mut(handle)?.set_usage(1);
        pass.completed.push(handle);
        debug!(module = %parsed.name, %handle, references = modref_count, "references resolved");
        Ok(handle)
    }

    /// Load segments, apply fixups, and initialize the records of a pass
    fn finish_pass(&mut self, root: ModuleHandle, pass: &LoadPass) -> LoadResult<()> {
        for &handle in &pass.completed {
            let mut table = {
                let view = self.view(handle)?;
                SegmentTableMut::from_view(&view)
            };
            self.host
                .load_segments(&mut table)
                .map_err(|e| LoadError::Host {
                    module: table.module().to_string(),
                    message: e.message().to_string(),
                })?;
            self.record_mut(handle)?.write_segments(&table.into_segments());
            self.registry.advance(handle, ModuleState::SegmentsLoaded);
        }

        for &handle in &pass.completed {
            let view = ModuleView::new(&self.arena, handle).map_err(|_| LoadError::InvalidHandle(handle))?;
            let ctx = FixupContext::new(&self.arena, &self.registry, handle);
            self.host
                .apply_fixups(&view, &ctx)
                .map_err(|e| LoadError::Host {
                    module: view.name(),
                    message: e.message().to_string(),
                })?;
            self.registry.advance(handle, ModuleState::FixedUp);
        }

        let mut visited = FxHashSet::default();
        self.initialize_tree(root, &mut visited)?;

        for &handle in &pass.completed {
            self.registry.advance(handle, ModuleState::Active);
        }
        Ok(())
    }

    /// Initialize the modules on `handle`'s initialize-list, then `handle`
    fn initialize_tree(&mut self, handle: ModuleHandle, visited: &mut FxHashSet<ModuleHandle>) -> LoadResult<()> {
        if !visited.insert(handle) {
            return Ok(());
        }
        match self.registry.state(handle) {
            Some(state) if state >= ModuleState::FixedUp && state < ModuleState::Initialized => {}
            _ => return Ok(()),
        }

        let children = self.view(handle)?.init_list();
        for child in children {
            self.initialize_tree(child, visited)?;
        }

        let view = ModuleView::new(&self.arena, handle).map_err(|_| LoadError::InvalidHandle(handle))?;
        if view.is_library() {
            self.host.initialize(&view).map_err(|e| LoadError::Host {
                module: view.name(),
                message: e.message().to_string(),
            })?;
            debug!(module = %view.name(), %handle, "initialized");
        }
        self.registry.advance(handle, ModuleState::Initialized);
        Ok(())
    }

    /// Undo every effect of a failed pass
    fn discard_pass(&mut self, pass: &LoadPass) {
        for &handle in pass.created.iter().rev() {
            let Some(entry) = self.registry.remove(handle) else {
                continue;
            };
            if entry.state.has_segments() {
                if let Ok(view) = ModuleView::new(&self.arena, handle) {
                    self.host.release(&view);
                }
            }
            self.free_blocks(handle);
        }
        for &handle in &pass.bumped {
            if self.registry.contains(handle) {
                if let Ok(mut record) = self.record_mut(handle) {
                    let usage = record.header().usage.saturating_sub(1).max(1);
                    record.set_usage(usage);
                }
            }
        }
    }

    /// Invalidate a record and free its blocks
    fn free_blocks(&mut self, handle: ModuleHandle) {
        let Ok(mut record) = self.record_mut(handle) else {
            return;
        };
        let header = record.header().clone();
        record.clear_magic();
        for ptr in [header.nonresident_names, header.init_list].into_iter().flatten() {
            let _ = self.arena.free(ptr);
        }
        let _ = self.arena.free(handle.ptr());
    }

    /// Drop one use of a module; at zero, unload it and release its references
    pub(crate) fn free_module(&mut self, handle: ModuleHandle) -> LoadResult<u16> {
        let (name, usage, references) = {
            let view = self.view(handle)?;
            let references: Vec<ModuleHandle> = (0..view.header().modref_count as usize)
                .filter_map(|i| view.resolved_ref(i))
                .collect();
            (view.name(), view.usage(), references)
        };
        if usage > 1 {
            self.record_mut(handle)?.set_usage(usage - 1);
            debug!(module = %name, %handle, usage = usage - 1, "usage decremented");
            return Ok(usage - 1);
        }

        let state = self.registry.remove(handle).map(|e| e.state);
        if state.is_some_and(ModuleState::has_segments) {
            if let Ok(view) = ModuleView::new(&self.arena, handle) {
                self.host.release(&view);
            }
        }

        for reference in references {
            if self.registry.contains(reference) {
                self.free_module(reference)?;
            }
        }
        self.free_blocks(handle);
        info!(module = %name, %handle, "unloaded");
        Ok(0)
    }

    /// Release every module regardless of usage
    pub(crate) fn unload_all(&mut self) {
        let handles: Vec<ModuleHandle> = self.registry.iter().map(|e| e.handle).collect();
        for handle in handles.into_iter().rev() {
            if let Some(entry) = self.registry.remove(handle) {
                if entry.state.has_segments() {
                    if let Ok(view) = ModuleView::new(&self.arena, handle) {
                        self.host.release(&view);
                    }
                }
                self.free_blocks(handle);
            }
        }
    }

    /// Address of `ordinal` in a module whose segments are loaded
    pub(crate) fn resolve_entry(&self, handle: ModuleHandle, ordinal: u16) -> Result<FarPtr, EntryError> {
        let state = self
            .registry
            .state(handle)
            .ok_or(EntryError::InvalidHandle(handle))?;
        if !state.has_segments() {
            return Err(EntryError::NotReady(state));
        }
        let view = ModuleView::new(&self.arena, handle).map_err(|_| EntryError::InvalidHandle(handle))?;
        resolve_in_view(&view, ordinal)
    }

    /// Rewrite the offset of an existing entry
    pub(crate) fn patch_entry(&mut self, handle: ModuleHandle, ordinal: u16, offset: u16) -> bool {
        if !self.registry.contains(handle) {
            return false;
        }
        match RecordMut::new(&mut self.arena, handle) {
            Ok(mut record) => patch_entry(record.entry_table_mut(), ordinal, offset),
            Err(_) => false,
        }
    }

    pub(crate) fn get_ordinal(&self, handle: ModuleHandle, name: &str) -> Result<u16, EntryError> {
        let view = self.view(handle).map_err(|_| EntryError::InvalidHandle(handle))?;
        ordinal_in_view(&view, name).ok_or_else(|| EntryError::UnknownName(name.to_string()))
    }

    pub(crate) fn get_proc_address(&self, handle: ModuleHandle, name: &str) -> Result<FarPtr, EntryError> {
        let ordinal = self.get_ordinal(handle, name)?;
        self.resolve_entry(handle, ordinal)
    }
}
