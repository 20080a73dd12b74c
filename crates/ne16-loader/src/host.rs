//! Segment host interface
//!
//! The loader builds and links module records; it never touches segment
//! memory. A [`SegmentHost`] owns that side: it assigns selectors and loads
//! segment data, applies relocations, and runs library initialization.

use std::fmt;
use std::sync::Arc;

use ne16_format::entry::find_entry;
use ne16_format::CONSTANT_SEGMENT;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::arena::Arena;
use crate::error::EntryError;
use crate::record::{ModuleHandle, ModuleView, RuntimeSegment};
use crate::registry::ModuleRegistry;

/// Selector returned for entries in the constant segment
pub const CONSTANT_SELECTOR: u16 = 0xFFFF;

/// A segmented `selector:offset` address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FarPtr {
    /// Segment selector
    pub selector: u16,
    /// Offset within the segment
    pub offset: u16,
}

impl FarPtr {
    /// Build an address
    pub const fn new(selector: u16, offset: u16) -> Self {
        Self { selector, offset }
    }

    /// Packed as `selector << 16 | offset`
    pub const fn to_u32(self) -> u32 {
        (self.selector as u32) << 16 | self.offset as u32
    }
}

impl fmt::Display for FarPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.selector, self.offset)
    }
}

/// Failure reported by a host
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HostError {
    message: String,
}

impl HostError {
    /// Create an error with a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The message
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A module's segment table handed to the host for loading
///
/// The host fills in selectors (and may update flags); the loader writes the
/// table back into the record afterwards.
#[derive(Debug, Clone)]
pub struct SegmentTableMut {
    module: String,
    path: Option<String>,
    align_shift: u16,
    segments: Vec<RuntimeSegment>,
}

impl SegmentTableMut {
    pub(crate) fn from_view(view: &ModuleView<'_>) -> Self {
        Self {
            module: view.name(),
            path: view.file_name(),
            align_shift: view.header().align_shift,
            segments: view.segments(),
        }
    }

    pub(crate) fn into_segments(self) -> Vec<RuntimeSegment> {
        self.segments
    }

    /// Name of the module
    pub fn module(&self) -> &str {
        &self.module
    }

    /// File to read segment data from
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Alignment shift of segment file positions
    pub fn align_shift(&self) -> u16 {
        self.align_shift
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the module has no segments
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segment `index` (0-based)
    pub fn get(&self, index: usize) -> Option<&RuntimeSegment> {
        self.segments.get(index)
    }

    /// All segments
    pub fn iter(&self) -> impl Iterator<Item = &RuntimeSegment> {
        self.segments.iter()
    }

    /// Record the selector assigned to segment `index`
    pub fn set_selector(&mut self, index: usize, selector: u16) -> bool {
        match self.segments.get_mut(index) {
            Some(segment) => {
                segment.selector = selector;
                true
            }
            None => false,
        }
    }

    /// Replace the flags of segment `index`
    pub fn set_flags(&mut self, index: usize, flags: u16) -> bool {
        match self.segments.get_mut(index) {
            Some(segment) => {
                segment.entry.flags = flags;
                true
            }
            None => false,
        }
    }
}

/// Resolve an ordinal of a record to an address
pub(crate) fn resolve_in_view(view: &ModuleView<'_>, ordinal: u16) -> Result<FarPtr, EntryError> {
    let entry = find_entry(view.entry_table(), ordinal)
        .ok()
        .flatten()
        .ok_or(EntryError::NotFound { ordinal })?;
    if entry.segment == CONSTANT_SEGMENT {
        return Ok(FarPtr::new(CONSTANT_SELECTOR, entry.offset));
    }
    let segment = (entry.segment as usize)
        .checked_sub(1)
        .and_then(|index| view.segment(index))
        .ok_or(EntryError::NotFound { ordinal })?;
    Ok(FarPtr::new(segment.selector, entry.offset))
}

/// Lookups available to the host while it applies relocations
///
/// Every module loaded in the same call has its segments loaded before any
/// relocation runs, so imports between them resolve.
pub struct FixupContext<'a> {
    arena: &'a Arena,
    registry: &'a ModuleRegistry,
    module: ModuleHandle,
}

impl<'a> FixupContext<'a> {
    pub(crate) fn new(arena: &'a Arena, registry: &'a ModuleRegistry, module: ModuleHandle) -> Self {
        Self {
            arena,
            registry,
            module,
        }
    }

    fn target(&self, modref: usize) -> Option<ModuleView<'a>> {
        let view = ModuleView::new(self.arena, self.module).ok()?;
        let target = view.resolved_ref(modref)?;
        ModuleView::new(self.arena, target).ok()
    }

    /// Address of `ordinal` in the module named by reference slot `modref`
    pub fn resolve_import(&self, modref: usize, ordinal: u16) -> Option<FarPtr> {
        let target = self.target(modref)?;
        let state = self.registry.state(target.handle())?;
        if !state.has_segments() {
            return None;
        }
        resolve_in_view(&target, ordinal).ok()
    }

    /// Address of the export `name` in the module named by reference slot `modref`
    pub fn resolve_import_by_name(&self, modref: usize, name: &str) -> Option<FarPtr> {
        let target = self.target(modref)?;
        let ordinal = crate::loader::ordinal_in_view(&target, name)?;
        self.resolve_import(modref, ordinal)
    }

    /// Address of `ordinal` within the module being fixed up
    pub fn resolve_own(&self, ordinal: u16) -> Option<FarPtr> {
        let view = ModuleView::new(self.arena, self.module).ok()?;
        resolve_in_view(&view, ordinal).ok()
    }
}

/// Host-side segment management
///
/// Every method runs while the owning [`AddressSpace`](crate::AddressSpace)
/// is locked. An implementation must not call back into that space (to load
/// or free a module, or to query one); the lock is not reentrant and such a
/// call deadlocks. Imports are resolved through the [`FixupContext`] passed
/// to `apply_fixups`.
pub trait SegmentHost: Send {
    /// Assign selectors and load segment data
    fn load_segments(&mut self, segments: &mut SegmentTableMut) -> Result<(), HostError>;

    /// Apply relocations for a module whose segments are loaded
    fn apply_fixups(&mut self, module: &ModuleView<'_>, ctx: &FixupContext<'_>) -> Result<(), HostError>;

    /// Run a library's initialization routine
    fn initialize(&mut self, module: &ModuleView<'_>) -> Result<(), HostError>;

    /// Release a module's segments before its record is freed
    fn release(&mut self, _module: &ModuleView<'_>) {}
}

#[derive(Debug)]
struct StubState {
    next_selector: u16,
    initialized: Vec<String>,
    fixed_up: Vec<String>,
    released: Vec<String>,
    fail_initialize: Option<String>,
}

impl Default for StubState {
    fn default() -> Self {
        Self {
            next_selector: StubSegmentHost::FIRST_SELECTOR,
            initialized: Vec::new(),
            fixed_up: Vec::new(),
            released: Vec::new(),
            fail_initialize: None,
        }
    }
}

/// A host that hands out sequential selectors and records calls
///
/// Used when no emulator is attached: tools that only inspect modules, and
/// tests. Clones share one call log.
#[derive(Debug, Clone, Default)]
pub struct StubSegmentHost {
    state: Arc<Mutex<StubState>>,
}

impl StubSegmentHost {
    /// First selector handed out
    pub const FIRST_SELECTOR: u16 = 0x0107;

    /// Create a stub host
    pub fn new() -> Self {
        Self::default()
    }

    /// Make initialization of `module` fail
    pub fn fail_initialize(&self, module: &str) {
        self.state.lock().fail_initialize = Some(module.to_ascii_uppercase());
    }

    /// Modules initialized, in call order
    pub fn initialized(&self) -> Vec<String> {
        self.state.lock().initialized.clone()
    }

    /// Modules fixed up, in call order
    pub fn fixed_up(&self) -> Vec<String> {
        self.state.lock().fixed_up.clone()
    }

    /// Modules released, in call order
    pub fn released(&self) -> Vec<String> {
        self.state.lock().released.clone()
    }
}

impl SegmentHost for StubSegmentHost {
    fn load_segments(&mut self, segments: &mut SegmentTableMut) -> Result<(), HostError> {
        let mut state = self.state.lock();
        for index in 0..segments.len() {
            // Selectors step by 8 like LDT descriptors
            let selector = state.next_selector;
            state.next_selector = state
                .next_selector
                .checked_add(8)
                .ok_or_else(|| HostError::new("out of selectors"))?;
            segments.set_selector(index, selector);
        }
        Ok(())
    }

    fn apply_fixups(&mut self, module: &ModuleView<'_>, _ctx: &FixupContext<'_>) -> Result<(), HostError> {
        self.state.lock().fixed_up.push(module.name());
        Ok(())
    }

    fn initialize(&mut self, module: &ModuleView<'_>) -> Result<(), HostError> {
        let mut state = self.state.lock();
        let name = module.name();
        if state.fail_initialize.as_deref() == Some(name.to_ascii_uppercase().as_str()) {
            return Err(HostError::new(format!("{name} initialization failed")));
        }
        state.initialized.push(name);
        Ok(())
    }

    fn release(&mut self, module: &ModuleView<'_>) {
        self.state.lock().released.push(module.name());
    }
}
