//! Address space
//!
//! An `AddressSpace` owns one arena and one module registry. Independent
//! spaces share nothing; every operation on one space is serialized by its
//! lock, so a lookup and the insert that follows it can never interleave with
//! another load.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use ne16_format::entry::entries;
use ne16_format::{EntryPoint, NameEntry};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::arena::{Arena, ArenaInfo};
use crate::config::LoaderConfig;
use crate::error::{EntryError, LoadError, LoadResult};
use crate::host::{FarPtr, SegmentHost, StubSegmentHost};
use crate::loader::LoaderState;
use crate::record::{ModuleHandle, ModuleRef, ModuleView, RuntimeSegment};
use crate::registry::{ModuleState, RegistryEntry};
use crate::source::{ModuleOpener, SearchPathOpener};

/// Unique identifier for an address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AddressSpaceId(u64);

impl AddressSpaceId {
    /// Allocate a new identifier
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        AddressSpaceId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for AddressSpaceId {
    fn default() -> Self {
        Self::new()
    }
}

/// Structured description of a loaded module
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    /// Record handle
    pub handle: ModuleHandle,
    /// Module name
    pub name: String,
    /// File the module was loaded from
    pub file_name: Option<String>,
    /// Lifecycle state
    pub state: ModuleState,
    /// Reference count
    pub usage: u16,
    /// Module flags
    pub flags: u16,
    /// Library (DLL) rather than task
    pub is_library: bool,
    /// Provided by a builtin source
    pub is_builtin: bool,
    /// Expected Windows version
    pub expected_version: u16,
    /// Automatic data segment (1-based, 0 = none)
    pub autodata: u16,
    /// Initial local heap size
    pub heap: u16,
    /// Stack size
    pub stack: u16,
    /// Initial `CS:IP`
    pub cs_ip: u32,
    /// Initial `SS:SP`
    pub ss_sp: u32,
    /// Target operating system byte
    pub exe_type: u8,
    /// Segment alignment shift
    pub align_shift: u16,
    /// Segments with their selectors
    pub segments: Vec<RuntimeSegment>,
    /// Size of the resource table, 0 if absent
    pub resource_table_len: usize,
    /// Resident names, module name first
    pub resident_names: Vec<NameEntry>,
    /// Non-resident names, description first
    pub nonresident_names: Vec<NameEntry>,
    /// Module references
    pub references: Vec<ModuleRef>,
    /// Assigned entry points
    pub entries: Vec<EntryPoint>,
}

impl ModuleInfo {
    /// Describe the record behind `view`
    pub fn from_view(view: &ModuleView<'_>, state: ModuleState) -> Self {
        let header = view.header();
        Self {
            handle: view.handle(),
            name: view.name(),
            file_name: view.file_name(),
            state,
            usage: header.usage,
            flags: header.flags,
            is_library: header.is_library(),
            is_builtin: header.is_builtin(),
            expected_version: header.expected_version,
            autodata: header.autodata,
            heap: header.heap,
            stack: header.stack,
            cs_ip: header.cs_ip,
            ss_sp: header.ss_sp,
            exe_type: header.exe_type,
            align_shift: header.align_shift,
            segments: view.segments(),
            resource_table_len: view.resource_table().map_or(0, <[u8]>::len),
            resident_names: view.resident_names().entries().unwrap_or_default(),
            nonresident_names: view
                .nonresident_names()
                .and_then(|t| t.entries().ok())
                .unwrap_or_default(),
            references: view.modrefs(),
            entries: entries(view.entry_table()).unwrap_or_default(),
        }
    }
}

/// One arena plus the modules loaded into it
pub struct AddressSpace {
    id: AddressSpaceId,
    state: Mutex<LoaderState>,
}

impl AddressSpace {
    /// Create an address space
    pub fn new(
        config: LoaderConfig,
        opener: Box<dyn ModuleOpener>,
        host: Box<dyn SegmentHost>,
    ) -> LoadResult<Self> {
        let arena = Arena::with_split_threshold(config.arena_capacity, config.split_threshold).map_err(|_| {
            LoadError::ResourceExhaustion {
                module: String::new(),
                requested: config.arena_capacity,
            }
        })?;
        let id = AddressSpaceId::new();
        info!(space = id.as_u64(), capacity = config.arena_capacity, "address space created");
        Ok(Self {
            id,
            state: Mutex::new(LoaderState::new(arena, config, opener, host)),
        })
    }

    /// Create an address space that opens files from the configured search
    /// paths and uses a stub segment host
    pub fn with_defaults(config: LoaderConfig) -> LoadResult<Self> {
        let opener = SearchPathOpener::new(config.search_paths.clone());
        Self::new(config, Box::new(opener), Box::new(StubSegmentHost::new()))
    }

    /// Identifier of this space
    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// Configuration the space was created with
    pub fn config(&self) -> LoaderConfig {
        self.state.lock().config.clone()
    }

    /// Load a module and everything it references
    ///
    /// A module already loaded has its usage count raised instead. `hint` is
    /// a directory searched in addition to the configured search paths. The
    /// space stays locked through the [`SegmentHost`] callbacks, so a host
    /// must not re-enter it.
    pub fn load_module(&self, name: &str, hint: Option<&Path>) -> LoadResult<ModuleHandle> {
        self.state.lock().load_module(name, hint)
    }

    /// Drop one use of a module, unloading it at zero
    ///
    /// # Returns
    ///
    /// The remaining usage count.
    pub fn free_module(&self, handle: ModuleHandle) -> LoadResult<u16> {
        self.state.lock().free_module(handle)
    }

    /// Find a loaded module by module name or file name
    pub fn find_by_name(&self, name: &str) -> Option<ModuleHandle> {
        self.state.lock().registry.find_by_name(name)
    }

    /// Address of an entry point
    pub fn resolve_entry(&self, handle: ModuleHandle, ordinal: u16) -> Result<FarPtr, EntryError> {
        self.state.lock().resolve_entry(handle, ordinal)
    }

    /// Rewrite the offset of an existing entry point
    pub fn patch_entry(&self, handle: ModuleHandle, ordinal: u16, offset: u16) -> bool {
        self.state.lock().patch_entry(handle, ordinal, offset)
    }

    /// Ordinal of an exported name (`#nnn` is taken as a number)
    pub fn get_ordinal(&self, handle: ModuleHandle, name: &str) -> Result<u16, EntryError> {
        self.state.lock().get_ordinal(handle, name)
    }

    /// Address of an export given by name or `#ordinal`
    pub fn get_proc_address(&self, handle: ModuleHandle, name: &str) -> Result<FarPtr, EntryError> {
        self.state.lock().get_proc_address(handle, name)
    }

    fn with_view<T>(&self, handle: ModuleHandle, f: impl FnOnce(&ModuleView<'_>, ModuleState) -> T) -> LoadResult<T> {
        let state = self.state.lock();
        let view = state.view(handle)?;
        let module_state = state
            .registry
            .state(handle)
            .ok_or(LoadError::InvalidHandle(handle))?;
        Ok(f(&view, module_state))
    }

    /// Full description of a module
    pub fn module_info(&self, handle: ModuleHandle) -> LoadResult<ModuleInfo> {
        self.with_view(handle, |view, state| ModuleInfo::from_view(view, state))
    }

    /// Registered modules in load order
    pub fn walk_modules(&self) -> Vec<RegistryEntry> {
        self.state.lock().registry.iter().cloned().collect()
    }

    /// Usage count of a module
    pub fn usage(&self, handle: ModuleHandle) -> LoadResult<u16> {
        self.with_view(handle, |view, _| view.usage())
    }

    /// Module name
    pub fn module_name(&self, handle: ModuleHandle) -> LoadResult<String> {
        self.with_view(handle, |view, _| view.name())
    }

    /// File a module was loaded from
    pub fn file_name(&self, handle: ModuleHandle) -> LoadResult<Option<String>> {
        self.with_view(handle, |view, _| view.file_name())
    }

    /// Windows version a module expects
    pub fn expected_version(&self, handle: ModuleHandle) -> LoadResult<u16> {
        self.with_view(handle, |view, _| view.header().expected_version)
    }

    /// Lifecycle state of a module
    pub fn module_state(&self, handle: ModuleHandle) -> Option<ModuleState> {
        self.state.lock().registry.state(handle)
    }

    /// Modules initialized before `handle`, in append order
    pub fn init_list(&self, handle: ModuleHandle) -> LoadResult<Vec<ModuleHandle>> {
        self.with_view(handle, |view, _| view.init_list())
    }

    /// Arena statistics
    pub fn arena_info(&self) -> ArenaInfo {
        self.state.lock().arena.info()
    }

    /// Largest free run in the arena
    pub fn largest_free(&self) -> usize {
        self.state.lock().arena.largest_free()
    }

    /// Number of loaded modules
    pub fn module_count(&self) -> usize {
        self.state.lock().registry.len()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let count = state.registry.len();
        state.unload_all();
        info!(space = self.id.as_u64(), modules = count, "address space destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryOpener;
    use ne16_format::{EntrySpec, ImageBuilder, SegmentSpec};

    #[test]
    fn test_space_ids_are_unique() {
        let a = AddressSpaceId::new();
        let b = AddressSpaceId::new();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_module_info() {
        let opener = MemoryOpener::new();
        opener.insert(
            "TOOLS.DLL",
            ImageBuilder::new("TOOLS")
                .description("Tool helpers")
                .segment(SegmentSpec::code(vec![0xC3; 8]))
                .segment(SegmentSpec::data(vec![0; 4]))
                .entry(EntrySpec::Moveable { segment: 1, offset: 2 })
                .export("HELPER", 1)
                .build()
                .unwrap(),
        );
        let space = AddressSpace::new(
            LoaderConfig::default(),
            Box::new(opener),
            Box::new(StubSegmentHost::new()),
        )
        .unwrap();
        let handle = space.load_module("TOOLS.DLL", None).unwrap();

        let info = space.module_info(handle).unwrap();
        assert_eq!(info.name, "TOOLS");
        assert_eq!(info.state, ModuleState::Active);
        assert!(info.is_library);
        assert_eq!(info.segments.len(), 2);
        assert_eq!(info.entries.len(), 1);
        assert!(info.entries[0].moveable);
        assert_eq!(info.resident_names[1].name, "HELPER");
        assert_eq!(info.nonresident_names[0].name, "Tool helpers");
        assert_eq!(space.expected_version(handle).unwrap(), 0x030A);
    }

    #[test]
    fn test_spaces_are_isolated() {
        let opener = MemoryOpener::new();
        opener.insert(
            "A.DLL",
            ImageBuilder::new("A")
                .segment(SegmentSpec::code(vec![0; 4]))
                .build()
                .unwrap(),
        );
        let first = AddressSpace::new(
            LoaderConfig::default(),
            Box::new(opener.clone()),
            Box::new(StubSegmentHost::new()),
        )
        .unwrap();
        let second = AddressSpace::new(
            LoaderConfig::default(),
            Box::new(opener),
            Box::new(StubSegmentHost::new()),
        )
        .unwrap();
        first.load_module("A.DLL", None).unwrap();
        assert!(first.find_by_name("A").is_some());
        assert!(second.find_by_name("A").is_none());
    }
}
