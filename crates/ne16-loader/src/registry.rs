//! Module registry
//!
//! Tracks every module record of one address space in load order, together
//! with its lifecycle state. Names are unique case-insensitively.

use std::collections::BTreeMap;
use std::fmt;

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::record::ModuleHandle;
use crate::source::{base_name, strip_extension};

/// Lifecycle of a module
///
/// States only move forward. A module has no entry until its record is
/// built, so the first state is `HeaderParsed`. It becomes visible to name
/// lookups there, before its own references are resolved, which is what lets
/// a dependency cycle resolve to the in-progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ModuleState {
    /// Record built and registered
    HeaderParsed,
    /// References being resolved
    ResolvingDependencies,
    /// Host has loaded the segments
    SegmentsLoaded,
    /// Host has applied relocations
    FixedUp,
    /// Initialization has run
    Initialized,
    /// Fully loaded
    Active,
}

impl ModuleState {
    /// Whether entry points may be resolved in this state
    pub fn has_segments(self) -> bool {
        self >= ModuleState::SegmentsLoaded
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::HeaderParsed => "header-parsed",
            ModuleState::ResolvingDependencies => "resolving-dependencies",
            ModuleState::SegmentsLoaded => "segments-loaded",
            ModuleState::FixedUp => "fixed-up",
            ModuleState::Initialized => "initialized",
            ModuleState::Active => "active",
        };
        f.write_str(name)
    }
}

/// One registered module
#[derive(Debug, Clone, Serialize)]
pub struct RegistryEntry {
    /// Record handle
    pub handle: ModuleHandle,
    /// Module name as stored in the image
    pub name: String,
    /// File the module was loaded from
    pub path: Option<String>,
    /// Lifecycle state
    pub state: ModuleState,
    /// Position in load order
    pub load_order: u64,
}

/// Registry of loaded modules
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    /// Entries by load order
    entries: BTreeMap<u64, RegistryEntry>,
    /// Uppercase module name -> load order
    by_name: FxHashMap<String, u64>,
    /// Handle -> load order
    by_handle: FxHashMap<ModuleHandle, u64>,
    next_order: u64,
}

impl ModuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered modules
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no module is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a module
    ///
    /// # Returns
    ///
    /// `Err` with the existing handle if a module of the same name is
    /// already registered.
    pub fn insert(
        &mut self,
        handle: ModuleHandle,
        name: &str,
        path: Option<String>,
        state: ModuleState,
    ) -> Result<u64, ModuleHandle> {
        let key = name.to_ascii_uppercase();
        if let Some(existing) = self.by_name.get(&key).and_then(|o| self.entries.get(o)) {
            return Err(existing.handle);
        }
        let load_order = self.next_order;
        self.next_order += 1;
        self.entries.insert(
            load_order,
            RegistryEntry {
                handle,
                name: name.to_string(),
                path,
                state,
                load_order,
            },
        );
        self.by_name.insert(key, load_order);
        self.by_handle.insert(handle, load_order);
        Ok(load_order)
    }

    /// Remove a module
    pub fn remove(&mut self, handle: ModuleHandle) -> Option<RegistryEntry> {
        let order = self.by_handle.remove(&handle)?;
        let entry = self.entries.remove(&order)?;
        self.by_name.remove(&entry.name.to_ascii_uppercase());
        Some(entry)
    }

    /// Whether `handle` is registered
    pub fn contains(&self, handle: ModuleHandle) -> bool {
        self.by_handle.contains_key(&handle)
    }

    /// Look up an entry by handle
    pub fn get(&self, handle: ModuleHandle) -> Option<&RegistryEntry> {
        self.by_handle
            .get(&handle)
            .and_then(|order| self.entries.get(order))
    }

    /// State of a registered module
    pub fn state(&self, handle: ModuleHandle) -> Option<ModuleState> {
        self.get(handle).map(|e| e.state)
    }

    /// Move a module forward to `state`
    ///
    /// Backward moves are ignored and return `false`.
    pub fn advance(&mut self, handle: ModuleHandle, state: ModuleState) -> bool {
        let Some(order) = self.by_handle.get(&handle) else {
            return false;
        };
        match self.entries.get_mut(order) {
            Some(entry) if state > entry.state => {
                entry.state = state;
                true
            }
            _ => false,
        }
    }

    /// Find a module by name
    ///
    /// Tries, in order: the module name (case-insensitive); the final
    /// component of `name` against the final component of each module's
    /// path; the final component of `name` without extension against module
    /// names.
    pub fn find_by_name(&self, name: &str) -> Option<ModuleHandle> {
        if name.is_empty() {
            return None;
        }
        let key = name.to_ascii_uppercase();
        if let Some(entry) = self.by_name.get(&key).and_then(|o| self.entries.get(o)) {
            return Some(entry.handle);
        }

        let base = base_name(name);
        if let Some(entry) = self.entries.values().find(|e| {
            e.path
                .as_deref()
                .is_some_and(|p| base_name(p).eq_ignore_ascii_case(base))
        }) {
            return Some(entry.handle);
        }

        let stem = strip_extension(base).to_ascii_uppercase();
        self.by_name
            .get(&stem)
            .and_then(|o| self.entries.get(o))
            .map(|e| e.handle)
    }

    /// Entries in load order
    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaPtr;

    fn handle(raw: u32) -> ModuleHandle {
        ModuleHandle::new(ArenaPtr::from_raw(raw), 1)
    }

    #[test]
    fn test_insert_and_dedup() {
        let mut registry = ModuleRegistry::new();
        registry
            .insert(handle(0x10), "KERNEL", None, ModuleState::Active)
            .unwrap();
        assert_eq!(
            registry.insert(handle(0x20), "kernel", None, ModuleState::HeaderParsed),
            Err(handle(0x10))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_find_by_name_tiers() {
        let mut registry = ModuleRegistry::new();
        registry
            .insert(
                handle(0x10),
                "USER",
                Some("C:\\WINDOWS\\SYSTEM\\USER.EXE".into()),
                ModuleState::Active,
            )
            .unwrap();
        registry
            .insert(handle(0x20), "GDI", Some("/w/gdi16.exe".into()), ModuleState::Active)
            .unwrap();

        assert_eq!(registry.find_by_name("user"), Some(handle(0x10)));
        assert_eq!(registry.find_by_name("GDI16.EXE"), Some(handle(0x20)));
        assert_eq!(registry.find_by_name("d:/other/user.exe"), Some(handle(0x10)));
        assert_eq!(registry.find_by_name("GDI.DLL"), Some(handle(0x20)));
        assert_eq!(registry.find_by_name("SHELL"), None);
        assert_eq!(registry.find_by_name(""), None);
    }

    #[test]
    fn test_states_only_advance() {
        let mut registry = ModuleRegistry::new();
        let h = handle(0x10);
        registry
            .insert(h, "A", None, ModuleState::HeaderParsed)
            .unwrap();
        assert!(registry.advance(h, ModuleState::ResolvingDependencies));
        assert!(!registry.advance(h, ModuleState::HeaderParsed));
        assert_eq!(registry.state(h), Some(ModuleState::ResolvingDependencies));
        assert!(!registry.advance(handle(0x99), ModuleState::Active));
    }

    #[test]
    fn test_load_order_and_remove() {
        let mut registry = ModuleRegistry::new();
        for (i, name) in ["A", "B", "C"].iter().enumerate() {
            registry
                .insert(handle(0x10 * (i as u32 + 1)), name, None, ModuleState::Active)
                .unwrap();
        }
        let removed = registry.remove(handle(0x20)).unwrap();
        assert_eq!(removed.name, "B");
        assert!(registry.find_by_name("B").is_none());
        let names: Vec<_> = registry.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["A", "C"]);
        assert!(registry.remove(handle(0x20)).is_none());
    }

    #[test]
    fn test_reused_pointer_is_another_module() {
        let mut registry = ModuleRegistry::new();
        let old = ModuleHandle::new(ArenaPtr::from_raw(0x10), 1);
        let new = ModuleHandle::new(ArenaPtr::from_raw(0x10), 2);
        registry.insert(new, "C", None, ModuleState::Active).unwrap();
        assert!(!registry.contains(old));
        assert_eq!(registry.state(old), None);
        assert!(!registry.advance(old, ModuleState::Active));
        assert!(registry.remove(old).is_none());
        assert!(registry.contains(new));
    }
}
