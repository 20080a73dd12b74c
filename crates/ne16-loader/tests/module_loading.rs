//! End-to-end loading through an address space

use std::path::Path;
use std::sync::Arc;

use ne16_format::{EntrySpec, ImageBuilder, SegmentSpec};
use ne16_loader::{
    AddressSpace, EntryError, FarPtr, FixupContext, HostError, LoadError, LoadErrorKind,
    LoaderConfig, MemoryOpener, ModuleState, ModuleView, SegmentHost, SegmentTableMut,
    StubSegmentHost, CONSTANT_SELECTOR,
};
use parking_lot::Mutex;

fn space(opener: &MemoryOpener, host: &StubSegmentHost) -> AddressSpace {
    AddressSpace::new(
        LoaderConfig::default(),
        Box::new(opener.clone()),
        Box::new(host.clone()),
    )
    .unwrap()
}

fn library(name: &str, refs: &[&str]) -> Vec<u8> {
    let mut builder = ImageBuilder::new(name)
        .segment(SegmentSpec::code(vec![0x90; 16]))
        .entry(EntrySpec::Fixed { segment: 1, offset: 0 });
    for r in refs {
        builder = builder.reference(*r);
    }
    builder.build().unwrap()
}

#[test]
fn test_two_segment_module_with_reference() {
    let opener = MemoryOpener::new();
    let host = StubSegmentHost::new();
    opener.insert(
        "A.DLL",
        ImageBuilder::new("A")
            .segment(SegmentSpec::code(vec![0xC3; 64]))
            .segment(SegmentSpec::data(vec![0; 16]))
            .reference("B")
            .entry(EntrySpec::Moveable { segment: 1, offset: 0x20 })
            .build()
            .unwrap(),
    );
    opener.insert("B.DLL", library("B", &[]));
    let space = space(&opener, &host);

    let a = space.load_module("A.DLL", None).unwrap();
    let b = space.find_by_name("B").unwrap();
    let info = space.module_info(a).unwrap();
    let selector = info.segments[0].selector;
    assert_ne!(selector, 0);

    assert_eq!(space.resolve_entry(a, 1).unwrap(), FarPtr::new(selector, 0x20));
    assert_eq!(space.resolve_entry(a, 2), Err(EntryError::NotFound { ordinal: 2 }));
    assert_eq!(space.resolve_entry(a, 0), Err(EntryError::NotFound { ordinal: 0 }));

    assert_eq!(info.references[0].resolved, Some(b));
    assert_eq!(space.init_list(a).unwrap(), vec![b]);
    assert_eq!(space.module_state(a), Some(ModuleState::Active));
    assert_eq!(space.module_state(b), Some(ModuleState::Active));
    // Dependencies first
    assert_eq!(host.initialized(), vec!["B".to_string(), "A".to_string()]);
}

#[test]
fn test_loading_twice_parses_once() {
    let opener = MemoryOpener::new();
    let host = StubSegmentHost::new();
    opener.insert("A.DLL", library("A", &[]));
    let space = space(&opener, &host);

    let first = space.load_module("A.DLL", None).unwrap();
    assert_eq!(space.usage(first).unwrap(), 1);
    let second = space.load_module("a.dll", None).unwrap();
    let third = space.load_module("A", None).unwrap();
    assert_eq!(first, second);
    assert_eq!(first, third);
    assert_eq!(space.usage(first).unwrap(), 3);
    assert_eq!(opener.open_count("A.DLL"), 1);
    assert_eq!(host.initialized().len(), 1);
}

#[test]
fn test_same_module_under_another_file_name() {
    let opener = MemoryOpener::new();
    let host = StubSegmentHost::new();
    let image = library("SHARED", &[]);
    opener.insert("SHARED.DLL", image.clone());
    opener.insert("ALIAS.DLL", image);
    let space = space(&opener, &host);

    let shared = space.load_module("SHARED.DLL", None).unwrap();
    let blocks = space.arena_info().blocks_in_use;
    let alias = space.load_module("ALIAS.DLL", None).unwrap();
    assert_eq!(shared, alias);
    assert_eq!(space.usage(shared).unwrap(), 2);
    assert_eq!(space.module_count(), 1);
    assert_eq!(space.arena_info().blocks_in_use, blocks);
}

#[test]
fn test_two_module_cycle() {
    let opener = MemoryOpener::new();
    let host = StubSegmentHost::new();
    opener.insert("A.DLL", library("A", &["B"]));
    opener.insert("B.DLL", library("B", &["A"]));
    let space = space(&opener, &host);

    let a = space.load_module("A.DLL", None).unwrap();
    let b = space.find_by_name("B").unwrap();
    assert_eq!(opener.open_count("A.DLL"), 1);
    assert_eq!(opener.open_count("B.DLL"), 1);
    assert_eq!(space.init_list(a).unwrap(), vec![b]);
    assert_eq!(space.init_list(b).unwrap(), vec![a]);
    assert_eq!(space.usage(a).unwrap(), 1);
    assert_eq!(space.usage(b).unwrap(), 1);

    let mut initialized = host.initialized();
    initialized.sort();
    assert_eq!(initialized, vec!["A".to_string(), "B".to_string()]);
    assert_eq!(space.module_state(b), Some(ModuleState::Active));
}

#[test]
fn test_initialization_order_follows_declaration() {
    let opener = MemoryOpener::new();
    let host = StubSegmentHost::new();
    opener.insert("APP.DLL", library("APP", &["C", "D"]));
    opener.insert("C.DLL", library("C", &["E"]));
    opener.insert("D.DLL", library("D", &["E"]));
    opener.insert("E.DLL", library("E", &[]));
    let space = space(&opener, &host);

    space.load_module("APP.DLL", None).unwrap();
    assert_eq!(host.initialized(), vec!["E", "C", "D", "APP"]);
    let e = space.find_by_name("E").unwrap();
    // Referenced by C and D
    assert_eq!(space.usage(e).unwrap(), 2);
}

#[test]
fn test_missing_dependency_aborts_load() {
    let opener = MemoryOpener::new();
    let host = StubSegmentHost::new();
    opener.insert("A.DLL", library("A", &["B"]));
    opener.insert("B.DLL", library("B", &["NOWHERE"]));
    let space = space(&opener, &host);

    let err = space.load_module("A.DLL", None).unwrap_err();
    assert_eq!(err.kind(), LoadErrorKind::Dependency);
    assert_eq!(err.root_cause().kind(), LoadErrorKind::NotFound);
    assert!(matches!(err.root_cause(), LoadError::NotFound(name) if name == "NOWHERE.DLL"));
    assert_eq!(space.module_count(), 0);
    assert_eq!(space.arena_info().blocks_in_use, 0);
    assert!(host.initialized().is_empty());
}

#[test]
fn test_wrong_architecture_is_distinct() {
    let opener = MemoryOpener::new();
    let host = StubSegmentHost::new();
    opener.insert(
        "FLAT.DLL",
        ImageBuilder::new("FLAT")
            .signature(ne16_format::header::PE_SIGNATURE)
            .build()
            .unwrap(),
    );
    let space = space(&opener, &host);
    let err = space.load_module("FLAT.DLL", None).unwrap_err();
    assert_eq!(err.kind(), LoadErrorKind::WrongArchitecture);
    assert_eq!(space.load_module("NONE.DLL", None).unwrap_err().kind(), LoadErrorKind::NotFound);
}

#[test]
fn test_host_failure_discards_modules() {
    let opener = MemoryOpener::new();
    let host = StubSegmentHost::new();
    opener.insert("A.DLL", library("A", &["B"]));
    opener.insert("B.DLL", library("B", &[]));
    host.fail_initialize("B");
    let space = space(&opener, &host);

    let err = space.load_module("A.DLL", None).unwrap_err();
    assert_eq!(err.kind(), LoadErrorKind::Host);
    assert_eq!(space.module_count(), 0);
    let mut released = host.released();
    released.sort();
    assert_eq!(released, vec!["A".to_string(), "B".to_string()]);
}

#[test]
fn test_free_module_cascades() {
    let opener = MemoryOpener::new();
    let host = StubSegmentHost::new();
    opener.insert("A.DLL", library("A", &["B"]));
    opener.insert("B.DLL", library("B", &["A"]));
    opener.insert("C.DLL", library("C", &["B"]));
    let space = space(&opener, &host);

    let a = space.load_module("A.DLL", None).unwrap();
    let c = space.load_module("C.DLL", None).unwrap();
    let b = space.find_by_name("B").unwrap();
    assert_eq!(space.usage(b).unwrap(), 2);

    assert_eq!(space.free_module(a).unwrap(), 0);
    assert!(space.find_by_name("A").is_none());
    assert_eq!(space.usage(b).unwrap(), 1);

    space.free_module(c).unwrap();
    assert_eq!(space.module_count(), 0);
    assert_eq!(space.arena_info().blocks_in_use, 0);
    assert!(matches!(space.free_module(c), Err(LoadError::InvalidHandle(_))));
}

#[test]
fn test_unloaded_partner_does_not_reach_reused_record() {
    let opener = MemoryOpener::new();
    let host = StubSegmentHost::new();
    opener.insert("A.DLL", library("A", &["B"]));
    opener.insert("B.DLL", library("B", &["A"]));
    opener.insert("C.DLL", library("C", &[]));
    let space = space(&opener, &host);

    let a = space.load_module("A.DLL", None).unwrap();
    let b = space.load_module("B.DLL", None).unwrap();
    assert_eq!(space.usage(b).unwrap(), 2);
    assert_eq!(space.free_module(a).unwrap(), 0);
    assert_eq!(space.usage(b).unwrap(), 1);

    // C lands in the block A occupied; B's reference slot still names A
    let c = space.load_module("C.DLL", None).unwrap();
    assert_eq!(c.ptr(), a.ptr());
    assert_ne!(c, a);

    assert_eq!(space.free_module(b).unwrap(), 0);
    assert_eq!(space.find_by_name("C"), Some(c));
    assert_eq!(space.usage(c).unwrap(), 1);
    assert_eq!(space.module_state(c), Some(ModuleState::Active));
}

#[test]
fn test_freed_handle_is_rejected_after_reuse() {
    let opener = MemoryOpener::new();
    let host = StubSegmentHost::new();
    opener.insert("A.DLL", library("A", &[]));
    opener.insert("C.DLL", library("C", &[]));
    let space = space(&opener, &host);

    let a = space.load_module("A.DLL", None).unwrap();
    space.free_module(a).unwrap();
    let c = space.load_module("C.DLL", None).unwrap();
    assert_eq!(c.ptr(), a.ptr());

    assert!(matches!(space.usage(a), Err(LoadError::InvalidHandle(h)) if h == a));
    assert!(matches!(space.free_module(a), Err(LoadError::InvalidHandle(_))));
    assert_eq!(space.resolve_entry(a, 1), Err(EntryError::InvalidHandle(a)));
    assert!(!space.patch_entry(a, 1, 0x10));
    assert_eq!(space.module_state(a), None);
    assert_eq!(space.usage(c).unwrap(), 1);
}

#[test]
fn test_survivor_references_after_partial_unload() {
    let opener = MemoryOpener::new();
    let host = StubSegmentHost::new();
    opener.insert("A.DLL", library("A", &["B"]));
    opener.insert("B.DLL", library("B", &[]));
    opener.insert("C.DLL", library("C", &["B"]));
    let space = space(&opener, &host);

    let a = space.load_module("A.DLL", None).unwrap();
    let c = space.load_module("C.DLL", None).unwrap();
    let b = space.find_by_name("B").unwrap();
    space.free_module(a).unwrap();

    let info = space.module_info(c).unwrap();
    assert_eq!(info.references[0].resolved, Some(b));
    assert_eq!(space.usage(b).unwrap(), 1);
    assert!(space.resolve_entry(b, 1).is_ok());

    // A fresh A resolves to the surviving B
    let again = space.load_module("A.DLL", None).unwrap();
    assert_ne!(again, a);
    assert_eq!(space.module_info(again).unwrap().references[0].resolved, Some(b));
    assert_eq!(space.usage(b).unwrap(), 2);
}

/// Resolves its imports through the fixup context while the space is locked
#[derive(Clone, Default)]
struct ImportingHost {
    stub: StubSegmentHost,
    imports: Arc<Mutex<Vec<(String, Option<FarPtr>)>>>,
}

impl SegmentHost for ImportingHost {
    fn load_segments(&mut self, segments: &mut SegmentTableMut) -> Result<(), HostError> {
        self.stub.load_segments(segments)
    }

    fn apply_fixups(&mut self, module: &ModuleView<'_>, ctx: &FixupContext<'_>) -> Result<(), HostError> {
        for (index, reference) in module.modrefs().iter().enumerate() {
            let name = format!("{}PROC", reference.name);
            let address = ctx.resolve_import_by_name(index, &name);
            self.imports.lock().push((name, address));
        }
        self.stub.apply_fixups(module, ctx)
    }

    fn initialize(&mut self, module: &ModuleView<'_>) -> Result<(), HostError> {
        self.stub.initialize(module)
    }
}

#[test]
fn test_host_resolves_imports_through_fixup_context() {
    let opener = MemoryOpener::new();
    opener.insert("A.DLL", library("A", &["B"]));
    opener.insert(
        "B.DLL",
        ImageBuilder::new("B")
            .segment(SegmentSpec::code(vec![0x90; 16]))
            .entry(EntrySpec::Fixed { segment: 1, offset: 6 })
            .export("BPROC", 1)
            .build()
            .unwrap(),
    );
    let host = ImportingHost::default();
    let space = AddressSpace::new(
        LoaderConfig::default(),
        Box::new(opener),
        Box::new(host.clone()),
    )
    .unwrap();

    space.load_module("A.DLL", None).unwrap();
    let b = space.find_by_name("B").unwrap();
    let imports = host.imports.lock().clone();
    assert_eq!(imports.len(), 1);
    assert_eq!(imports[0].0, "BPROC");
    assert_eq!(imports[0].1, Some(space.resolve_entry(b, 1).unwrap()));
    assert_eq!(imports[0].1.map(|p| p.offset), Some(6));
}

#[test]
fn test_builtin_source_and_constant_entries() {
    let opener = MemoryOpener::new();
    let host = StubSegmentHost::new();
    opener.insert_builtin(
        "KERNEL",
        ImageBuilder::new("KERNEL")
            .segment(SegmentSpec::code(vec![0; 8]))
            .entry(EntrySpec::Fixed {
                segment: ne16_format::CONSTANT_SEGMENT,
                offset: 0x0F00,
            })
            .export("__WINFLAGS", 1)
            .build()
            .unwrap(),
    );
    let space = space(&opener, &host);
    let kernel = space.load_module("KERNEL", None).unwrap();
    assert!(space.module_info(kernel).unwrap().is_builtin);
    assert_eq!(
        space.get_proc_address(kernel, "__WinFlags").unwrap(),
        FarPtr::new(CONSTANT_SELECTOR, 0x0F00)
    );
}

#[test]
fn test_load_from_search_path() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("main.dll"), library("MAIN", &["HELPER"])).unwrap();
    let helpers = dir.path().join("helpers");
    std::fs::create_dir(&helpers).unwrap();
    std::fs::write(helpers.join("helper.dll"), library("HELPER", &[])).unwrap();

    let config = LoaderConfig {
        search_paths: vec![dir.path().to_path_buf()],
        ..Default::default()
    };

    // HELPER is only reachable through the hint directory
    let space = AddressSpace::with_defaults(config.clone()).unwrap();
    let err = space.load_module("MAIN.DLL", None).unwrap_err();
    assert_eq!(err.root_cause().kind(), LoadErrorKind::NotFound);

    let config = LoaderConfig {
        search_paths: vec![dir.path().to_path_buf(), helpers.clone()],
        ..config
    };
    let space = AddressSpace::with_defaults(config).unwrap();
    let main = space.load_module("MAIN.DLL", None).unwrap();
    let file = space.file_name(main).unwrap().unwrap();
    assert!(Path::new(&file).ends_with("main.dll"));
    assert_eq!(space.module_name(main).unwrap(), "MAIN");
    assert_eq!(space.find_by_name("helper.dll"), space.find_by_name("HELPER"));
    assert_eq!(space.walk_modules().len(), 2);
}

#[test]
fn test_dependency_found_next_to_requester() {
    let dir = tempfile::tempdir().unwrap();
    let app_dir = dir.path().join("app");
    std::fs::create_dir(&app_dir).unwrap();
    std::fs::write(app_dir.join("main.dll"), library("MAIN", &["SIDE"])).unwrap();
    std::fs::write(app_dir.join("side.dll"), library("SIDE", &[])).unwrap();

    let config = LoaderConfig {
        search_paths: vec![dir.path().to_path_buf()],
        ..Default::default()
    };
    let space = AddressSpace::with_defaults(config).unwrap();
    space.load_module("main.dll", Some(&app_dir)).unwrap();
    assert!(space.find_by_name("SIDE").is_some());
}
