//! NE Module Loader
//!
//! This crate loads 16-bit segmented modules into an address space:
//! - Paragraph arena that backs every module record
//! - Image parser that copies an image's tables into one record
//! - Module registry with case-insensitive lookup
//! - Dependency resolution with cycle tolerance and ordered initialization
//! - Entry-point resolution through the bundle-encoded entry table
//!
//! Segment memory, relocations and library startup belong to a
//! [`SegmentHost`]; finding images belongs to a [`ModuleOpener`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod arena;
pub mod config;
pub mod error;
pub mod host;
mod loader;
pub mod parser;
pub mod record;
pub mod registry;
pub mod source;
pub mod space;

pub use arena::{Arena, ArenaError, ArenaInfo, ArenaPtr, ArenaResult, BlockInfo};
pub use config::{ConfigError, LoaderConfig};
pub use error::{EntryError, LoadError, LoadErrorKind, LoadResult};
pub use host::{FarPtr, FixupContext, HostError, SegmentHost, SegmentTableMut, StubSegmentHost, CONSTANT_SELECTOR};
pub use parser::{parse_image, ParseOptions, ParsedModule};
pub use record::{ModuleHandle, ModuleRef, ModuleView, RuntimeSegment};
pub use registry::{ModuleRegistry, ModuleState, RegistryEntry};
pub use source::{FileImage, ImageSource, MemoryImage, MemoryOpener, ModuleOpener, OpenedImage, SearchPathOpener};
pub use space::{AddressSpace, AddressSpaceId, ModuleInfo};
