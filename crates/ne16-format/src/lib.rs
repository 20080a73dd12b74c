//! 16-bit Segmented Executable Format
//!
//! This crate describes the on-disk layout of legacy segmented (NE)
//! executables and libraries:
//! - MZ stub header and the offset to the secondary header
//! - NE header with its table offsets and counts
//! - Segment table entries
//! - Bundle-encoded entry tables
//! - Length-prefixed name tables
//!
//! It knows nothing about where records live at runtime; the loader crate
//! copies these tables into its own arena.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod builder;
pub mod encoder;
pub mod entry;
pub mod header;
pub mod names;
pub mod segment;

pub use builder::{EntrySpec, ImageBuilder, SegmentSpec};
pub use encoder::{ImageReader, ImageWriter};
pub use entry::{Bundle, BundleKind, Bundles, EntryPoint, CONSTANT_SEGMENT};
pub use header::{
    classify_signature, MzHeader, NeHeader, Signature, MZ_HEADER_SIZE, NE_HEADER_SIZE,
};
pub use names::{NameEntry, NameTable};
pub use segment::{SegmentEntry, SEGMENT_ENTRY_SIZE};

use thiserror::Error;

/// Errors produced while decoding an image
///
/// Each failure mode is its own variant so that a dispatcher can tell a
/// foreign-but-valid file apart from a corrupt one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// Primary or secondary header signature is not recognized
    #[error("Bad signature: {found:#06x}")]
    BadSignature {
        /// The 2-byte value that was found
        found: u16,
    },

    /// The secondary header describes a flat 32-bit image
    #[error("Image is a 32-bit flat executable")]
    WrongArchitecture,

    /// The secondary header describes a linear executable
    #[error("Unsupported linear executable variant ({signature:#06x})")]
    UnsupportedVariant {
        /// The 2-byte signature that was found
        signature: u16,
    },

    /// The image targets an operating system other than Windows
    #[error("Unsupported target operating system {exe_type:#04x}")]
    UnsupportedTarget {
        /// `ne_exetyp` from the header
        exe_type: u8,
    },

    /// A read ran past the end of the image
    #[error("Truncated image: {len} bytes at offset {offset:#x}")]
    Truncated {
        /// Offset of the failed read
        offset: u64,
        /// Number of bytes requested
        len: usize,
    },

    /// Header offsets or table contents are inconsistent
    #[error("Invalid layout: {0}")]
    InvalidLayout(&'static str),
}

/// Result alias for format decoding
pub type FormatResult<T> = Result<T, FormatError>;
