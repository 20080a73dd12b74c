//! MZ and NE header layouts
//!
//! The MZ stub header is only consulted for its signature and the `e_lfanew`
//! pointer to the secondary header. The NE header is decoded field for field;
//! every table offset in it except `nrestab` is relative to the start of the
//! NE header itself.

use serde::{Deserialize, Serialize};

use crate::encoder::{ImageReader, ImageWriter};
use crate::{FormatError, FormatResult};

/// Size of the MZ stub header in bytes
pub const MZ_HEADER_SIZE: usize = 64;

/// Size of the NE header in bytes
pub const NE_HEADER_SIZE: usize = 64;

/// `MZ`
pub const MZ_SIGNATURE: u16 = 0x5A4D;
/// `NE`
pub const NE_SIGNATURE: u16 = 0x454E;
/// `PE` (first two bytes of `PE\0\0`)
pub const PE_SIGNATURE: u16 = 0x4550;
/// `LX`
pub const LX_SIGNATURE: u16 = 0x584C;
/// `LE`
pub const LE_SIGNATURE: u16 = 0x454C;

/// Offset of `e_lfanew` within the MZ header
const LFANEW_OFFSET: usize = 0x3C;

/// Module flag bits stored in `ne_flags`
pub mod flags {
    /// One shared data segment
    pub const SINGLEDATA: u16 = 0x0001;
    /// One data segment per instance
    pub const MULTIPLEDATA: u16 = 0x0002;
    /// Record was produced by a builtin provider (never set on disk)
    pub const BUILTIN: u16 = 0x0020;
    /// Module is a library rather than a task
    pub const LIBMODULE: u16 = 0x8000;
}

/// Bits of `ne_flagsothers`
pub mod other_flags {
    /// Long file names supported
    pub const LONG_FILENAMES: u8 = 0x01;
    /// Protected-mode fonts
    pub const PROTECTED_FONTS: u8 = 0x02;
    /// Proportional fonts
    pub const PROPORTIONAL_FONTS: u8 = 0x04;
    /// Image carries a fast-load (gangload) area
    pub const FASTLOAD: u8 = 0x08;
}

/// Target operating systems accepted by the loader
pub mod exe_type {
    /// Unknown; treated as Windows
    pub const UNKNOWN: u8 = 0;
    /// OS/2
    pub const OS2: u8 = 1;
    /// Windows
    pub const WINDOWS: u8 = 2;
    /// Windows/386 enhanced mode
    pub const WIN386: u8 = 4;
}

/// Classification of the secondary header signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    /// Legacy 16-bit segmented executable
    Segmented,
    /// Modern flat 32-bit executable
    Flat,
    /// Linear executable (LX or LE)
    Linear(u16),
    /// Anything else
    Unknown(u16),
}

/// Classify a 2-byte secondary header signature
pub fn classify_signature(magic: u16) -> Signature {
    match magic {
        NE_SIGNATURE => Signature::Segmented,
        PE_SIGNATURE => Signature::Flat,
        LX_SIGNATURE | LE_SIGNATURE => Signature::Linear(magic),
        other => Signature::Unknown(other),
    }
}

impl Signature {
    /// Turn a non-segmented signature into the matching error
    pub fn require_segmented(self) -> FormatResult<()> {
        match self {
            Signature::Segmented => Ok(()),
            Signature::Flat => Err(FormatError::WrongArchitecture),
            Signature::Linear(signature) => Err(FormatError::UnsupportedVariant { signature }),
            Signature::Unknown(found) => Err(FormatError::BadSignature { found }),
        }
    }
}

/// The parts of the MZ stub header the loader needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MzHeader {
    /// `e_magic`
    pub magic: u16,
    /// `e_lfanew`: file offset of the secondary header
    pub lfanew: u32,
}

impl MzHeader {
    /// Decode and validate the MZ header from the first 64 bytes of an image
    pub fn decode(bytes: &[u8]) -> FormatResult<Self> {
        let mut reader = ImageReader::new(bytes);
        let magic = reader.read_u16()?;
        if magic != MZ_SIGNATURE {
            return Err(FormatError::BadSignature { found: magic });
        }
        reader.seek(LFANEW_OFFSET);
        let lfanew = reader.read_u32()?;
        Ok(Self { magic, lfanew })
    }

    /// Encode a minimal MZ stub header pointing at `lfanew`
    pub fn encode(&self, writer: &mut ImageWriter) {
        let start = writer.offset();
        writer.emit_u16(self.magic);
        writer.pad_to(start + LFANEW_OFFSET);
        writer.emit_u32(self.lfanew);
        writer.pad_to(start + MZ_HEADER_SIZE);
    }
}

/// The 64-byte NE header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct NeHeader {
    pub magic: u16,
    pub ver: u8,
    pub rev: u8,
    /// Entry table offset
    pub enttab: u16,
    /// Entry table length in bytes
    pub cbenttab: u16,
    pub crc: u32,
    pub flags: u16,
    /// Segment number of the automatic data segment
    pub autodata: u16,
    pub heap: u16,
    pub stack: u16,
    pub csip: u32,
    pub sssp: u32,
    /// Number of segments
    pub cseg: u16,
    /// Number of module references
    pub cmod: u16,
    /// Non-resident name table length in bytes
    pub cbnrestab: u16,
    pub segtab: u16,
    pub rsrctab: u16,
    pub restab: u16,
    pub modtab: u16,
    pub imptab: u16,
    /// Non-resident name table offset, relative to the start of the file
    pub nrestab: u32,
    /// Number of moveable entries
    pub cmovent: u16,
    /// Alignment shift count for segment and resource data
    pub align: u16,
    pub cres: u16,
    pub exetyp: u8,
    pub flagsothers: u8,
    /// Fast-load area offset in alignment units
    pub pretthunks: u16,
    /// Fast-load area length in alignment units
    pub psegrefbytes: u16,
    pub swaparea: u16,
    /// Expected Windows version
    pub expver: u16,
}

impl NeHeader {
    /// Decode the NE header
    ///
    /// The signature is checked first so that foreign formats are reported
    /// with their own error kind, then the target OS byte.
    pub fn decode(bytes: &[u8], base: u64) -> FormatResult<Self> {
        let mut r = ImageReader::with_base(bytes, base);
        let magic = r.read_u16()?;
        classify_signature(magic).require_segmented()?;

        let header = Self {
            magic,
            ver: r.read_u8()?,
            rev: r.read_u8()?,
            enttab: r.read_u16()?,
            cbenttab: r.read_u16()?,
            crc: r.read_u32()?,
            flags: r.read_u16()?,
            autodata: r.read_u16()?,
            heap: r.read_u16()?,
            stack: r.read_u16()?,
            csip: r.read_u32()?,
            sssp: r.read_u32()?,
            cseg: r.read_u16()?,
            cmod: r.read_u16()?,
            cbnrestab: r.read_u16()?,
            segtab: r.read_u16()?,
            rsrctab: r.read_u16()?,
            restab: r.read_u16()?,
            modtab: r.read_u16()?,
            imptab: r.read_u16()?,
            nrestab: r.read_u32()?,
            cmovent: r.read_u16()?,
            align: r.read_u16()?,
            cres: r.read_u16()?,
            exetyp: r.read_u8()?,
            flagsothers: r.read_u8()?,
            pretthunks: r.read_u16()?,
            psegrefbytes: r.read_u16()?,
            swaparea: r.read_u16()?,
            expver: r.read_u16()?,
        };

        match header.exetyp {
            exe_type::UNKNOWN | exe_type::WINDOWS | exe_type::WIN386 => {}
            other => return Err(FormatError::UnsupportedTarget { exe_type: other }),
        }
        if header.align > 15 {
            return Err(FormatError::InvalidLayout("alignment shift out of range"));
        }
        Ok(header)
    }

    /// Encode the header (always exactly 64 bytes)
    pub fn encode(&self, w: &mut ImageWriter) {
        w.emit_u16(self.magic);
        w.emit_u8(self.ver);
        w.emit_u8(self.rev);
        w.emit_u16(self.enttab);
        w.emit_u16(self.cbenttab);
        w.emit_u32(self.crc);
        w.emit_u16(self.flags);
        w.emit_u16(self.autodata);
        w.emit_u16(self.heap);
        w.emit_u16(self.stack);
        w.emit_u32(self.csip);
        w.emit_u32(self.sssp);
        w.emit_u16(self.cseg);
        w.emit_u16(self.cmod);
        w.emit_u16(self.cbnrestab);
        w.emit_u16(self.segtab);
        w.emit_u16(self.rsrctab);
        w.emit_u16(self.restab);
        w.emit_u16(self.modtab);
        w.emit_u16(self.imptab);
        w.emit_u32(self.nrestab);
        w.emit_u16(self.cmovent);
        w.emit_u16(self.align);
        w.emit_u16(self.cres);
        w.emit_u8(self.exetyp);
        w.emit_u8(self.flagsothers);
        w.emit_u16(self.pretthunks);
        w.emit_u16(self.psegrefbytes);
        w.emit_u16(self.swaparea);
        w.emit_u16(self.expver);
    }

    /// Whether the module is a library
    pub fn is_library(&self) -> bool {
        self.flags & flags::LIBMODULE != 0
    }

    /// Whether a resource table is present
    pub fn has_resources(&self) -> bool {
        self.rsrctab < self.restab
    }

    /// Byte span of the resource table
    pub fn resource_len(&self) -> usize {
        if self.has_resources() {
            (self.restab - self.rsrctab) as usize
        } else {
            0
        }
    }

    /// Byte span of the resident-name table
    pub fn resident_names_len(&self) -> usize {
        self.modtab.saturating_sub(self.restab) as usize
    }

    /// Byte span of the imported-name table
    pub fn imported_names_len(&self) -> usize {
        self.enttab.saturating_sub(self.imptab) as usize
    }

    /// Absolute `(offset, len)` of the fast-load area, if the image declares one
    pub fn fast_load_area(&self) -> Option<(u64, usize)> {
        if self.flagsothers & other_flags::FASTLOAD == 0 || self.psegrefbytes == 0 {
            return None;
        }
        let offset = (self.pretthunks as u64) << self.align;
        let len = (self.psegrefbytes as usize) << self.align;
        Some((offset, len))
    }
}
