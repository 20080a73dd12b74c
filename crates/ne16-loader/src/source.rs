//! Image byte sources and module openers
//!
//! An [`ImageSource`] is anything the parser can read at an offset. A
//! [`ModuleOpener`] turns a module name into a source; the loader asks it for
//! builtin and native modules before falling back to opening a file.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

/// Random-access bytes of one image
pub trait ImageSource: Send {
    /// Total length in bytes
    fn len(&self) -> u64;

    /// Whether the source is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `buf` from `offset`
    ///
    /// A read past the end fails with [`io::ErrorKind::UnexpectedEof`].
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

/// An image held in memory
#[derive(Debug, Clone)]
pub struct MemoryImage {
    bytes: Arc<[u8]>,
}

impl MemoryImage {
    /// Wrap image bytes
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

impl ImageSource for MemoryImage {
    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset).map_err(|_| eof())?;
        let end = start.checked_add(buf.len()).ok_or_else(eof)?;
        let bytes = self.bytes.get(start..end).ok_or_else(eof)?;
        buf.copy_from_slice(bytes);
        Ok(())
    }
}

fn eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of image")
}

/// An image read from a file
#[derive(Debug)]
pub struct FileImage {
    file: File,
    len: u64,
}

impl FileImage {
    /// Open a file for reading
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl ImageSource for FileImage {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        if offset.saturating_add(buf.len() as u64) > self.len {
            return Err(eof());
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }
}

/// Reads from a source, serving ranges inside the fast-load area from a
/// pre-read copy
pub struct StagedReader<'a> {
    source: &'a mut dyn ImageSource,
    staged: Option<(u64, Vec<u8>)>,
    staged_reads: usize,
    direct_reads: usize,
}

impl<'a> StagedReader<'a> {
    /// Read directly from `source`
    pub fn new(source: &'a mut dyn ImageSource) -> Self {
        Self {
            source,
            staged: None,
            staged_reads: 0,
            direct_reads: 0,
        }
    }

    /// Pre-read `len` bytes at `offset`
    ///
    /// A failed pre-read leaves the reader on direct reads.
    pub fn stage(&mut self, offset: u64, len: usize) {
        let mut buf = vec![0u8; len];
        match self.source.read_exact_at(offset, &mut buf) {
            Ok(()) => {
                debug!(offset, len, "using fast-load area");
                self.staged = Some((offset, buf));
            }
            Err(e) => {
                warn!(offset, len, error = %e, "fast-load area unreadable, reading tables directly");
            }
        }
    }

    /// Whether a fast-load area is in use
    pub fn is_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// Reads served from the fast-load area
    pub fn staged_reads(&self) -> usize {
        self.staged_reads
    }

    /// Reads that went to the source
    pub fn direct_reads(&self) -> usize {
        self.direct_reads
    }

    /// Length of the underlying source
    pub fn len(&self) -> u64 {
        self.source.len()
    }

    /// Whether the underlying source is empty
    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    /// Fill `buf` from `offset`
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if let Some((start, data)) = &self.staged {
            if offset >= *start {
                let rel = (offset - start) as usize;
                if let Some(bytes) = rel
                    .checked_add(buf.len())
                    .and_then(|end| data.get(rel..end))
                {
                    buf.copy_from_slice(bytes);
                    self.staged_reads += 1;
                    return Ok(());
                }
            }
        }
        self.direct_reads += 1;
        self.source.read_exact_at(offset, buf)
    }

    /// Read `len` bytes at `offset` into a new buffer
    pub fn read_vec(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }
}

/// A source returned by a [`ModuleOpener`]
pub struct OpenedImage {
    /// The image bytes
    pub source: Box<dyn ImageSource>,
    /// Path or identifier recorded as the module's file name
    pub path: String,
}

impl OpenedImage {
    /// Wrap an in-memory image
    pub fn memory(path: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            source: Box::new(MemoryImage::new(bytes)),
            path: path.into(),
        }
    }
}

/// Locates module images by name
pub trait ModuleOpener: Send {
    /// Open the image for `name`, optionally looking in `search_hint` first
    fn open(&mut self, name: &str, search_hint: Option<&Path>) -> io::Result<OpenedImage>;

    /// Image of a module the host provides itself
    fn try_load_builtin(&mut self, _name: &str) -> Option<OpenedImage> {
        None
    }

    /// Image of a module backed by a native library
    fn try_load_native(&mut self, _name: &str) -> Option<OpenedImage> {
        None
    }
}

/// Final path component of a DOS or Unix style path
pub fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\', ':']).next().unwrap_or(name)
}

/// `name` without its extension
pub fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(dot) => &name[..dot],
        None => name,
    }
}

/// Whether the final path component of `name` has an extension
pub fn has_extension(name: &str) -> bool {
    base_name(name).contains('.')
}

/// Opens module files from a list of directories
#[derive(Debug, Clone, Default)]
pub struct SearchPathOpener {
    search_paths: Vec<PathBuf>,
}

impl SearchPathOpener {
    /// Search `search_paths` in order; an empty list means the current directory
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    fn candidates(&self, name: &str, search_hint: Option<&Path>) -> Vec<PathBuf> {
        let direct = Path::new(name);
        if direct.is_absolute() || name.contains(['/', '\\']) {
            return vec![direct.to_path_buf()];
        }
        let mut dirs: Vec<PathBuf> = if self.search_paths.is_empty() {
            vec![PathBuf::from(".")]
        } else {
            self.search_paths.clone()
        };
        if let Some(hint) = search_hint {
            dirs.push(hint.to_path_buf());
        }

        // Image names are case-insensitive; host file systems may not be
        let mut spellings = vec![name.to_string()];
        for spelling in [name.to_ascii_lowercase(), name.to_ascii_uppercase()] {
            if !spellings.contains(&spelling) {
                spellings.push(spelling);
            }
        }

        dirs.iter()
            .flat_map(|dir| spellings.iter().map(move |s| dir.join(s)))
            .collect()
    }
}

impl ModuleOpener for SearchPathOpener {
    fn open(&mut self, name: &str, search_hint: Option<&Path>) -> io::Result<OpenedImage> {
        for candidate in self.candidates(name, search_hint) {
            trace!(path = %candidate.display(), "probing");
            if candidate.is_file() {
                let image = FileImage::open(&candidate)?;
                return Ok(OpenedImage {
                    source: Box::new(image),
                    path: candidate.to_string_lossy().into_owned(),
                });
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{name} not found in search path"),
        ))
    }
}

#[derive(Default)]
struct MemoryOpenerInner {
    files: FxHashMap<String, Arc<[u8]>>,
    builtins: FxHashMap<String, Arc<[u8]>>,
    opens: FxHashMap<String, usize>,
}

impl MemoryOpenerInner {
    fn lookup<'m>(map: &'m FxHashMap<String, Arc<[u8]>>, name: &str) -> Option<(&'m String, &'m Arc<[u8]>)> {
        let key = base_name(name).to_ascii_uppercase();
        map.get_key_value(&key)
            .or_else(|| map.get_key_value(strip_extension(&key)))
    }
}

/// In-memory opener keyed by case-insensitive module file name
///
/// Clones share the same images and open counters, so a caller can keep one
/// clone to inspect how often each image was opened.
#[derive(Clone, Default)]
pub struct MemoryOpener {
    inner: Arc<Mutex<MemoryOpenerInner>>,
}

impl MemoryOpener {
    /// Create an empty opener
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image under `name`
    ///
    /// A name registered without an extension also answers requests that
    /// carry one, so `"B"` serves `"B.DLL"`.
    pub fn insert(&self, name: &str, bytes: impl Into<Arc<[u8]>>) {
        self.inner
            .lock()
            .files
            .insert(name.to_ascii_uppercase(), bytes.into());
    }

    /// Register an image served as a builtin module
    pub fn insert_builtin(&self, name: &str, bytes: impl Into<Arc<[u8]>>) {
        self.inner
            .lock()
            .builtins
            .insert(name.to_ascii_uppercase(), bytes.into());
    }

    /// Number of times the image registered under `name` was handed out
    pub fn open_count(&self, name: &str) -> usize {
        let key = name.to_ascii_uppercase();
        self.inner.lock().opens.get(&key).copied().unwrap_or(0)
    }
}

impl ModuleOpener for MemoryOpener {
    fn open(&mut self, name: &str, _search_hint: Option<&Path>) -> io::Result<OpenedImage> {
        let mut inner = self.inner.lock();
        let (key, bytes) = MemoryOpenerInner::lookup(&inner.files, name)
            .map(|(k, b)| (k.clone(), b.clone()))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))?;
        *inner.opens.entry(key.clone()).or_insert(0) += 1;
        Ok(OpenedImage::memory(key, bytes))
    }

    fn try_load_builtin(&mut self, name: &str) -> Option<OpenedImage> {
        let mut inner = self.inner.lock();
        let (key, bytes) = MemoryOpenerInner::lookup(&inner.builtins, name)
            .map(|(k, b)| (k.clone(), b.clone()))?;
        *inner.opens.entry(key.clone()).or_insert(0) += 1;
        Some(OpenedImage::memory(key, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_image_short_read() {
        let mut image = MemoryImage::new(vec![1u8, 2, 3, 4]);
        let mut buf = [0u8; 2];
        image.read_exact_at(2, &mut buf).unwrap();
        assert_eq!(buf, [3, 4]);
        let err = image.read_exact_at(3, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_staged_reader_serves_area() {
        let mut image = MemoryImage::new((0u8..=255).collect::<Vec<_>>());
        let mut reader = StagedReader::new(&mut image);
        reader.stage(16, 32);
        assert!(reader.is_staged());

        assert_eq!(reader.read_vec(20, 4).unwrap(), vec![20, 21, 22, 23]);
        assert_eq!(reader.read_vec(40, 16).unwrap()[0], 40);
        assert_eq!(reader.staged_reads(), 1);
        assert_eq!(reader.direct_reads(), 1);
    }

    #[test]
    fn test_staged_reader_falls_back() {
        let mut image = MemoryImage::new(vec![0u8; 64]);
        let mut reader = StagedReader::new(&mut image);
        reader.stage(48, 64);
        assert!(!reader.is_staged());
        assert_eq!(reader.read_vec(0, 8).unwrap().len(), 8);
    }

    #[test]
    fn test_name_helpers() {
        assert_eq!(base_name("C:\\WINDOWS\\SYSTEM\\USER.EXE"), "USER.EXE");
        assert_eq!(base_name("lib/gdi.exe"), "gdi.exe");
        assert_eq!(base_name("KERNEL"), "KERNEL");
        assert_eq!(strip_extension("USER.EXE"), "USER");
        assert!(has_extension("a/b.dll"));
        assert!(!has_extension("dir.d/b"));
    }

    #[test]
    fn test_memory_opener_counts_opens() {
        let opener = MemoryOpener::new();
        opener.insert("b", vec![1u8, 2, 3]);
        let mut handle = opener.clone();
        let opened = handle.open("B.DLL", None).unwrap();
        assert_eq!(opened.source.len(), 3);
        assert!(handle.open("C.DLL", None).is_err());
        assert_eq!(opener.open_count("B"), 1);
        assert!(handle.try_load_builtin("B").is_none());
    }

    #[test]
    fn test_search_path_opener() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mod.dll"), [9u8; 10]).unwrap();
        let mut opener = SearchPathOpener::new(vec![dir.path().to_path_buf()]);
        let opened = opener.open("MOD.DLL", None).unwrap();
        assert_eq!(opened.source.len(), 10);
        assert!(opened.path.ends_with("mod.dll"));
        assert!(opener.open("OTHER.DLL", None).is_err());

        let mut hinted = SearchPathOpener::new(vec![PathBuf::from("/nonexistent")]);
        assert!(hinted.open("mod.dll", Some(dir.path())).is_ok());
    }
}
