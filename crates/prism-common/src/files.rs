//! Filesystem boundary used by the shader loader and the hot-reload poller.
//!
//! Everything that touches storage goes through [`FileSystem`] so that the
//! registry can be driven by the real disk or by an in-memory tree with a
//! manually advanced clock.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;

// ============================================================
// Trait
// ============================================================

/// Read-only access to shader sources plus modification times.
pub trait FileSystem: Send + Sync {
    /// Read a whole file as UTF-8 text.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Read a whole file as raw bytes.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Last modification time of a file.
    fn modified(&self, path: &Path) -> io::Result<SystemTime>;

    /// Whether the path names an existing file.
    fn exists(&self, path: &Path) -> bool {
        self.modified(path).is_ok()
    }
}

// ============================================================
// Disk implementation
// ============================================================

/// [`FileSystem`] backed by `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskFileSystem;

impl FileSystem for DiskFileSystem {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        fs::metadata(path)?.modified()
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

// ============================================================
// In-memory implementation
// ============================================================

#[derive(Debug, Clone)]
struct MemoryFile {
    contents: Vec<u8>,
    modified: SystemTime,
}

/// In-memory [`FileSystem`] with a logical clock.
///
/// Every write advances the clock by one second, so two writes to the same
/// path always produce distinct modification times. [`MemoryFileSystem::set_modified`]
/// pins a timestamp explicitly.
#[derive(Debug)]
pub struct MemoryFileSystem {
    files: RwLock<HashMap<PathBuf, MemoryFile>>,
    clock: RwLock<u64>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            clock: RwLock::new(0),
        }
    }

    fn tick(&self) -> SystemTime {
        let mut clock = self.clock.write();
        *clock += 1;
        SystemTime::UNIX_EPOCH + Duration::from_secs(*clock)
    }

    /// Create or overwrite a file, bumping its modification time.
    pub fn write(&self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) {
        let modified = self.tick();
        self.files.write().insert(
            normalize(path.as_ref()),
            MemoryFile {
                contents: contents.as_ref().to_vec(),
                modified,
            },
        );
    }

    /// Overwrite a file without touching its modification time.
    ///
    /// Mirrors editors that preserve timestamps; the poller must not notice.
    pub fn write_preserving_time(&self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) {
        if let Some(file) = self.files.write().get_mut(&normalize(path.as_ref())) {
            file.contents = contents.as_ref().to_vec();
            return;
        }
        self.write(path, contents);
    }

    /// Bump the modification time of an existing file.
    pub fn touch(&self, path: impl AsRef<Path>) -> bool {
        let modified = self.tick();
        match self.files.write().get_mut(&normalize(path.as_ref())) {
            Some(file) => {
                file.modified = modified;
                true
            }
            None => false,
        }
    }

    /// Pin the modification time of an existing file.
    pub fn set_modified(&self, path: impl AsRef<Path>, modified: SystemTime) -> bool {
        match self.files.write().get_mut(&normalize(path.as_ref())) {
            Some(file) => {
                file.modified = modified;
                true
            }
            None => false,
        }
    }

    /// Remove a file. Returns whether it existed.
    pub fn remove(&self, path: impl AsRef<Path>) -> bool {
        self.files.write().remove(&normalize(path.as_ref())).is_some()
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} not found", path.display()),
    )
}

impl FileSystem for MemoryFileSystem {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.files
            .read()
            .get(&normalize(path))
            .map(|f| f.contents.clone())
            .ok_or_else(|| not_found(path))
    }

    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        self.files
            .read()
            .get(&normalize(path))
            .map(|f| f.modified)
            .ok_or_else(|| not_found(path))
    }
}

/// Lexically normalize a path: drop `.` components and fold `..`.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ============================================================
// Search paths
// ============================================================

/// Ordered list of directories a relative path is resolved against.
///
/// Earlier entries have higher priority. Absolute paths and paths that
/// already exist as given are returned unchanged.
#[derive(Debug, Clone, Default)]
pub struct SearchPaths {
    dirs: Vec<PathBuf>,
}

impl SearchPaths {
    pub fn new() -> Self {
        Self { dirs: Vec::new() }
    }

    /// Append a directory at the lowest priority.
    pub fn push(&mut self, dir: impl Into<PathBuf>) {
        self.dirs.push(dir.into());
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Resolve `path` to the first candidate that exists in `fs`.
    ///
    /// When nothing matches the path is joined onto the first search
    /// directory (or returned as-is with no directories), so that the
    /// subsequent read produces a meaningful "not found" error.
    pub fn resolve(&self, fs: &dyn FileSystem, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return normalize(path);
        }
        for dir in &self.dirs {
            let candidate = normalize(&dir.join(path));
            if fs.exists(&candidate) {
                return candidate;
            }
        }
        if fs.exists(path) {
            return normalize(path);
        }
        match self.dirs.first() {
            Some(dir) => normalize(&dir.join(path)),
            None => normalize(path),
        }
    }
}

impl<P: Into<PathBuf>> FromIterator<P> for SearchPaths {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        Self {
            dirs: iter.into_iter().map(Into::into).collect(),
        }
    }
}

// ============================================================
// Tests
// ============================================================
