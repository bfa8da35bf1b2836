//! Virtual filesystem seam for the SCP engine.
//!
//! The engine never touches storage directly; it goes through [`Vfs`] so
//! the same state machine runs against flash, an SD card, or the
//! in-memory [`MemFs`] used by tests.  Handles are plain ids so the
//! session can hold them across ticks without borrowing the filesystem.

use std::collections::HashMap;

use crate::error::VfsError;

/// Open file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub u32);

/// Open directory iterator handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirId(pub u32);

/// Entry metadata returned by `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub is_dir: bool,
    pub size: u64,
    /// Octal permission bits (e.g. 0o644).
    pub mode: u16,
}

pub trait Vfs {
    fn stat(&self, path: &str) -> Result<Metadata, VfsError>;

    /// Open an existing file for reading.
    fn open(&mut self, path: &str) -> Result<FileId, VfsError>;

    /// Create (or truncate) a file for writing.
    fn create(&mut self, path: &str) -> Result<FileId, VfsError>;

    fn read(&mut self, file: FileId, buf: &mut [u8]) -> Result<usize, VfsError>;

    fn write(&mut self, file: FileId, data: &[u8]) -> Result<usize, VfsError>;

    fn close(&mut self, file: FileId);

    fn mkdir(&mut self, path: &str) -> Result<(), VfsError>;

    /// Open a directory for entry iteration.
    fn open_dir(&mut self, path: &str) -> Result<DirId, VfsError>;

    /// Next entry name, or `None` when exhausted.
    fn read_dir(&mut self, dir: DirId) -> Result<Option<String>, VfsError>;

    fn close_dir(&mut self, dir: DirId);
}

// ---------------------------------------------------------------------------
// In-memory filesystem for tests
// ---------------------------------------------------------------------------

enum Node {
    File(Vec<u8>),
    Dir,
}

struct OpenFile {
    path: String,
    pos: usize,
    writing: bool,
}

struct OpenDir {
    entries: Vec<String>,
    next: usize,
}

/// In-memory `Vfs` double.  Paths are plain strings; a directory exists
/// when a `Dir` node was created for it (the root `/` is implicit).
pub struct MemFs {
    nodes: HashMap<String, Node>,
    files: HashMap<u32, OpenFile>,
    dirs: HashMap<u32, OpenDir>,
    next_id: u32,
}

impl MemFs {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            files: HashMap::new(),
            dirs: HashMap::new(),
            next_id: 1,
        }
    }

    /// Seed a file with content.
    pub fn put_file(&mut self, path: &str, content: &[u8]) {
        self.nodes
            .insert(path.to_string(), Node::File(content.to_vec()));
    }

    /// Seed a directory.
    pub fn put_dir(&mut self, path: &str) {
        self.nodes.insert(path.to_string(), Node::Dir);
    }

    /// Content of a file, for assertions.
    pub fn file_content(&self, path: &str) -> Option<&[u8]> {
        match self.nodes.get(path) {
            Some(Node::File(data)) => Some(data),
            _ => None,
        }
    }

    pub fn has_dir(&self, path: &str) -> bool {
        matches!(self.nodes.get(path), Some(Node::Dir))
    }

    /// Count of leaked open handles, for stack-balance assertions.
    pub fn open_handles(&self) -> usize {
        self.files.len() + self.dirs.len()
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        };
        let mut names: Vec<String> = self
            .nodes
            .keys()
            .filter_map(|k| {
                let rest = k.strip_prefix(&prefix)?;
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect();
        names.sort();
        names
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs for MemFs {
    fn stat(&self, path: &str) -> Result<Metadata, VfsError> {
        if path == "/" {
            return Ok(Metadata {
                is_dir: true,
                size: 0,
                mode: 0o755,
            });
        }
        match self.nodes.get(path) {
            Some(Node::File(data)) => Ok(Metadata {
                is_dir: false,
                size: data.len() as u64,
                mode: 0o644,
            }),
            Some(Node::Dir) => Ok(Metadata {
                is_dir: true,
                size: 0,
                mode: 0o755,
            }),
            None => Err(VfsError::NotFound),
        }
    }

    fn open(&mut self, path: &str) -> Result<FileId, VfsError> {
        match self.nodes.get(path) {
            Some(Node::File(_)) => {
                let id = self.alloc_id();
                self.files.insert(
                    id,
                    OpenFile {
                        path: path.to_string(),
                        pos: 0,
                        writing: false,
                    },
                );
                Ok(FileId(id))
            }
            Some(Node::Dir) => Err(VfsError::NotAFile),
            None => Err(VfsError::NotFound),
        }
    }

    fn create(&mut self, path: &str) -> Result<FileId, VfsError> {
        if matches!(self.nodes.get(path), Some(Node::Dir)) {
            return Err(VfsError::NotAFile);
        }
        self.nodes.insert(path.to_string(), Node::File(Vec::new()));
        let id = self.alloc_id();
        self.files.insert(
            id,
            OpenFile {
                path: path.to_string(),
                pos: 0,
                writing: true,
            },
        );
        Ok(FileId(id))
    }

    fn read(&mut self, file: FileId, buf: &mut [u8]) -> Result<usize, VfsError> {
        let open = self.files.get_mut(&file.0).ok_or(VfsError::Io)?;
        if open.writing {
            return Err(VfsError::Io);
        }
        let Some(Node::File(data)) = self.nodes.get(&open.path) else {
            return Err(VfsError::NotFound);
        };
        let n = buf.len().min(data.len().saturating_sub(open.pos));
        buf[..n].copy_from_slice(&data[open.pos..open.pos + n]);
        open.pos += n;
        Ok(n)
    }

    fn write(&mut self, file: FileId, data: &[u8]) -> Result<usize, VfsError> {
        let open = self.files.get_mut(&file.0).ok_or(VfsError::Io)?;
        if !open.writing {
            return Err(VfsError::Io);
        }
        let Some(Node::File(content)) = self.nodes.get_mut(&open.path) else {
            return Err(VfsError::NotFound);
        };
        content.extend_from_slice(data);
        Ok(data.len())
    }

    fn close(&mut self, file: FileId) {
        self.files.remove(&file.0);
    }

    fn mkdir(&mut self, path: &str) -> Result<(), VfsError> {
        match self.nodes.get(path) {
            Some(Node::Dir) => Err(VfsError::AlreadyExists),
            Some(Node::File(_)) => Err(VfsError::NotADirectory),
            None => {
                self.nodes.insert(path.to_string(), Node::Dir);
                Ok(())
            }
        }
    }

    fn open_dir(&mut self, path: &str) -> Result<DirId, VfsError> {
        let is_dir = path == "/" || matches!(self.nodes.get(path), Some(Node::Dir));
        if !is_dir {
            return Err(VfsError::NotADirectory);
        }
        let entries = self.children_of(path);
        let id = self.alloc_id();
        self.dirs.insert(id, OpenDir { entries, next: 0 });
        Ok(DirId(id))
    }

    fn read_dir(&mut self, dir: DirId) -> Result<Option<String>, VfsError> {
        let open = self.dirs.get_mut(&dir.0).ok_or(VfsError::Io)?;
        if open.next >= open.entries.len() {
            return Ok(None);
        }
        let name = open.entries[open.next].clone();
        open.next += 1;
        Ok(Some(name))
    }

    fn close_dir(&mut self, dir: DirId) {
        self.dirs.remove(&dir.0);
    }
}
