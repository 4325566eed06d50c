//! In-memory storage backend
//!
//! Path-keyed files and directories with a slab of open-file handles.
//! Ephemeral by design; it exists so the kernel and its tests can run
//! without a card in the slot.

use super::{DirEntry, StorageFs};
use slab::Slab;
use std::collections::HashMap;
use std::io;

enum Node {
    File(Vec<u8>),
    Directory,
}

struct OpenFile {
    path: String,
    position: usize,
    writable: bool,
}

/// In-memory filesystem.
pub struct RamDisk {
    nodes: HashMap<String, Node>,
    handles: Slab<OpenFile>,
}

impl RamDisk {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::Directory);
        Self {
            nodes,
            handles: Slab::new(),
        }
    }

    /// Ensure a leading slash and resolve `.` / `..` components.
    fn normalize(path: &str) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for component in path.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                name => parts.push(name),
            }
        }
        if parts.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", parts.join("/"))
        }
    }

    fn parent(path: &str) -> String {
        match path.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(i) => path[..i].to_string(),
        }
    }

    fn parent_is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.get(&Self::parent(path)), Some(Node::Directory))
    }

    fn open_file(&self, handle: usize) -> io::Result<&OpenFile> {
        self.handles
            .get(handle)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "bad storage handle"))
    }
}

impl Default for RamDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageFs for RamDisk {
    fn mount(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn open(&mut self, path: &str, write: bool) -> io::Result<usize> {
        let path = Self::normalize(path);
        match self.nodes.get(&path) {
            Some(Node::Directory) => {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "is a directory"));
            }
            Some(Node::File(_)) => {}
            None if write => {
                if !self.parent_is_dir(&path) {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        "parent directory missing",
                    ));
                }
                self.nodes.insert(path.clone(), Node::File(Vec::new()));
            }
            None => return Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }

        let len = match self.nodes.get(&path) {
            Some(Node::File(data)) => data.len(),
            _ => 0,
        };
        let position = if write { len } else { 0 };
        Ok(self.handles.insert(OpenFile {
            path,
            position,
            writable: write,
        }))
    }

    fn close(&mut self, handle: usize) -> io::Result<()> {
        if self.handles.contains(handle) {
            self.handles.remove(handle);
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, "bad storage handle"))
        }
    }

    fn read(&mut self, handle: usize, buf: &mut [u8]) -> io::Result<usize> {
        let (path, position) = {
            let open = self.open_file(handle)?;
            (open.path.clone(), open.position)
        };
        let data = match self.nodes.get(&path) {
            Some(Node::File(data)) => data,
            _ => return Err(io::Error::new(io::ErrorKind::NotFound, "file vanished")),
        };

        let remaining = data.len().saturating_sub(position);
        let n = buf.len().min(remaining);
        buf[..n].copy_from_slice(&data[position..position + n]);
        self.handles[handle].position += n;
        Ok(n)
    }

    fn write(&mut self, handle: usize, buf: &[u8]) -> io::Result<usize> {
        let (path, position, writable) = {
            let open = self.open_file(handle)?;
            (open.path.clone(), open.position, open.writable)
        };
        if !writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "opened read-only",
            ));
        }
        let data = match self.nodes.get_mut(&path) {
            Some(Node::File(data)) => data,
            _ => return Err(io::Error::new(io::ErrorKind::NotFound, "file vanished")),
        };

        if position + buf.len() > data.len() {
            data.resize(position + buf.len(), 0);
        }
        data[position..position + buf.len()].copy_from_slice(buf);
        self.handles[handle].position += buf.len();
        Ok(buf.len())
    }

    fn size(&self, handle: usize) -> io::Result<u64> {
        let open = self.open_file(handle)?;
        match self.nodes.get(&open.path) {
            Some(Node::File(data)) => Ok(data.len() as u64),
            _ => Err(io::Error::new(io::ErrorKind::NotFound, "file vanished")),
        }
    }

    fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(&Self::normalize(path))
    }

    fn remove_file(&mut self, path: &str) -> io::Result<()> {
        let path = Self::normalize(path);
        match self.nodes.get(&path) {
            Some(Node::File(_)) => {
                self.nodes.remove(&path);
                Ok(())
            }
            Some(Node::Directory) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "is a directory",
            )),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }

    fn create_dir(&mut self, path: &str) -> io::Result<()> {
        let path = Self::normalize(path);
        if self.nodes.contains_key(&path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "path already exists",
            ));
        }
        if !self.parent_is_dir(&path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "parent directory missing",
            ));
        }
        self.nodes.insert(path, Node::Directory);
        Ok(())
    }

    fn remove_dir(&mut self, path: &str) -> io::Result<()> {
        let path = Self::normalize(path);
        match self.nodes.get(&path) {
            Some(Node::Directory) => {}
            Some(Node::File(_)) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "not a directory",
                ));
            }
            None => return Err(io::Error::new(io::ErrorKind::NotFound, "no such directory")),
        }
        if path == "/" {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot remove root"));
        }

        let prefix = format!("{path}/");
        if self.nodes.keys().any(|k| k.starts_with(&prefix)) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "directory not empty",
            ));
        }
        self.nodes.remove(&path);
        Ok(())
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let path = Self::normalize(path);
        match self.nodes.get(&path) {
            Some(Node::Directory) => {}
            Some(Node::File(_)) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "not a directory",
                ));
            }
            None => return Err(io::Error::new(io::ErrorKind::NotFound, "no such directory")),
        }

        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let mut entries: Vec<DirEntry> = self
            .nodes
            .iter()
            .filter(|(k, _)| {
                k.starts_with(&prefix) && *k != "/" && !k[prefix.len()..].contains('/')
            })
            .map(|(k, node)| DirEntry {
                name: k[prefix.len()..].to_string(),
                is_dir: matches!(node, Node::Directory),
                size: match node {
                    Node::File(data) => data.len() as u64,
                    Node::Directory => 0,
                },
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
