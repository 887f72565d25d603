use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Byte buffer backed by persistent/host storage, attached to the virtual
/// filesystem by reference. Rotation never copies these nodes; the same
/// buffer is re-attached to the next instance.
pub type SharedBytes = Arc<RwLock<Vec<u8>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsReason {
    NotFound,
    NotADirectory,
    IsADirectory,
    ParentMissing,
    DirNotEmpty,
    InvalidPath,
}

impl std::fmt::Display for FsReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsReason::NotFound => f.write_str("no such file or directory"),
            FsReason::NotADirectory => f.write_str("not a directory"),
            FsReason::IsADirectory => f.write_str("is a directory"),
            FsReason::ParentMissing => f.write_str("parent directory does not exist"),
            FsReason::DirNotEmpty => f.write_str("directory not empty"),
            FsReason::InvalidPath => f.write_str("invalid path"),
        }
    }
}

/// Uniform error for every virtual filesystem operation.
#[derive(Debug)]
pub struct FsError {
    pub op: &'static str,
    pub path: String,
    pub reason: FsReason,
}

impl FsError {
    fn new(op: &'static str, path: &str, reason: FsReason) -> Self {
        Self {
            op,
            path: path.to_string(),
            reason,
        }
    }
}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "filesystem operation failed: could not {} {:?}: {}",
            self.op, self.path, self.reason
        )
    }
}

impl std::error::Error for FsError {}

enum Backing {
    Memory(Vec<u8>),
    Shared(SharedBytes),
}

enum Node {
    Dir(BTreeMap<String, Node>),
    File(Backing),
}

impl Node {
    fn is_dir(&self) -> bool {
        matches!(self, Node::Dir(_))
    }
}

/// In-memory filesystem shared by every request against one runtime
/// instance. Paths are absolute; `..` segments are rejected.
#[derive(Default)]
pub struct VirtFs {
    root: BTreeMap<String, Node>,
}

impl VirtFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn segments(op: &'static str, path: &str) -> Result<Vec<String>, FsError> {
        if !path.starts_with('/') {
            return Err(FsError::new(op, path, FsReason::InvalidPath));
        }
        let mut segs = Vec::new();
        for seg in path.split('/') {
            match seg {
                "" | "." => {}
                ".." => return Err(FsError::new(op, path, FsReason::InvalidPath)),
                other => segs.push(other.to_string()),
            }
        }
        Ok(segs)
    }

    fn lookup(&self, segs: &[String]) -> Option<&Node> {
        let mut children = &self.root;
        let mut node: Option<&Node> = None;
        for (idx, seg) in segs.iter().enumerate() {
            node = children.get(seg);
            match node {
                Some(Node::Dir(next)) => children = next,
                Some(Node::File(_)) if idx + 1 < segs.len() => return None,
                Some(_) => {}
                None => return None,
            }
        }
        node
    }

    /// The children map of the directory at `segs`, or `None`.
    fn dir_mut(&mut self, segs: &[String]) -> Option<&mut BTreeMap<String, Node>> {
        let mut children = &mut self.root;
        for seg in segs {
            match children.get_mut(seg) {
                Some(Node::Dir(next)) => children = next,
                _ => return None,
            }
        }
        Some(children)
    }

    pub fn mkdir_tree(&mut self, path: &str) -> Result<(), FsError> {
        let segs = Self::segments("create directory", path)?;
        let mut children = &mut self.root;
        for seg in &segs {
            let entry = children
                .entry(seg.clone())
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
            match entry {
                Node::Dir(next) => children = next,
                Node::File(_) => {
                    return Err(FsError::new("create directory", path, FsReason::NotADirectory))
                }
            }
        }
        Ok(())
    }

    pub fn write_file(&mut self, path: &str, data: impl Into<Vec<u8>>) -> Result<(), FsError> {
        self.write_backing(path, Backing::Memory(data.into()), "write to")
    }

    /// Attaches a persistent-backed file by reference. Writes through
    /// [`VirtFs::write_file`] update the shared buffer in place.
    pub fn write_shared(&mut self, path: &str, data: SharedBytes) -> Result<(), FsError> {
        self.write_backing(path, Backing::Shared(data), "mount")
    }

    fn write_backing(
        &mut self,
        path: &str,
        backing: Backing,
        op: &'static str,
    ) -> Result<(), FsError> {
        let segs = Self::segments(op, path)?;
        let Some((name, parent)) = segs.split_last() else {
            return Err(FsError::new(op, path, FsReason::IsADirectory));
        };
        let Some(children) = self.dir_mut(parent) else {
            return Err(FsError::new(op, path, FsReason::ParentMissing));
        };

        let write_through = match children.get(name) {
            Some(Node::Dir(_)) => return Err(FsError::new(op, path, FsReason::IsADirectory)),
            Some(Node::File(Backing::Shared(_))) => matches!(backing, Backing::Memory(_)),
            _ => false,
        };

        if write_through {
            // Shared nodes keep their backing; the write lands in the
            // persistent buffer.
            let Backing::Memory(bytes) = backing else {
                return Ok(());
            };
            if let Some(Node::File(Backing::Shared(shared))) = children.get(name) {
                match shared.write() {
                    Ok(mut guard) => *guard = bytes,
                    Err(poisoned) => *poisoned.into_inner() = bytes,
                }
            }
            return Ok(());
        }

        children.insert(name.clone(), Node::File(backing));
        Ok(())
    }

    pub fn read(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let segs = Self::segments("read", path)?;
        if segs.is_empty() {
            return Err(FsError::new("read", path, FsReason::IsADirectory));
        }
        match self.lookup(&segs) {
            Some(Node::File(Backing::Memory(bytes))) => Ok(bytes.clone()),
            Some(Node::File(Backing::Shared(shared))) => Ok(match shared.read() {
                Ok(guard) => guard.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            }),
            Some(Node::Dir(_)) => Err(FsError::new("read", path, FsReason::IsADirectory)),
            None => Err(FsError::new("read", path, FsReason::NotFound)),
        }
    }

    pub fn read_to_string(&self, path: &str) -> Result<String, FsError> {
        Ok(String::from_utf8_lossy(&self.read(path)?).into_owned())
    }

    pub fn exists(&self, path: &str) -> bool {
        match Self::segments("stat", path) {
            Ok(segs) => segs.is_empty() || self.lookup(&segs).is_some(),
            Err(_) => false,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        match Self::segments("stat", path) {
            Ok(segs) => segs.is_empty() || self.lookup(&segs).map(Node::is_dir).unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn unlink(&mut self, path: &str) -> Result<(), FsError> {
        let segs = Self::segments("unlink", path)?;
        let Some((name, parent)) = segs.split_last() else {
            return Err(FsError::new("unlink", path, FsReason::IsADirectory));
        };
        let Some(children) = self.dir_mut(parent) else {
            return Err(FsError::new("unlink", path, FsReason::NotFound));
        };
        match children.get(name) {
            Some(Node::Dir(_)) => Err(FsError::new("unlink", path, FsReason::IsADirectory)),
            Some(Node::File(_)) => {
                children.remove(name);
                Ok(())
            }
            None => Err(FsError::new("unlink", path, FsReason::NotFound)),
        }
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), FsError> {
        let from_segs = Self::segments("move", from)?;
        let to_segs = Self::segments("move", to)?;
        let Some((from_name, from_parent)) = from_segs.split_last() else {
            return Err(FsError::new("move", from, FsReason::InvalidPath));
        };
        let Some((to_name, to_parent)) = to_segs.split_last() else {
            return Err(FsError::new("move", to, FsReason::InvalidPath));
        };
        let node = {
            let Some(children) = self.dir_mut(from_parent) else {
                return Err(FsError::new("move", from, FsReason::NotFound));
            };
            match children.remove(from_name) {
                Some(node) => node,
                None => return Err(FsError::new("move", from, FsReason::NotFound)),
            }
        };
        match self.dir_mut(to_parent) {
            Some(children) => {
                children.insert(to_name.clone(), node);
                Ok(())
            }
            None => {
                // Destination parent is missing (or vanished with the
                // removed node); put the node back.
                if let Some(children) = self.dir_mut(from_parent) {
                    children.insert(from_name.clone(), node);
                }
                Err(FsError::new("move", to, FsReason::ParentMissing))
            }
        }
    }

    pub fn remove_dir(&mut self, path: &str, recursive: bool) -> Result<(), FsError> {
        let segs = Self::segments("remove directory", path)?;
        let Some((name, parent)) = segs.split_last() else {
            return Err(FsError::new("remove directory", path, FsReason::InvalidPath));
        };
        let Some(children) = self.dir_mut(parent) else {
            return Err(FsError::new("remove directory", path, FsReason::NotFound));
        };
        match children.get(name) {
            Some(Node::Dir(entries)) => {
                if !recursive && !entries.is_empty() {
                    return Err(FsError::new("remove directory", path, FsReason::DirNotEmpty));
                }
                children.remove(name);
                Ok(())
            }
            Some(Node::File(_)) => {
                Err(FsError::new("remove directory", path, FsReason::NotADirectory))
            }
            None => Err(FsError::new("remove directory", path, FsReason::NotFound)),
        }
    }

    /// Lists directory entries. A missing path yields an empty listing.
    pub fn list_dir(&self, path: &str, prepend_path: bool) -> Result<Vec<String>, FsError> {
        let segs = Self::segments("list", path)?;
        let entries = if segs.is_empty() {
            &self.root
        } else {
            match self.lookup(&segs) {
                Some(Node::Dir(entries)) => entries,
                Some(Node::File(_)) => {
                    return Err(FsError::new("list", path, FsReason::NotADirectory))
                }
                None => return Ok(Vec::new()),
            }
        };
        let names = entries.keys().map(|name| {
            if prepend_path {
                format!("{}/{}", path.trim_end_matches('/'), name)
            } else {
                name.clone()
            }
        });
        Ok(names.collect())
    }

    /// Recursively copies the in-memory subtree at `path` into `dest`.
    /// Shared-backed nodes are skipped (already visible to the destination
    /// by reference), as are paths the destination already has.
    pub fn copy_memory_tree(&self, dest: &mut VirtFs, path: &str) -> Result<(), FsError> {
        let segs = Self::segments("copy", path)?;
        let Some(node) = self.lookup(&segs) else {
            return Ok(());
        };
        Self::copy_node(node, dest, path)
    }

    fn copy_node(node: &Node, dest: &mut VirtFs, path: &str) -> Result<(), FsError> {
        match node {
            Node::File(Backing::Shared(_)) => Ok(()),
            Node::File(Backing::Memory(bytes)) => {
                if dest.exists(path) {
                    return Ok(());
                }
                dest.write_file(path, bytes.clone())
            }
            Node::Dir(entries) => {
                if !dest.exists(path) {
                    dest.mkdir_tree(path)?;
                }
                for (name, child) in entries {
                    let child_path = format!("{}/{}", path.trim_end_matches('/'), name);
                    Self::copy_node(child, dest, &child_path)?;
                }
                Ok(())
            }
        }
    }
}
