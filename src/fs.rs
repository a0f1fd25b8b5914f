//! File-system collaborator
//!
//! Debug capture, replay and the download manager touch disk only through
//! [`FileSystem`], so tests can run against [`MemoryFileSystem`].

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Minimal async file-system surface
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Write `contents` to `path`, replacing any existing file
    async fn write(&self, path: &Path, contents: Bytes) -> Result<()>;

    /// Read a whole file
    async fn read(&self, path: &Path) -> Result<Bytes>;

    /// Create a directory and all missing parents
    async fn create_directory(&self, path: &Path) -> Result<()>;

    /// Move `from` to `to`, replacing anything already at `to`
    async fn move_item(&self, from: &Path, to: &Path) -> Result<()>;

    /// Remove a file or a directory tree
    async fn remove_item(&self, path: &Path) -> Result<()>;

    /// Whether anything exists at `path`
    async fn exists(&self, path: &Path) -> bool;

    /// Direct children of a directory, sorted
    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>>;
}

/// [`FileSystem`] backed by `tokio::fs`
#[derive(Clone, Debug, Default)]
pub struct TokioFileSystem;

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn write(&self, path: &Path, contents: Bytes) -> Result<()> {
        tokio::fs::write(path, &contents).await?;
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Bytes> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::FileNotFound(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_directory(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn move_item(&self, from: &Path, to: &Path) -> Result<()> {
        if !tokio::fs::try_exists(from).await.unwrap_or(false) {
            return Err(Error::FileNotFound(from.to_path_buf()));
        }
        if tokio::fs::try_exists(to).await.unwrap_or(false) {
            self.remove_item(to).await?;
        }
        if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        // rename fails across mount points; fall back to copy + delete
        if let Err(e) = tokio::fs::rename(from, to).await {
            tracing::debug!(
                from = %from.display(),
                to = %to.display(),
                error = %e,
                "rename failed, copying instead"
            );
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await?;
        }
        Ok(())
    }

    async fn remove_item(&self, path: &Path) -> Result<()> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::FileNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        if metadata.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            entries.push(entry.path());
        }
        entries.sort();
        Ok(entries)
    }
}

#[derive(Clone, Debug)]
enum Node {
    File(Bytes),
    Directory,
}

/// In-memory [`FileSystem`] for tests
///
/// Parent directories are created implicitly by writes.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    nodes: Mutex<BTreeMap<PathBuf, Node>>,
}

impl MemoryFileSystem {
    /// Empty file system
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths of all files currently stored, sorted
    pub fn files(&self) -> Vec<PathBuf> {
        self.lock()
            .iter()
            .filter(|(_, node)| matches!(node, Node::File(_)))
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<PathBuf, Node>> {
        // a poisoned map is still structurally valid
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert_parents(nodes: &mut BTreeMap<PathBuf, Node>, path: &Path) {
        for ancestor in path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            nodes
                .entry(ancestor.to_path_buf())
                .or_insert(Node::Directory);
        }
    }
}

#[async_trait]
impl FileSystem for MemoryFileSystem {
    async fn write(&self, path: &Path, contents: Bytes) -> Result<()> {
        let mut nodes = self.lock();
        if matches!(nodes.get(path), Some(Node::Directory)) {
            return Err(Error::Io(std::io::Error::other(format!(
                "{} is a directory",
                path.display()
            ))));
        }
        Self::insert_parents(&mut nodes, path);
        nodes.insert(path.to_path_buf(), Node::File(contents));
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Bytes> {
        match self.lock().get(path) {
            Some(Node::File(data)) => Ok(data.clone()),
            _ => Err(Error::FileNotFound(path.to_path_buf())),
        }
    }

    async fn create_directory(&self, path: &Path) -> Result<()> {
        let mut nodes = self.lock();
        Self::insert_parents(&mut nodes, path);
        nodes
            .entry(path.to_path_buf())
            .or_insert(Node::Directory);
        Ok(())
    }

    async fn move_item(&self, from: &Path, to: &Path) -> Result<()> {
        let mut nodes = self.lock();
        if !nodes.contains_key(from) {
            return Err(Error::FileNotFound(from.to_path_buf()));
        }

        nodes.retain(|path, _| !path.starts_with(to));
        let moved: Vec<(PathBuf, Node)> = nodes
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, node)| (path.clone(), node.clone()))
            .collect();
        nodes.retain(|path, _| !path.starts_with(from));

        Self::insert_parents(&mut nodes, to);
        for (path, node) in moved {
            let relative = path.strip_prefix(from).unwrap_or(Path::new(""));
            let target = if relative.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(relative)
            };
            nodes.insert(target, node);
        }
        Ok(())
    }

    async fn remove_item(&self, path: &Path) -> Result<()> {
        let mut nodes = self.lock();
        if !nodes.contains_key(path) {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }
        nodes.retain(|p, _| !p.starts_with(path));
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }

    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let nodes = self.lock();
        match nodes.get(path) {
            Some(Node::Directory) => Ok(nodes
                .keys()
                .filter(|p| p.parent() == Some(path))
                .cloned()
                .collect()),
            _ => Err(Error::FileNotFound(path.to_path_buf())),
        }
    }
}
