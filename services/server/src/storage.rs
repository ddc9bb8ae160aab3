//! The mirrored tree: replicated file effects under a storage root.
//!
//! Every client-supplied path is joined onto the root and lexically
//! normalised; a result that leaves the root fails with a permission error
//! before anything touches disk.

use std::fs;
use std::path::{Component, Path, PathBuf};

use rm_protocol::FilePayload;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("permission denied: bad path")]
    PathEscape,
    #[error("storage root {0:?} is not a directory")]
    NotADirectory(PathBuf),
    #[error("{op} {path:?}: {source}")]
    Io {
        op: &'static str,
        path: String,
        source: std::io::Error,
    },
}

fn io_ctx(op: &'static str, path: &str) -> impl FnOnce(std::io::Error) -> StorageError {
    let path = path.to_owned();
    move |source| StorageError::Io { op, path, source }
}

pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Open (or create) the mirrored tree rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, StorageError> {
        let root = std::path::absolute(root).map_err(io_ctx("resolve", &root.display().to_string()))?;
        if root.exists() {
            if !root.is_dir() {
                return Err(StorageError::NotADirectory(root));
            }
        } else {
            fs::create_dir_all(&root).map_err(io_ctx("create", &root.display().to_string()))?;
            info!(root = %root.display(), "storage directory created");
        }
        Ok(Storage { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a client-supplied relative path onto the local disk.
    ///
    /// `.` and `..` are resolved lexically; the result must stay under the
    /// root or the operation is refused.
    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let joined = self.root.join(relative);
        let mut resolved = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if !resolved.pop() {
                        return Err(StorageError::PathEscape);
                    }
                }
                other => resolved.push(other),
            }
        }
        if !resolved.starts_with(&self.root) {
            return Err(StorageError::PathEscape);
        }
        Ok(resolved)
    }

    /// Apply one replicated file effect to the tree.
    pub fn apply(&self, op: &FilePayload) -> Result<(), StorageError> {
        match op {
            FilePayload::Watched { path } => {
                let dir = self.resolve(path)?;
                fs::create_dir_all(&dir).map_err(io_ctx("watch", path))?;
                info!(path = %path, "watching new path");
            }
            FilePayload::Created {
                src_path,
                is_directory,
            } => {
                let target = self.resolve(src_path)?;
                if *is_directory {
                    fs::create_dir(&target).map_err(io_ctx("create", src_path))?;
                } else {
                    fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(&target)
                        .map_err(io_ctx("create", src_path))?;
                }
                info!(path = %src_path, directory = is_directory, "created");
            }
            FilePayload::Modified {
                src_path,
                is_directory,
                new_content,
            } => {
                if *is_directory {
                    debug!(path = %src_path, "directory modification ignored");
                    return Ok(());
                }
                let Some(content) = new_content else {
                    debug!(path = %src_path, "content unavailable, nothing to write");
                    return Ok(());
                };
                let target = self.resolve(src_path)?;
                fs::write(&target, content).map_err(io_ctx("write", src_path))?;
                info!(path = %src_path, bytes = content.len(), "modified");
            }
            FilePayload::Moved {
                src_path,
                dest_path,
                ..
            } => {
                let from = self.resolve(src_path)?;
                let to = self.resolve(dest_path)?;
                fs::rename(&from, &to).map_err(io_ctx("move", src_path))?;
                info!(from = %src_path, to = %dest_path, "moved");
            }
            FilePayload::Deleted {
                src_path,
                is_directory,
            } => {
                let target = self.resolve(src_path)?;
                if *is_directory {
                    fs::remove_dir(&target).map_err(io_ctx("delete", src_path))?;
                } else {
                    fs::remove_file(&target).map_err(io_ctx("delete", src_path))?;
                }
                info!(path = %src_path, directory = is_directory, "deleted");
            }
        }
        Ok(())
    }
}
