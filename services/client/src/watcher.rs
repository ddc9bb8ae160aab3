//! Bridges OS filesystem notifications into the node loop.
//!
//! One `notify` watcher is created per watched directory so every event can
//! be rewritten relative to its own root, final component included: a change
//! to `…/docs/a.txt` under watch dir `…/docs` travels as `docs/a.txt`. The
//! notify callback runs on its own thread; events cross into the async world
//! over an unbounded channel.

use std::path::Path;

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rm_protocol::FilePayload;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A filesystem change, already rewritten to the path shape the group
/// replicates.
#[derive(Debug, Clone, PartialEq)]
pub enum FsEvent {
    Created {
        path: String,
        is_directory: bool,
    },
    Deleted {
        path: String,
        is_directory: bool,
    },
    Modified {
        path: String,
        is_directory: bool,
        /// Snapshot of the file at event time; `None` when it vanished
        /// before it could be read.
        new_content: Option<Vec<u8>>,
    },
    Moved {
        path: String,
        dest_path: String,
        is_directory: bool,
    },
}

impl From<FsEvent> for FilePayload {
    fn from(event: FsEvent) -> Self {
        match event {
            FsEvent::Created { path, is_directory } => FilePayload::Created {
                src_path: path,
                is_directory,
            },
            FsEvent::Deleted { path, is_directory } => FilePayload::Deleted {
                src_path: path,
                is_directory,
            },
            FsEvent::Modified {
                path,
                is_directory,
                new_content,
            } => FilePayload::Modified {
                src_path: path,
                is_directory,
                new_content,
            },
            FsEvent::Moved {
                path,
                dest_path,
                is_directory,
            } => FilePayload::Moved {
                src_path: path,
                dest_path,
                is_directory,
            },
        }
    }
}

/// Watch `root` recursively, sending translated events into `tx`.
///
/// The returned watcher must be kept alive for as long as events are wanted.
pub fn watch_dir(
    root: &Path,
    tx: mpsc::UnboundedSender<FsEvent>,
) -> Result<RecommendedWatcher, notify::Error> {
    let base = std::path::absolute(root).map_err(notify::Error::io)?;
    let target = base.clone();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        match result {
            Ok(event) => {
                for translated in translate(&base, &event) {
                    let _ = tx.send(translated);
                }
            }
            Err(e) => warn!(error = %e, "watcher error"),
        }
    })?;
    watcher.watch(&target, RecursiveMode::Recursive)?;
    Ok(watcher)
}

/// Rewrite `path` relative to the watched dir, keeping its final component.
fn relative(base: &Path, path: &Path) -> Option<String> {
    let tail = path.strip_prefix(base).ok()?;
    let name = base.file_name()?;
    Some(Path::new(name).join(tail).to_string_lossy().into_owned())
}

fn translate(base: &Path, event: &notify::Event) -> Vec<FsEvent> {
    let mut out = Vec::new();
    match &event.kind {
        EventKind::Create(kind) => {
            for path in &event.paths {
                let Some(rel) = relative(base, path) else { continue };
                let is_directory = matches!(kind, CreateKind::Folder) || path.is_dir();
                out.push(FsEvent::Created {
                    path: rel,
                    is_directory,
                });
            }
        }
        EventKind::Remove(kind) => {
            for path in &event.paths {
                let Some(rel) = relative(base, path) else { continue };
                out.push(FsEvent::Deleted {
                    path: rel,
                    is_directory: matches!(kind, RemoveKind::Folder),
                });
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match (mode, event.paths.as_slice()) {
            (RenameMode::Both, [from, to]) => {
                if let (Some(src), Some(dest)) = (relative(base, from), relative(base, to)) {
                    out.push(FsEvent::Moved {
                        path: src,
                        dest_path: dest,
                        is_directory: to.is_dir(),
                    });
                }
            }
            // unpaired halves of a rename: the vanished side is a delete,
            // the appeared side a create
            (RenameMode::From, [from]) => {
                if let Some(rel) = relative(base, from) {
                    out.push(FsEvent::Deleted {
                        path: rel,
                        is_directory: false,
                    });
                }
            }
            (RenameMode::To, [to]) => {
                if let Some(rel) = relative(base, to) {
                    out.push(FsEvent::Created {
                        path: rel,
                        is_directory: to.is_dir(),
                    });
                }
            }
            _ => debug!(?mode, "unhandled rename shape"),
        },
        EventKind::Modify(ModifyKind::Metadata(_)) | EventKind::Access(_) => {}
        EventKind::Modify(_) => {
            for path in &event.paths {
                let Some(rel) = relative(base, path) else { continue };
                let is_directory = path.is_dir();
                let new_content = if is_directory {
                    None
                } else {
                    // the file may be gone by now; a miss travels as null
                    // and the servers treat it as a no-op
                    std::fs::read(path).ok()
                };
                out.push(FsEvent::Modified {
                    path: rel,
                    is_directory,
                    new_content,
                });
            }
        }
        _ => {}
    }
    out
}

/// The path registered with the group for a watch dir: its final component.
pub fn watch_name(dir: &Path) -> Option<String> {
    dir.file_name().map(|n| n.to_string_lossy().into_owned())
}
