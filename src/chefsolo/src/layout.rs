//! Local output directory layout.
//!
//! ```text
//! <output>/
//!   chef-solo.lock     build lock
//!   bundle-done        build marker, present once the bundle is complete
//!   cookbooks/ ...     vendored bundle
//!   nodes/nodes.lock   node registry lock
//!   nodes/<id>.json    one per node descriptor
//!   dna/<instance>.json
//! ```

use crate::error::{ProvisionError, Result};
use crate::lock::FileLock;
use crate::output::OutputSink;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub const BUILD_LOCK: &str = "chef-solo.lock";
pub const BUILD_MARKER: &str = "bundle-done";
pub const NODES_DIR: &str = "nodes";
pub const NODES_LOCK: &str = "nodes.lock";
pub const DNA_DIR: &str = "dna";

#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn build_lock(&self) -> PathBuf {
        self.root.join(BUILD_LOCK)
    }

    pub fn marker(&self) -> PathBuf {
        self.root.join(BUILD_MARKER)
    }

    pub fn nodes_dir(&self) -> PathBuf {
        self.root.join(NODES_DIR)
    }

    pub fn nodes_lock(&self) -> PathBuf {
        self.nodes_dir().join(NODES_LOCK)
    }

    pub fn node_file(&self, node_id: &str) -> PathBuf {
        self.nodes_dir().join(format!("{}.json", node_id))
    }

    pub fn dna_dir(&self) -> PathBuf {
        self.root.join(DNA_DIR)
    }

    pub fn dna_file(&self, instance_id: &str) -> PathBuf {
        self.dna_dir().join(format!("{}.json", instance_id))
    }

    pub fn is_built(&self) -> bool {
        self.marker().exists()
    }

    pub fn mark_built(&self) -> Result<()> {
        std::fs::File::create(self.marker())
            .map_err(|e| ProvisionError::io_context("failed to create the build marker", e))?;
        Ok(())
    }

    /// Make the output directory usable for this run.
    ///
    /// A directory holding a completed bundle is kept untouched. A directory left
    /// over from an unfinished build is emptied, unless another run currently
    /// holds the build lock.
    pub fn prepare(&self) -> Result<()> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root).map_err(|e| {
                ProvisionError::io_context(
                    format!("failed to create output directory {}", self.root.display()),
                    e,
                )
            })?;
            return Ok(());
        }

        if self.is_built() {
            tracing::debug!(
                "[OutputLayout] {} already holds a complete bundle",
                self.root.display()
            );
            return Ok(());
        }

        match FileLock::try_acquire(&self.build_lock())? {
            Some(lock) => {
                if !self.is_built() {
                    tracing::info!(
                        "[OutputLayout] Clearing unfinished output in {}",
                        self.root.display()
                    );
                    self.clear_except_lock()?;
                }
                lock.release();
            }
            None => {
                tracing::debug!(
                    "[OutputLayout] Another run is building into {}, leaving it as is",
                    self.root.display()
                );
            }
        }
        Ok(())
    }

    fn clear_except_lock(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_name() == BUILD_LOCK {
                continue;
            }
            let path = entry.path();
            let removed = if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            removed.map_err(|e| {
                ProvisionError::io_context(format!("failed to remove {}", path.display()), e)
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    AlreadyPresent,
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create `path` with `content` unless it already exists. Existing files are
/// never rewritten.
///
/// The content is written to a temporary file next to `path` and then hard
/// linked into place, so `path` only ever appears complete. A failed write
/// leaves nothing behind and a later run writes the file again.
pub fn write_if_absent(path: &Path, content: &str, sink: &dyn OutputSink) -> Result<WriteOutcome> {
    sink.output(&format!("Looking for {} existence", path.display()));
    if path.exists() {
        sink.output(&format!("{} already exists, not writing it again", path.display()));
        return Ok(WriteOutcome::AlreadyPresent);
    }

    sink.output(&format!("Writing {}", path.display()));
    let temp = temp_path(path);
    let linked = write_temp(&temp, content).and_then(|_| std::fs::hard_link(&temp, path));
    if let Err(e) = std::fs::remove_file(&temp) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("[OutputLayout] Failed to remove {}: {}", temp.display(), e);
        }
    }

    match linked {
        Ok(()) => {
            sink.output(&format!("File written {}", path.display()));
            Ok(WriteOutcome::Written)
        }
        // Another run linked it first
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            sink.output(&format!("{} already exists, not writing it again", path.display()));
            Ok(WriteOutcome::AlreadyPresent)
        }
        Err(e) => Err(ProvisionError::io_context(
            format!("failed to write {}", path.display()),
            e,
        )),
    }
}

/// `.<name>.<pid>.<n>.tmp` in the same directory as `path`
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{}.{}.{}.tmp",
        name,
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::SeqCst)
    ))
}

fn write_temp(temp: &Path, content: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()
}
