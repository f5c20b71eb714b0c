//! Per-disk extent filesystem: allocation, recovery targets, startup scans.

use crate::error::{BasaltError, Result};
use crate::storage::{Extent, SyncingFileOptions};
use crate::types::{ExtentId, NodeId};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Suffix of live replica files.
pub const EXTENT_SUFFIX: &str = "ext";

/// Suffix of in-flight recovery targets, renamed onto the live suffix
/// atomically when recovery completes.
pub const COPY_SUFFIX: &str = "copy";

/// One configured data directory.
#[derive(Debug)]
pub struct DiskFs {
    root: PathBuf,
    options: SyncingFileOptions,
}

impl DiskFs {
    pub fn new<P: AsRef<Path>>(root: P, options: SyncingFileOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, options })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the live replica for `extent_id` on this disk.
    pub fn extent_path(&self, extent_id: ExtentId) -> PathBuf {
        self.root.join(format!("{}.{}", extent_id, EXTENT_SUFFIX))
    }

    /// Path of the in-flight recovery target for `extent_id`.
    pub fn copy_path(&self, extent_id: ExtentId) -> PathBuf {
        self.root.join(format!("{}.{}", extent_id, COPY_SUFFIX))
    }

    /// Create a fresh open extent on this disk.
    pub fn alloc_extent(&self, extent_id: ExtentId) -> Result<Extent> {
        let path = self.extent_path(extent_id);
        if path.exists() {
            return Err(BasaltError::AlreadyExists(extent_id));
        }
        Extent::create(extent_id, &path, self.options)
    }

    /// Create a recovery target file for `extent_id`. The target carries the
    /// copy suffix until the worker renames it onto the live path.
    pub fn alloc_copy_extent(&self, extent_id: ExtentId, replace_id: NodeId) -> Result<(File, PathBuf)> {
        let path = self.copy_path(extent_id);
        if self.extent_path(extent_id).exists() {
            return Err(BasaltError::AlreadyExists(extent_id));
        }
        // A stale target from an abandoned attempt is overwritten.
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;
        info!(
            extent_id,
            replace_id,
            path = %path.display(),
            "allocated recovery target"
        );
        Ok((file, path))
    }

    /// Open every live replica on this disk.
    pub fn load_extents(&self) -> Result<Vec<Extent>> {
        let mut extents = Vec::new();
        for dirent in std::fs::read_dir(&self.root)? {
            let dirent = dirent?;
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENT_SUFFIX) {
                continue;
            }
            let stem = path.file_stem().and_then(|s| s.to_str());
            let extent_id = match stem.and_then(|s| s.parse::<ExtentId>().ok()) {
                Some(id) => id,
                None => {
                    warn!(path = %path.display(), "skipping unparseable extent file");
                    continue;
                }
            };
            extents.push(Extent::open(extent_id, &path, self.options)?);
        }
        Ok(extents)
    }
}
