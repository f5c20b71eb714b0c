//! Local extent storage: syncing files, extent handles, per-disk layout.

mod disk;
mod extent;
mod syncing_file;

pub use disk::{DiskFs, COPY_SUFFIX, EXTENT_SUFFIX};
pub use extent::{
    index_path_for, write_index, BlockEntry, Entry, Extent, ReadBlocksResult, ReadEntriesResult,
};
pub use syncing_file::{SyncingFile, SyncingFileOptions};
