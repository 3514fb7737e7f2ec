//! The directory side of the loader
//!
//! A directory view owns the `FileInfo` entries it shows and one `LoaderSlot`.
//! The loader only ever holds a weak reference back to it.

use std::path::Path;
use std::sync::Arc;

use crate::loader::LoaderSlot;
use crate::state::FileInfo;

pub trait DirectoryModel: Send + Sync {
    /// Directory the entries' names are relative to
    fn path(&self) -> &Path;

    /// True for views that must not trigger disk activity (remote mounts etc.)
    fn avoid_changes(&self) -> bool {
        false
    }

    /// True if `path` must not be entered, e.g. a mount point under this view
    fn avoid_changes_for(&self, _path: &Path) -> bool {
        false
    }

    /// A thumbnail or folder size for `file` is ready
    ///
    /// Called on the worker thread with no loader lock held, so it may call
    /// back into `loader::request` or `loader::cancel_all`.
    fn thumbnail_loaded(&self, file: &Arc<FileInfo>);

    fn loader_slot(&self) -> &LoaderSlot;
}
