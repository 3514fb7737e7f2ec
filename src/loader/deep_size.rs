//! Recursive folder size for directory entries in the icon view

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;
use walkdir::WalkDir;

/// Outcome of a walk; `bytes` is partial when `cancelled` is set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeepSize {
    pub bytes: u64,
    pub cancelled: bool,
}

/// Exact match against one of the roots the walk must never enter
pub fn is_protected(path: &Path, protected_roots: &[PathBuf]) -> bool {
    protected_roots.iter().any(|root| root == path)
}

/// Sum the sizes of everything below `path`
///
/// Only non-directory entries count; symlinks contribute their own size and
/// are never followed. Directories for which `excluded` returns true are
/// skipped entirely. `cancel` is checked before every entry.
pub fn deep_size<F>(path: &Path, cancel: &AtomicBool, excluded: F) -> DeepSize
where
    F: Fn(&Path) -> bool,
{
    let mut bytes: u64 = 0;

    let walker = WalkDir::new(path)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !(entry.file_type().is_dir() && excluded(entry.path())));

    for entry in walker {
        if cancel.load(Ordering::Acquire) {
            return DeepSize {
                bytes,
                cancelled: true,
            };
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                trace!("Skipping unreadable entry: {}", e);
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            bytes += metadata.len();
        }
    }

    DeepSize {
        bytes,
        cancelled: false,
    }
}
