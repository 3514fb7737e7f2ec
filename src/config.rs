//! Loader configuration
//!
//! Stored as JSON, like the rest of our settings. Every field is optional in
//! the file; anything missing takes the default below.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, ThumbnailError};
use crate::state::SizeClass;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// Root of the per-user cache; thumbnails live under `<root>/thumbnails`
    pub cache_root: PathBuf,

    /// Edge length in pixels for `SizeClass::Large`
    pub large_size: u32,

    /// Edge length in pixels for `SizeClass::Small`
    pub small_size: u32,

    /// Try the external video thumbnailer for `video/*` files
    pub video_thumbnails: bool,

    /// Directories the deep-size walk never enters
    pub protected_roots: Vec<PathBuf>,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            large_size: 48,
            small_size: 22,
            video_thumbnails: true,
            protected_roots: vec![
                PathBuf::from("/mnt"),
                PathBuf::from("/proc"),
                PathBuf::from("/sys"),
            ],
        }
    }
}

/// Returns ~/.cache on Linux
fn default_cache_root() -> PathBuf {
    dirs_next::cache_dir()
        .or_else(dirs_next::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl ThumbnailConfig {
    /// Read a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| ThumbnailError::io(path, e))?;
        serde_json::from_str(&data).map_err(|source| ThumbnailError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read the user's configuration file if there is one
    ///
    /// - Linux: ~/.config/thumbnail-loader/config.json
    /// - macOS: ~/Library/Application Support/thumbnail-loader/config.json
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    fn default_path() -> Option<PathBuf> {
        let mut path = dirs::config_dir()?;
        path.push("thumbnail-loader");
        path.push("config.json");
        Some(path)
    }

    /// Pixel size requested for a size class
    pub fn pixel_size(&self, class: SizeClass) -> u32 {
        match class {
            SizeClass::Large => self.large_size,
            SizeClass::Small => self.small_size,
        }
    }
}
