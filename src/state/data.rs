//! Data structures shared between the directory view and the loader

use chrono::{DateTime, Utc};
use image::DynamicImage;
use parking_lot::Mutex;
use std::fs::{self, Metadata};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::mime::MimeType;

/// The two independent demand categories a view can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    Large,
    Small,
}

impl SizeClass {
    pub const ALL: [SizeClass; 2] = [SizeClass::Large, SizeClass::Small];

    pub(crate) fn index(self) -> usize {
        match self {
            SizeClass::Large => 0,
            SizeClass::Small => 1,
        }
    }
}

/// File type bits of the entry, as seen by `lstat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Other,
}

impl FileKind {
    pub fn from_metadata(meta: &Metadata) -> Self {
        let ft = meta.file_type();
        if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_file() {
            FileKind::Regular
        } else {
            FileKind::Other
        }
    }
}

/// Modification time in whole seconds since the epoch
pub fn modified_seconds(meta: &Metadata) -> Option<i64> {
    meta.modified()
        .ok()
        .map(|time| DateTime::<Utc>::from(time).timestamp())
}

/// A single entry of a directory listing
#[derive(Debug)]
pub struct FileInfo {
    name: String,
    kind: FileKind,
    size: AtomicU64,
    /// Human readable size; `None` until first asked for or after a size change
    disp_size: Mutex<Option<String>>,
    mtime: Option<i64>,
    mime_type: Option<MimeType>,
    /// Indexed by `SizeClass::index`
    thumbnails: Mutex<[Option<DynamicImage>; 2]>,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, kind: FileKind, size: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            size: AtomicU64::new(size),
            disp_size: Mutex::new(None),
            mtime: None,
            mime_type: None,
            thumbnails: Mutex::new([None, None]),
        }
    }

    pub fn with_mtime(mut self, mtime: i64) -> Self {
        self.mtime = Some(mtime);
        self
    }

    pub fn with_mime_type(mut self, mime_type: MimeType) -> Self {
        self.mime_type = Some(mime_type);
        self
    }

    /// Build an entry from the file on disk
    ///
    /// Symlinks keep their own kind; a link pointing at a directory gets the
    /// directory MIME type so the loader treats it as a folder.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let meta = fs::symlink_metadata(path)?;
        let name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let kind = FileKind::from_metadata(&meta);

        let mime_type = match kind {
            FileKind::Directory => MimeType::directory(),
            FileKind::Symlink if path.is_dir() => MimeType::directory(),
            _ => MimeType::from_file_name(&name),
        };

        let mut info = FileInfo::new(name, kind, meta.len()).with_mime_type(mime_type);
        info.mtime = modified_seconds(&meta);
        Ok(info)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn mtime(&self) -> Option<i64> {
        self.mtime
    }

    pub fn mime_type(&self) -> Option<&MimeType> {
        self.mime_type.as_ref()
    }

    /// True for directories and for symlinks that resolve to one
    pub fn is_dir(&self) -> bool {
        match self.kind {
            FileKind::Directory => true,
            FileKind::Symlink => self.mime_type.as_ref().is_some_and(MimeType::is_directory),
            _ => false,
        }
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Store a new size and drop the display string so it gets rebuilt
    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
        *self.disp_size.lock() = None;
    }

    pub fn disp_size(&self) -> String {
        let mut disp = self.disp_size.lock();
        disp.get_or_insert_with(|| humansize::format_size(self.size(), humansize::DECIMAL))
            .clone()
    }

    pub fn is_thumbnail_loaded(&self, class: SizeClass) -> bool {
        self.thumbnails.lock()[class.index()].is_some()
    }

    pub fn thumbnail(&self, class: SizeClass) -> Option<DynamicImage> {
        self.thumbnails.lock()[class.index()].clone()
    }

    pub fn set_thumbnail(&self, class: SizeClass, image: DynamicImage) {
        self.thumbnails.lock()[class.index()] = Some(image);
    }
}
