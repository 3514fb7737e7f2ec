//! MIME classification
//!
//! Just enough to tell images, videos and directories apart. Names go through
//! `mime_guess`'s extension table, content through `infer`'s magic numbers.

use std::path::Path;
use tracing::trace;

pub const DIRECTORY: &str = "inode/directory";
const UNKNOWN: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeType(String);

impl MimeType {
    pub fn new(mime: impl Into<String>) -> Self {
        MimeType(mime.into())
    }

    pub fn directory() -> Self {
        MimeType::new(DIRECTORY)
    }

    /// Classify by file name extension
    pub fn from_file_name(name: &str) -> Self {
        match mime_guess::from_path(name).first() {
            Some(mime) => MimeType::new(mime.essence_str()),
            None => MimeType::new(UNKNOWN),
        }
    }

    /// Classify by sniffing the file header, whatever the name says
    pub fn from_content(path: &Path) -> Self {
        match infer::get_from_path(path) {
            Ok(Some(kind)) => MimeType::new(kind.mime_type()),
            Ok(None) => MimeType::new(UNKNOWN),
            Err(e) => {
                trace!("Cannot sniff {}: {}", path.display(), e);
                MimeType::new(UNKNOWN)
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_directory(&self) -> bool {
        self.0 == DIRECTORY
    }

    pub fn is_video(&self) -> bool {
        self.0.starts_with("video/")
    }

    pub fn is_image(&self) -> bool {
        self.0.starts_with("image/")
    }
}
