//! Error types for the thumbnail loader
//!
//! Store internals return these, but nothing here ever reaches the UI as a
//! hard failure: the public load functions flatten errors into "no preview".

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode image: {0}")]
    Image(#[from] image::ImageError),

    #[error("Failed to read PNG metadata: {0}")]
    PngDecode(#[from] png::DecodingError),

    #[error("Failed to write PNG: {0}")]
    PngEncode(#[from] png::EncodingError),

    #[error("Not a local file URI: {0}")]
    Uri(String),

    #[error("Video thumbnailer failed for {}: {reason}", path.display())]
    Video { path: PathBuf, reason: String },

    #[error("Invalid configuration in {}: {source}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ThumbnailError {
    /// Wrap an I/O error together with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ThumbnailError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ThumbnailError>;
