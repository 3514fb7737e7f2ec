//! Background thumbnail loading for file manager directory views
//!
//! - config: JSON settings (sizes, cache root, protected roots)
//! - thumbnail: the disk-cached thumbnail store
//! - loader: per-directory request queue and worker thread
//! - dir: the trait a directory view implements to receive results
//! - state: the shared file entry model

pub mod config;
pub mod dir;
pub mod error;
pub mod loader;
pub mod mime;
pub mod state;
pub mod thumbnail;

pub use config::ThumbnailConfig;
pub use dir::DirectoryModel;
pub use error::{Result, ThumbnailError};
pub use loader::{cancel_all, request, LoaderContext, LoaderSlot};
pub use mime::MimeType;
pub use state::{FileInfo, FileKind, SizeClass};
pub use thumbnail::ThumbnailStore;
