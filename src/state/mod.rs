/// Shared file model
///
/// `FileInfo` is the entry the directory listing hands to the loader. It is
/// shared between the UI and the worker thread through `Arc`, so everything
/// the worker writes back (size, thumbnails) sits behind atomics or locks.

pub mod data;

pub use data::{modified_seconds, FileInfo, FileKind, SizeClass};
