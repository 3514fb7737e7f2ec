//! On-disk thumbnail cache
//!
//! Layout follows the freedesktop thumbnail convention:
//! `<cache root>/thumbnails/{normal,large}/<md5 of file URI>.png`, with the
//! source URI and modification time embedded as PNG text chunks.

use image::{DynamicImage, ImageFormat};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Cursor};
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{Result, ThumbnailError};

pub const URI_KEY: &str = "Thumb::URI";
pub const MTIME_KEY: &str = "Thumb::MTime";

/// The two on-disk buckets. Tiers 256 and 512 share `Large`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Normal,
    Large,
}

impl Bucket {
    pub const ALL: [Bucket; 2] = [Bucket::Normal, Bucket::Large];

    pub fn for_tier(tier: u32) -> Self {
        if tier <= 128 {
            Bucket::Normal
        } else {
            Bucket::Large
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            Bucket::Normal => "normal",
            Bucket::Large => "large",
        }
    }
}

/// Resolution new thumbnails are rendered at for a requested size
pub fn create_size(size: u32) -> u32 {
    if size > 256 {
        512
    } else if size > 128 {
        256
    } else {
        128
    }
}

/// `file://` URI for a path, made absolute first
pub fn file_uri(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    match Url::from_file_path(&absolute) {
        Ok(url) => url.to_string(),
        Err(()) => format!("file://{}", absolute.to_string_lossy()),
    }
}

/// URI of the symlink-free real path, or `uri` unchanged when the path
/// cannot be resolved
pub fn canonical_uri(path: &Path, uri: &str) -> String {
    fs::canonicalize(path)
        .ok()
        .and_then(|real| Url::from_file_path(real).ok())
        .map(|url| url.to_string())
        .unwrap_or_else(|| uri.to_string())
}

/// Cache file name: lowercase hex MD5 of the canonical URI plus `.png`
pub fn cache_key(canonical_uri: &str) -> String {
    format!("{:x}.png", md5::compute(canonical_uri.as_bytes()))
}

/// Create both bucket directories with owner-only access, or tighten the
/// permissions of ones that already exist. Returns `<root>/thumbnails`.
pub fn init_dirs(cache_root: &Path) -> Result<PathBuf> {
    let thumbnails = cache_root.join("thumbnails");

    for bucket in Bucket::ALL {
        let dir = thumbnails.join(bucket.dir_name());
        if dir.is_dir() {
            set_mode(&dir, 0o700)?;
        } else {
            create_private_dir(&dir)?;
        }
    }

    Ok(thumbnails)
}

/// A decoded cache file together with its embedded tags
#[derive(Debug)]
pub struct CacheEntry {
    pub image: DynamicImage,
    pub uri: Option<String>,
    pub mtime: Option<i64>,
}

impl CacheEntry {
    /// The entry can be reused when its tag matches the source mtime and its
    /// longer edge covers the requested size
    pub fn is_valid_for(&self, size: u32, mtime: i64) -> bool {
        let long_edge = self.image.width().max(self.image.height());
        self.mtime == Some(mtime) && long_edge >= size
    }
}

pub fn read_entry(path: &Path) -> Result<CacheEntry> {
    let data = fs::read(path).map_err(|e| ThumbnailError::io(path, e))?;

    let (uri, mtime) = {
        let decoder = png::Decoder::new(Cursor::new(data.as_slice()));
        let reader = decoder.read_info()?;
        let info = reader.info();

        let text = |key: &str| {
            info.uncompressed_latin1_text
                .iter()
                .find(|chunk| chunk.keyword == key)
                .map(|chunk| chunk.text.clone())
        };
        let mtime = text(MTIME_KEY).and_then(|t| t.trim().parse::<i64>().ok());
        (text(URI_KEY), mtime)
    };

    let image = image::load_from_memory_with_format(&data, ImageFormat::Png)?;
    Ok(CacheEntry { image, uri, mtime })
}

/// Write `image` as a tagged PNG readable only by the owner
pub fn write_entry(path: &Path, image: &DynamicImage, uri: &str, mtime: i64) -> Result<()> {
    let rgba = image.to_rgba8();
    let file = create_private_file(path)?;

    let mut encoder = png::Encoder::new(BufWriter::new(file), rgba.width(), rgba.height());
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.add_text_chunk(URI_KEY.to_string(), uri.to_string())?;
    encoder.add_text_chunk(MTIME_KEY.to_string(), mtime.to_string())?;

    let mut writer = encoder.write_header()?;
    writer.write_image_data(rgba.as_raw())?;
    writer.finish()?;

    // an existing file keeps its old mode through `create`
    set_mode(path, 0o600)
}

/// Restrict a file some other tool wrote into the cache
pub fn restrict_file(path: &Path) -> Result<()> {
    set_mode(path, 0o600)
}

fn create_private_file(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path).map_err(|e| ThumbnailError::io(path, e))
}

fn create_private_dir(dir: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(|e| ThumbnailError::io(dir, e))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| ThumbnailError::io(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_size_tiers() {
        assert_eq!(create_size(22), 128);
        assert_eq!(create_size(128), 128);
        assert_eq!(create_size(129), 256);
        assert_eq!(create_size(256), 256);
        assert_eq!(create_size(257), 512);
        assert_eq!(Bucket::for_tier(256), Bucket::Large);
        assert_eq!(Bucket::for_tier(512), Bucket::Large);
    }

    #[test]
    fn test_cache_key_is_md5_hex() {
        let key = cache_key("file:///home/user/photo.jpg");
        assert_eq!(key.len(), 36);
        assert!(key.ends_with(".png"));
        assert!(key[..32]
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_eq!(key, cache_key("file:///home/user/photo.jpg"));
        assert_ne!(key, cache_key("file:///home/user/photo2.jpg"));
    }

    #[test]
    fn test_equivalent_paths_share_a_key() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let photo = dir.path().join("photo.jpg");
        fs::write(&photo, b"x").unwrap();

        let direct = canonical_uri(&photo, "unused");
        let dotted = dir.path().join(".").join("photo.jpg");
        let parent = dir.path().join("sub").join("..").join("photo.jpg");

        assert_eq!(cache_key(&direct), cache_key(&canonical_uri(&dotted, "unused")));
        assert_eq!(cache_key(&direct), cache_key(&canonical_uri(&parent, "unused")));

        #[cfg(unix)]
        {
            let link = dir.path().join("link.jpg");
            std::os::unix::fs::symlink(&photo, &link).unwrap();
            assert_eq!(direct, canonical_uri(&link, "unused"));
        }
    }

    #[test]
    fn test_unresolvable_path_keeps_given_uri() {
        let uri = "file:///definitely/not/here.png";
        assert_eq!(canonical_uri(Path::new("/definitely/not/here.png"), uri), uri);
    }

    #[test]
    fn test_entry_round_trip_keeps_tags() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.png");
        let image = DynamicImage::new_rgb8(128, 96);

        write_entry(&path, &image, "file:///a/b.jpg", 1000).unwrap();
        let entry = read_entry(&path).unwrap();

        assert_eq!(entry.uri.as_deref(), Some("file:///a/b.jpg"));
        assert_eq!(entry.mtime, Some(1000));
        assert!(entry.is_valid_for(48, 1000));
        assert!(entry.is_valid_for(128, 1000));
        assert!(!entry.is_valid_for(48, 1001));
        assert!(!entry.is_valid_for(200, 1000));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_untagged_png_never_validates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.png");
        image::RgbImage::new(128, 128).save(&path).unwrap();

        let entry = read_entry(&path).unwrap();
        assert_eq!(entry.mtime, None);
        assert!(!entry.is_valid_for(48, 0));
    }

    #[cfg(unix)]
    #[test]
    fn test_init_dirs_is_idempotent_and_private() {
        use std::os::unix::fs::PermissionsExt;

        let root = TempDir::new().unwrap();
        let normal = root.path().join("thumbnails").join("normal");
        fs::create_dir_all(&normal).unwrap();
        fs::set_permissions(&normal, fs::Permissions::from_mode(0o755)).unwrap();

        let thumbs = init_dirs(root.path()).unwrap();
        init_dirs(root.path()).unwrap();

        assert_eq!(thumbs, root.path().join("thumbnails"));
        for bucket in Bucket::ALL {
            let mode = fs::metadata(thumbs.join(bucket.dir_name()))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }
}
