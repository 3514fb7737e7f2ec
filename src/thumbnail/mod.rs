/// Thumbnail store
///
/// Produces scaled previews for image and video files, backed by the shared
/// freedesktop-style disk cache:
/// - Small images are decoded directly, no cache involved
/// - Everything else is rendered once at a fixed tier (128/256/512) and reused
///   until the source's modification time changes
/// - The result is always scaled so its longer edge is the requested size

pub mod cache;
pub mod video;

pub use cache::{Bucket, CacheEntry};
pub use video::{FfmpegThumbnailer, VideoThumbnailer};

use image::{imageops::FilterType, DynamicImage, ImageDecoder, ImageReader};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ThumbnailConfig;
use crate::error::{Result, ThumbnailError};
use crate::mime::MimeType;
use crate::state::modified_seconds;

/// Counters for what the store actually did
#[derive(Debug, Default)]
pub struct StoreStats {
    cache_hits: AtomicU64,
    generated: AtomicU64,
    direct_loads: AtomicU64,
}

impl StoreStats {
    /// Loads answered from a valid cache entry
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Thumbnails rendered from the source file
    pub fn generated(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    /// Small sources decoded without touching the cache
    pub fn direct_loads(&self) -> u64 {
        self.direct_loads.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct ThumbnailStore {
    /// `<cache root>/thumbnails`
    root: PathBuf,
    video: Option<Box<dyn VideoThumbnailer>>,
    stats: StoreStats,
}

impl std::fmt::Debug for ThumbnailStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailStore")
            .field("root", &self.root)
            .field("video", &self.video.is_some())
            .finish()
    }
}

impl ThumbnailStore {
    /// Make sure the cache directories exist with owner-only permissions and
    /// open the store. Safe to call again on the same root.
    pub fn init(config: &ThumbnailConfig) -> Result<Self> {
        let root = cache::init_dirs(&config.cache_root)?;
        info!("Thumbnail cache at {}", root.display());

        let video: Option<Box<dyn VideoThumbnailer>> = if config.video_thumbnails {
            Some(Box::new(FfmpegThumbnailer::default()))
        } else {
            None
        };

        Ok(Self {
            root,
            video,
            stats: StoreStats::default(),
        })
    }

    /// Replace the video capability
    pub fn with_video_thumbnailer(mut self, thumbnailer: impl VideoThumbnailer + 'static) -> Self {
        self.video = Some(Box::new(thumbnailer));
        self
    }

    pub fn without_video(mut self) -> Self {
        self.video = None;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Where the cache entry for `path` at `size` lives (doesn't generate)
    pub fn thumbnail_path(&self, path: &Path, uri: &str, size: u32) -> PathBuf {
        let tier = cache::create_size(size);
        let canonical = cache::canonical_uri(path, uri);
        self.root
            .join(Bucket::for_tier(tier).dir_name())
            .join(cache::cache_key(&canonical))
    }

    /// Check if a cache entry exists for a file
    pub fn thumbnail_exists(&self, path: &Path, size: u32) -> bool {
        self.thumbnail_path(path, &cache::file_uri(path), size)
            .exists()
    }

    /// Load a preview for a `file://` URI
    pub fn load_for_uri(&self, uri: &str, size: u32, mtime: Option<i64>) -> Option<DynamicImage> {
        let path = match Url::parse(uri).ok().and_then(|url| url.to_file_path().ok()) {
            Some(path) => path,
            None => {
                debug!("{}", ThumbnailError::Uri(uri.to_string()));
                return None;
            }
        };
        self.load_logged(&path, uri, size, mtime, None)
    }

    /// Load a preview for a local path
    ///
    /// `mtime` is the source's modification time if the caller already knows
    /// it; otherwise the file is stat'ed. `mime` skips guessing from the name.
    pub fn load_for_file(
        &self,
        path: &Path,
        size: u32,
        mtime: Option<i64>,
        mime: Option<&MimeType>,
    ) -> Option<DynamicImage> {
        let uri = cache::file_uri(path);
        self.load_logged(path, &uri, size, mtime, mime)
    }

    /// Async version of `load_for_file` for one-off previews
    pub async fn load_for_file_async(
        self: &Arc<Self>,
        path: PathBuf,
        size: u32,
        mtime: Option<i64>,
        mime: Option<MimeType>,
    ) -> Option<DynamicImage> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.load_for_file(&path, size, mtime, mime.as_ref()))
            .await
            .ok()
            .flatten()
    }

    /// Async version of `load_for_uri`
    pub async fn load_for_uri_async(
        self: &Arc<Self>,
        uri: String,
        size: u32,
        mtime: Option<i64>,
    ) -> Option<DynamicImage> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.load_for_uri(&uri, size, mtime))
            .await
            .ok()
            .flatten()
    }

    fn load_logged(
        &self,
        path: &Path,
        uri: &str,
        size: u32,
        mtime: Option<i64>,
        mime: Option<&MimeType>,
    ) -> Option<DynamicImage> {
        match self.load(path, uri, size, mtime, mime) {
            Ok(image) => image,
            Err(e) => {
                debug!("No thumbnail for {}: {}", path.display(), e);
                None
            }
        }
    }

    fn load(
        &self,
        path: &Path,
        uri: &str,
        size: u32,
        mtime: Option<i64>,
        mime: Option<&MimeType>,
    ) -> Result<Option<DynamicImage>> {
        if size == 0 {
            return Ok(None);
        }
        let tier = cache::create_size(size);

        let is_video = match mime {
            Some(mime) => mime.is_video(),
            None => {
                let name = path.file_name().unwrap_or_default().to_string_lossy();
                MimeType::from_file_name(&name).is_video()
            }
        };

        if !is_video {
            let (width, height) = image::image_dimensions(path)?;

            // Small enough already, the cache wouldn't save anything
            if width <= tier && height <= tier {
                StoreStats::bump(&self.stats.direct_loads);
                let image = decode_oriented(path)?;
                if width <= size && height <= size {
                    return Ok(Some(image));
                }
                return Ok(Some(image.resize(size, size, FilterType::Triangle)));
            }
        }

        let cache_path = self.thumbnail_path(path, uri, size);
        let mtime = match mtime {
            Some(mtime) => mtime,
            None => fs::metadata(path)
                .ok()
                .and_then(|meta| modified_seconds(&meta))
                .unwrap_or(0),
        };

        let thumbnail = match cache::read_entry(&cache_path) {
            Ok(entry) if entry.is_valid_for(size, mtime) => {
                StoreStats::bump(&self.stats.cache_hits);
                debug!("Cache hit: {}", cache_path.display());
                Some(entry.image)
            }
            _ => {
                if is_video {
                    self.generate_video(path, uri, &cache_path, tier, mtime)?
                } else {
                    Some(self.generate_image(path, uri, &cache_path, tier, mtime)?)
                }
            }
        };

        Ok(thumbnail.and_then(|image| scale_to_edge(&image, size)))
    }

    fn generate_image(
        &self,
        path: &Path,
        uri: &str,
        cache_path: &Path,
        tier: u32,
        mtime: i64,
    ) -> Result<DynamicImage> {
        let thumbnail = decode_oriented(path)?.resize(tier, tier, FilterType::Triangle);
        StoreStats::bump(&self.stats.generated);

        // Still hand out the rendered image if the cache is unwritable
        match cache::write_entry(cache_path, &thumbnail, uri, mtime) {
            Ok(()) => info!("📸 Generated thumbnail: {}", cache_path.display()),
            Err(e) => warn!("Could not save thumbnail for {}: {}", path.display(), e),
        }

        Ok(thumbnail)
    }

    fn generate_video(
        &self,
        path: &Path,
        uri: &str,
        cache_path: &Path,
        tier: u32,
        mtime: i64,
    ) -> Result<Option<DynamicImage>> {
        let Some(video) = &self.video else {
            return Ok(None);
        };

        video.generate_to_file(path, cache_path, tier)?;
        cache::restrict_file(cache_path)?;
        let thumbnail = image::open(cache_path)?;
        StoreStats::bump(&self.stats.generated);

        // Re-save with our tags so the next request can validate it
        match cache::write_entry(cache_path, &thumbnail, uri, mtime) {
            Ok(()) => info!("🎬 Generated video thumbnail: {}", cache_path.display()),
            Err(e) => warn!("Could not tag video thumbnail {}: {}", cache_path.display(), e),
        }

        Ok(Some(thumbnail))
    }
}

/// Decode an image and apply its EXIF orientation
fn decode_oriented(path: &Path) -> Result<DynamicImage> {
    let mut decoder = ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| ThumbnailError::io(path, e))?
        .into_decoder()?;
    let orientation = decoder.orientation()?;

    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);
    Ok(image)
}

/// Scale so the longer edge is exactly `size`, keeping the aspect ratio
fn scale_to_edge(image: &DynamicImage, size: u32) -> Option<DynamicImage> {
    let (width, height) = (image.width() as u64, image.height() as u64);
    let size64 = size as u64;

    let (width, height) = if width > height {
        (size64, height * size64 / width)
    } else if height > width {
        (width * size64 / height, size64)
    } else {
        (size64, size64)
    };

    if width == 0 || height == 0 {
        return None;
    }
    Some(image.resize_exact(width as u32, height as u32, FilterType::Triangle))
}
