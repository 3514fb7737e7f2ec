//! Optional video thumbnailing
//!
//! Videos are rendered by an external tool. When the tool is missing or
//! fails, the store simply has no preview for the file.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{Result, ThumbnailError};

/// Something that can render one frame of a video into a PNG file
pub trait VideoThumbnailer: Send + Sync {
    /// Render `source` into `dest`, longer edge `size` pixels
    fn generate_to_file(&self, source: &Path, dest: &Path, size: u32) -> Result<()>;
}

/// Drives the `ffmpegthumbnailer` command line tool
#[derive(Debug, Clone)]
pub struct FfmpegThumbnailer {
    pub program: PathBuf,
    /// Seek point as a percentage of the duration
    pub seek_percentage: u8,
    /// Draw sprocket holes on the frame so videos stand out from images
    pub overlay_film_strip: bool,
}

impl Default for FfmpegThumbnailer {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpegthumbnailer"),
            seek_percentage: 25,
            overlay_film_strip: true,
        }
    }
}

impl VideoThumbnailer for FfmpegThumbnailer {
    fn generate_to_file(&self, source: &Path, dest: &Path, size: u32) -> Result<()> {
        let mut command = Command::new(&self.program);
        command
            .arg("-i")
            .arg(source)
            .arg("-o")
            .arg(dest)
            .arg("-s")
            .arg(size.to_string())
            .arg("-t")
            .arg(format!("{}%", self.seek_percentage))
            .arg("-c")
            .arg("png")
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if self.overlay_film_strip {
            command.arg("-f");
        }

        let status = command.status().map_err(|e| ThumbnailError::Video {
            path: source.to_path_buf(),
            reason: format!("cannot run {}: {}", self.program.display(), e),
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(ThumbnailError::Video {
                path: source.to_path_buf(),
                reason: format!("{} exited with {}", self.program.display(), status),
            })
        }
    }
}
