use anyhow::Result;
use async_trait::async_trait;
use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat, ImageReader};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::debug;

// Matches the decoder's default allocation limit
const MAX_OUTPUT_BYTES: u64 = 512 * 1024 * 1024;

const RESAMPLE_BYTES_PER_PIXEL: f64 = 16.0;

/// Produces a resized copy of an image
#[async_trait]
pub trait ThumbnailDeriver: Send + Sync {
    /// Encoded bytes of `source` scaled to `width` pixels wide
    async fn derive(&self, source: &Path, width: u32) -> Result<Vec<u8>>;
}

/// [`ThumbnailDeriver`] backed by the `image` crate
///
/// The aspect ratio is preserved and the output keeps the source's encoding,
/// falling back to PNG when the format cannot be detected.
#[derive(Debug, Clone)]
pub struct ImageThumbnailer {
    filter: FilterType,
}

impl Default for ImageThumbnailer {
    fn default() -> Self {
        Self {
            filter: FilterType::Lanczos3,
        }
    }
}

impl ImageThumbnailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(filter: FilterType) -> Self {
        Self { filter }
    }

    fn resize(path: &Path, width: u32, filter: FilterType) -> Result<Vec<u8>> {
        let reader = ImageReader::open(path)?.with_guessed_format()?;
        let format = reader.format().unwrap_or(ImageFormat::Png);
        let img = reader.decode()?;

        let (original_width, original_height) = img.dimensions();
        if original_width == 0 {
            anyhow::bail!("Image {} has no width", path.display());
        }
        let height = (f64::from(original_height) * f64::from(width) / f64::from(original_width))
            .round()
            .max(1.0);

        // A very tall, narrow source can scale to a buffer too large to allocate.
        // Resampling works on 32-bit float RGBA, the widest pixel the output can have.
        let budget = image::Limits::default()
            .max_alloc
            .unwrap_or(MAX_OUTPUT_BYTES);
        let bytes = f64::from(width) * height * RESAMPLE_BYTES_PER_PIXEL;
        if height > f64::from(u32::MAX) || bytes > budget as f64 {
            anyhow::bail!(
                "Thumbnail of {} would be {}x{} pixels, over the {} byte limit",
                path.display(),
                width,
                height,
                budget
            );
        }
        let height = height as u32;

        let thumbnail = img.resize_exact(width, height, filter);

        let mut buffer = Cursor::new(Vec::new());
        thumbnail.write_to(&mut buffer, format)?;

        Ok(buffer.into_inner())
    }
}

#[async_trait]
impl ThumbnailDeriver for ImageThumbnailer {
    async fn derive(&self, source: &Path, width: u32) -> Result<Vec<u8>> {
        debug!("Resizing {} to width {}", source.display(), width);

        // Decoding and resizing are CPU bound
        let path: PathBuf = source.to_path_buf();
        let filter = self.filter;
        tokio::task::spawn_blocking(move || Self::resize(&path, width, filter))
            .await
            .map_err(|e| anyhow::anyhow!("Task join error: {}", e))?
    }
}
