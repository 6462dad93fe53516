//! Image recompression: percentage resize plus JPEG re-encode.

use image::imageops::FilterType;
use image::GenericImageView;
use std::path::{Path, PathBuf};

use pixferry_core::{PipelineError, PipelineResult};

/// Resize `source` by `resize_percentage` and write a recompressed copy to
/// `dest`. JPEG output is encoded with mozjpeg at `jpeg_quality`; other
/// decodable formats are re-encoded as-is. Returns the output size in bytes.
///
/// Decoding runs on the blocking pool; a failed decode is reported as a
/// media error so the caller can fall back to a plain copy.
pub async fn compress_image(
    source: &Path,
    dest: &Path,
    resize_percentage: u32,
    jpeg_quality: u8,
) -> PipelineResult<u64> {
    let source = source.to_path_buf();
    let dest_path = dest.to_path_buf();
    tokio::task::spawn_blocking(move || compress_blocking(&source, &dest_path, resize_percentage, jpeg_quality))
        .await
        .map_err(|e| PipelineError::Media(format!("image task: {}", e)))?
}

fn compress_blocking(
    source: &PathBuf,
    dest: &PathBuf,
    resize_percentage: u32,
    jpeg_quality: u8,
) -> PipelineResult<u64> {
    let img = image::open(source)
        .map_err(|e| PipelineError::Media(format!("cannot decode {}: {}", source.display(), e)))?;

    let (width, height) = img.dimensions();
    let img = if resize_percentage < 100 {
        let new_width = (width * resize_percentage / 100).max(1);
        let new_height = (height * resize_percentage / 100).max(1);
        img.resize(new_width, new_height, FilterType::Lanczos3)
    } else {
        img
    };

    let is_jpeg = matches!(
        dest.extension().and_then(|e| e.to_str()).map(str::to_lowercase).as_deref(),
        Some("jpg") | Some("jpeg")
    );

    if is_jpeg {
        let rgb = img.to_rgb8();
        let (width, height) = rgb.dimensions();

        let mut comp = mozjpeg::Compress::new(mozjpeg::ColorSpace::JCS_RGB);
        comp.set_size(width as usize, height as usize);
        comp.set_quality(jpeg_quality as f32);
        comp.set_progressive_mode();
        comp.set_optimize_coding(true);

        let mut comp = comp
            .start_compress(Vec::new())
            .map_err(|e| PipelineError::Media(format!("jpeg encoder: {}", e)))?;
        comp.write_scanlines(&rgb)
            .map_err(|e| PipelineError::Media(format!("jpeg encode: {}", e)))?;
        let jpeg_data = comp
            .finish()
            .map_err(|e| PipelineError::Media(format!("jpeg finish: {}", e)))?;

        std::fs::write(dest, &jpeg_data)?;
        Ok(jpeg_data.len() as u64)
    } else {
        img.save(dest)
            .map_err(|e| PipelineError::Media(format!("cannot encode {}: {}", dest.display(), e)))?;
        Ok(std::fs::metadata(dest)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn noisy_image(width: u32, height: u32) -> RgbImage {
        // Deterministic high-frequency pattern so JPEG has something to cut.
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                ((x * 7 + y * 13) % 256) as u8,
                ((x * 3 + y * 29) % 256) as u8,
                ((x * 17 + y * 5) % 256) as u8,
            ])
        })
    }

    #[tokio::test]
    async fn test_jpeg_resize_and_encode() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.jpg");
        let dest = dir.path().join("out.jpg");
        noisy_image(200, 100).save(&source).unwrap();

        let size = compress_image(&source, &dest, 50, 70).await.unwrap();
        assert!(size > 0);

        let out = image::open(&dest).unwrap();
        assert_eq!(out.dimensions(), (100, 50));
    }

    #[tokio::test]
    async fn test_full_size_keeps_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.png");
        let dest = dir.path().join("out.png");
        noisy_image(64, 64).save(&source).unwrap();

        compress_image(&source, &dest, 100, 85).await.unwrap();
        assert_eq!(image::open(&dest).unwrap().dimensions(), (64, 64));
    }

    #[tokio::test]
    async fn test_undecodable_input_is_media_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("fake.jpg");
        tokio::fs::write(&source, b"definitely not a jpeg").await.unwrap();

        let err = compress_image(&source, &dir.path().join("out.jpg"), 90, 85)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "media");
    }
}
