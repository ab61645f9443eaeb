//! Image transformation and optimization
//!
//! Re-encodes raw captures with size-oriented settings. These functions are
//! CPU-bound and blocking; async callers run them on the blocking pool.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::{WebPEncoder, WebPQuality};
use image::{ColorType, DynamicImage, ImageEncoder};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::config::ImageFormat;
use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformOutput {
    pub byte_size: u64,
    pub width: u32,
    pub height: u32,
    /// False when the re-encode was discarded because it was larger.
    pub reencoded: bool,
}

/// Encode `img` in `format`.
///
/// JPEG and WebP use `quality`; PNG always uses maximum compression with
/// adaptive filtering.
pub fn encode(img: &DynamicImage, format: ImageFormat, quality: u8) -> Result<Vec<u8>, CaptureError> {
    let quality = quality.clamp(1, 100);
    let (width, height) = (img.width(), img.height());
    let mut buf = Vec::new();

    match format {
        ImageFormat::Jpeg => {
            let rgb = img.to_rgb8();
            JpegEncoder::new_with_quality(&mut buf, quality).encode(
                rgb.as_raw(),
                width,
                height,
                ColorType::Rgb8,
            )?;
        }
        ImageFormat::Png => {
            let encoder =
                PngEncoder::new_with_quality(&mut buf, CompressionType::Best, FilterType::Adaptive);
            if img.color().has_alpha() {
                encoder.write_image(img.to_rgba8().as_raw(), width, height, ColorType::Rgba8)?;
            } else {
                encoder.write_image(img.to_rgb8().as_raw(), width, height, ColorType::Rgb8)?;
            }
        }
        ImageFormat::Webp => encode_webp(img, quality, &mut buf)?,
    }

    Ok(buf)
}

#[allow(deprecated)]
fn encode_webp(img: &DynamicImage, quality: u8, buf: &mut Vec<u8>) -> Result<(), CaptureError> {
    let rgba = img.to_rgba8();
    let encoder = WebPEncoder::new_with_quality(buf, WebPQuality::lossy(quality));
    encoder.encode(rgba.as_raw(), img.width(), img.height(), ColorType::Rgba8)?;
    Ok(())
}

/// Re-encode the raw capture at `raw_path` into `target_path`.
///
/// Never grows the file: if the raw capture is already in `format` and the
/// re-encode is larger, the raw bytes are written instead.
pub fn optimize(
    raw_path: &Path,
    target_path: &Path,
    format: ImageFormat,
    quality: u8,
) -> Result<TransformOutput, CaptureError> {
    let raw = fs::read(raw_path)?;
    let img = image::load_from_memory(&raw)?;
    let encoded = encode(&img, format, quality)?;

    let raw_in_target_format = image::guess_format(&raw)
        .map(|detected| detected == to_codec_format(format))
        .unwrap_or(false);
    let keep_raw = raw_in_target_format && encoded.len() >= raw.len();

    let bytes = if keep_raw { &raw } else { &encoded };
    if let Err(e) = fs::write(target_path, bytes) {
        let _ = fs::remove_file(target_path);
        return Err(e.into());
    }

    debug!(
        format = %format,
        raw_bytes = raw.len(),
        encoded_bytes = encoded.len(),
        kept_raw = keep_raw,
        "Optimized capture"
    );

    Ok(TransformOutput {
        byte_size: bytes.len() as u64,
        width: img.width(),
        height: img.height(),
        reencoded: !keep_raw,
    })
}

/// Size and pixel dimensions of an image already in place.
pub fn inspect(path: &Path) -> Result<TransformOutput, CaptureError> {
    let byte_size = fs::metadata(path)?.len();
    let (width, height) = image::image_dimensions(path)?;
    Ok(TransformOutput {
        byte_size,
        width,
        height,
        reencoded: false,
    })
}

fn to_codec_format(format: ImageFormat) -> image::ImageFormat {
    match format {
        ImageFormat::Png => image::ImageFormat::Png,
        ImageFormat::Jpeg => image::ImageFormat::Jpeg,
        ImageFormat::Webp => image::ImageFormat::WebP,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_page_image;
    use tempfile::TempDir;

    fn write_raw(dir: &TempDir, name: &str, format: ImageFormat, quality: u8) -> std::path::PathBuf {
        let img = sample_page_image(320, 240);
        let path = dir.path().join(name);
        fs::write(&path, encode(&img, format, quality).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_encoders_produce_requested_format() {
        let img = sample_page_image(160, 120);
        for (format, expected) in [
            (ImageFormat::Png, image::ImageFormat::Png),
            (ImageFormat::Jpeg, image::ImageFormat::Jpeg),
            (ImageFormat::Webp, image::ImageFormat::WebP),
        ] {
            let bytes = encode(&img, format, 80).unwrap();
            assert_eq!(image::guess_format(&bytes).unwrap(), expected);
        }
    }

    #[test]
    fn test_optimized_jpeg_never_exceeds_raw() {
        let dir = TempDir::new().unwrap();
        let raw = write_raw(&dir, "temp_raw.jpg", ImageFormat::Jpeg, 40);
        let raw_size = fs::metadata(&raw).unwrap().len();
        let target = dir.path().join("out.jpg");

        let output = optimize(&raw, &target, ImageFormat::Jpeg, 95).unwrap();
        assert!(output.byte_size <= raw_size);
        assert_eq!(fs::metadata(&target).unwrap().len(), output.byte_size);
        assert_eq!((output.width, output.height), (320, 240));
    }

    #[test]
    fn test_lower_quality_jpeg_is_reencoded() {
        let dir = TempDir::new().unwrap();
        let raw = write_raw(&dir, "temp_raw.jpg", ImageFormat::Jpeg, 100);
        let raw_size = fs::metadata(&raw).unwrap().len();
        let target = dir.path().join("out.jpg");

        let output = optimize(&raw, &target, ImageFormat::Jpeg, 50).unwrap();
        assert!(output.reencoded);
        assert!(output.byte_size < raw_size);
    }

    #[test]
    fn test_format_is_never_downgraded() {
        let dir = TempDir::new().unwrap();
        let raw = write_raw(&dir, "temp_raw.png", ImageFormat::Png, 90);
        let target = dir.path().join("out.webp");

        optimize(&raw, &target, ImageFormat::Webp, 80).unwrap();
        let written = fs::read(&target).unwrap();
        assert_eq!(image::guess_format(&written).unwrap(), image::ImageFormat::WebP);
    }

    #[test]
    fn test_inspect_reads_real_dimensions() {
        let dir = TempDir::new().unwrap();
        let path = write_raw(&dir, "shot.png", ImageFormat::Png, 90);
        let output = inspect(&path).unwrap();
        assert_eq!((output.width, output.height), (320, 240));
        assert!(output.byte_size > 0);
    }

    #[test]
    fn test_corrupt_input_is_a_transform_error() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("temp_bad.png");
        fs::write(&raw, b"definitely not an image").unwrap();
        let target = dir.path().join("out.png");

        assert!(matches!(
            optimize(&raw, &target, ImageFormat::Png, 90),
            Err(CaptureError::Transform(_))
        ));
        assert!(!target.exists());
    }
}
