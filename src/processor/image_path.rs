//! Image resize/encode path: probe format, resize, encode, verify non-empty
//! output. This does a `cover` fit rather than a fit-inside: resize so the
//! shorter side fills the target square, then center-crop the rest.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::{DynamicImage, ImageEncoder, ImageFormat, ImageReader, imageops};
use uuid::Uuid;

use crate::error::ProcessorError;

use super::{ProcessedThumbnail, ProcessorParams, ProgressFn};

pub async fn process_image_bytes(
    data: &[u8],
    output_dir: &Path,
    params: &ProcessorParams<'_>,
    progress: &ProgressFn<'_>,
) -> Result<ProcessedThumbnail, ProcessorError> {
    progress(40);

    let reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| ProcessorError::ProbeFailed(e.to_string()))?;
    let format = reader.format();
    let img = reader
        .decode()
        .map_err(|e| ProcessorError::ProbeFailed(e.to_string()))?;

    let is_jpeg = matches!(format, Some(ImageFormat::Jpeg));
    let size = params.thumbnail_size;
    let cropped = cover_crop(img, size, size);

    let extension = if is_jpeg { "jpg" } else { "png" };
    let file_name = format!("thumb_{}.{extension}", Uuid::new_v4());
    let thumbnail_path = output_dir.join(&file_name);

    tokio::fs::create_dir_all(output_dir).await?;
    let encoded = encode(&cropped, is_jpeg, params.jpeg_quality)?;
    tokio::fs::write(&thumbnail_path, &encoded).await?;

    let written = tokio::fs::metadata(&thumbnail_path).await?;
    if written.len() == 0 {
        return Err(ProcessorError::EmptyOutput);
    }

    progress(80);

    Ok(ProcessedThumbnail {
        thumbnail_path,
        width: cropped.width(),
        height: cropped.height(),
    })
}

/// Resize so the image fully covers a `target_w x target_h` box, then
/// center-crop the overflow — `resize_to_fill` is exactly a cover fit,
/// anchored center, in one call.
fn cover_crop(img: DynamicImage, target_w: u32, target_h: u32) -> DynamicImage {
    img.resize_to_fill(target_w, target_h, imageops::FilterType::Triangle)
}

// `image`'s baseline encoders don't expose a progressive-scan knob; quality
// and compression level still follow the configured settings. See DESIGN.md.
fn encode(img: &DynamicImage, as_jpeg: bool, quality: u8) -> Result<Vec<u8>, ProcessorError> {
    let mut buf = Vec::new();
    if as_jpeg {
        let rgb = img.to_rgb8();
        let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
        encoder
            .write_image(
                rgb.as_raw(),
                rgb.width(),
                rgb.height(),
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| ProcessorError::EncodeFailed(e.to_string()))?;
    } else {
        let rgba = img.to_rgba8();
        let encoder = PngEncoder::new_with_quality(
            &mut buf,
            CompressionType::Best,
            PngFilterType::Adaptive,
        );
        encoder
            .write_image(
                rgba.as_raw(),
                rgba.width(),
                rgba.height(),
                image::ExtendedColorType::Rgba8,
            )
            .map_err(|e| ProcessorError::EncodeFailed(e.to_string()))?;
    }
    Ok(buf)
}

/// Used by the video path to run the same resize+encode over an already
/// extracted JPEG frame.
pub async fn process_frame_file(
    frame_path: &Path,
    output_dir: &Path,
    params: &ProcessorParams<'_>,
) -> Result<ProcessedThumbnail, ProcessorError> {
    let data = tokio::fs::read(frame_path).await?;
    let img = ImageReader::new(Cursor::new(&data))
        .with_guessed_format()
        .map_err(|e| ProcessorError::ProbeFailed(e.to_string()))?
        .decode()
        .map_err(|e| ProcessorError::ProbeFailed(e.to_string()))?;

    let size = params.thumbnail_size;
    let cropped = cover_crop(img, size, size);

    let file_name = format!("thumb_{}.jpg", Uuid::new_v4());
    let thumbnail_path: PathBuf = output_dir.join(&file_name);
    tokio::fs::create_dir_all(output_dir).await?;
    let encoded = encode(&cropped, true, params.jpeg_quality)?;
    tokio::fs::write(&thumbnail_path, &encoded).await?;

    let written = tokio::fs::metadata(&thumbnail_path).await?;
    if written.len() == 0 {
        return Err(ProcessorError::EmptyOutput);
    }

    Ok(ProcessedThumbnail {
        thumbnail_path,
        width: cropped.width(),
        height: cropped.height(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_jpeg(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            w,
            h,
            image::Rgb([200, 50, 50]),
        ));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn cover_fit_produces_exact_square() {
        let dir = tempfile::tempdir().unwrap();
        let data = solid_jpeg(640, 480);
        let params = ProcessorParams {
            thumbnail_size: 128,
            jpeg_quality: 80,
            video_capture_time: "00:00:01",
        };
        let result = process_image_bytes(&data, dir.path(), &params, &|_p| {})
            .await
            .unwrap();
        assert_eq!(result.width, 128);
        assert_eq!(result.height, 128);
        assert!(result.thumbnail_path.extension().unwrap() == "jpg");
        let meta = tokio::fs::metadata(&result.thumbnail_path).await.unwrap();
        assert!(meta.len() > 0);
    }

    #[tokio::test]
    async fn non_jpeg_input_encodes_as_png() {
        let dir = tempfile::tempdir().unwrap();
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            64,
            64,
            image::Rgb([10, 20, 30]),
        ));
        let mut data = Vec::new();
        img.write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
            .unwrap();
        let params = ProcessorParams {
            thumbnail_size: 32,
            jpeg_quality: 80,
            video_capture_time: "00:00:01",
        };
        let result = process_image_bytes(&data, dir.path(), &params, &|_p| {})
            .await
            .unwrap();
        assert_eq!(result.thumbnail_path.extension().unwrap(), "png");
    }
}
