use std::io::Cursor;
use std::path::Path;

use image::error::{
    ImageFormatHint, LimitError, LimitErrorKind, UnsupportedError, UnsupportedErrorKind,
};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageError, ImageReader, Limits};
use ndarray::Array3;
use tracing::{debug, instrument};

use crate::config::{DetectorConfig, Mode, SizePolicy};
use crate::error::DetectorError;

/// Decodes compressed image bytes, enforcing the configured decoder limits.
#[instrument(skip(config, raw_bytes), fields(input_size = raw_bytes.len()))]
pub fn decode_bytes(config: &DetectorConfig, raw_bytes: &[u8]) -> Result<DynamicImage, DetectorError> {
    if raw_bytes.len() > config.max_input_bytes {
        return Err(ImageError::Limits(LimitError::from_kind(LimitErrorKind::InsufficientMemory)).into());
    }

    let reader = ImageReader::new(Cursor::new(raw_bytes))
        .with_guessed_format()
        .map_err(ImageError::IoError)?;

    if reader.format().is_none() {
        return Err(unknown_format().into());
    }

    decode_with_limits(config, reader)
}

/// Opens and decodes an image file. A missing or unreadable file is a decode error.
#[instrument(skip(config))]
pub fn decode_path(config: &DetectorConfig, path: &Path) -> Result<DynamicImage, DetectorError> {
    let reader = ImageReader::open(path)
        .map_err(ImageError::IoError)?
        .with_guessed_format()
        .map_err(ImageError::IoError)?;

    if reader.format().is_none() {
        return Err(unknown_format().into());
    }

    decode_with_limits(config, reader)
}

fn decode_with_limits<R>(config: &DetectorConfig, mut reader: ImageReader<R>) -> Result<DynamicImage, DetectorError>
where
    R: std::io::BufRead + std::io::Seek,
{
    let mut limits = Limits::default();
    limits.max_image_width = Some(config.max_dimension);
    limits.max_image_height = Some(config.max_dimension);
    limits.max_alloc = Some(config.max_alloc_bytes);
    reader.limits(limits);

    Ok(reader.decode()?)
}

fn unknown_format() -> ImageError {
    ImageError::Unsupported(UnsupportedError::from_format_and_kind(
        ImageFormatHint::Unknown,
        UnsupportedErrorKind::Format(ImageFormatHint::Unknown),
    ))
}

/// Uniform scale factor for an image under a size policy.
///
/// The shortest side is brought to `min_side`, unless that pushes the longest
/// side past `max_side`, in which case the longest side is pinned to `max_side`.
pub fn compute_scale(width: u32, height: u32, policy: SizePolicy) -> Result<f64, DetectorError> {
    if width == 0 || height == 0 {
        return Err(DetectorError::InvalidImage { width, height });
    }

    let smallest = width.min(height) as f64;
    let largest = width.max(height) as f64;

    let mut scale = policy.min_side as f64 / smallest;
    if largest * scale > policy.max_side as f64 {
        scale = scale.min(policy.max_side as f64 / largest);
    }

    Ok(scale)
}

/// Pixel dimensions after applying `scale`, never below one pixel.
pub fn resized_dimensions(width: u32, height: u32, scale: f64) -> (u32, u32) {
    let w = (width as f64 * scale).round().max(1.0) as u32;
    let h = (height as f64 * scale).round().max(1.0) as u32;
    (w, h)
}

/// Resizes `image` for `mode` and lays it out as a planar `[3, H, W]` tensor
/// with values in `[0, 1]`.
///
/// Returns the tensor together with the scale that maps original pixel
/// coordinates into tensor coordinates. No batch axis is added here.
#[instrument(skip(image), fields(width = image.width(), height = image.height()))]
pub fn preprocess(image: &DynamicImage, mode: Mode) -> Result<(Array3<f32>, f64), DetectorError> {
    let (orig_w, orig_h) = image.dimensions();
    let scale = compute_scale(orig_w, orig_h, mode.size_policy())?;
    let (new_w, new_h) = resized_dimensions(orig_w, orig_h, scale);

    let rgb = image.to_rgb8();
    let resized = if (new_w, new_h) == (orig_w, orig_h) {
        rgb
    } else {
        image::imageops::resize(&rgb, new_w, new_h, FilterType::Triangle)
    };

    debug!(new_w, new_h, scale, "resized image");

    Ok((to_planar(&resized), scale))
}

/// Interleaved RGB8 to planar CHW, normalized by 255.
fn to_planar(rgb: &image::RgbImage) -> Array3<f32> {
    let (width, height) = rgb.dimensions();
    let mut tensor = Array3::<f32>::zeros((3, height as usize, width as usize));

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        tensor[[0, y, x]] = pixel[0] as f32 / 255.0;
        tensor[[1, y, x]] = pixel[1] as f32 / 255.0;
        tensor[[2, y, x]] = pixel[2] as f32 / 255.0;
    }

    tensor
}
