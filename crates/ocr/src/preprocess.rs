use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use imageproc::filter::filter3x3;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("Invalid preprocessing config: {0}")]
    InvalidConfig(String),
    #[error("Failed to encode processed image: {0}")]
    Encode(String),
}

/// Tuning for the OCR preparation pass. Defaults match what works on a
/// phone photo of a KTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub greyscale: bool,
    /// Contrast change in percent, -100..=100.
    pub contrast: i32,
    /// Sharpen amount, 0..=100.
    pub sharpen: u32,
    /// Number of 3×3 Gaussian passes.
    pub blur: Option<u32>,
    pub resize_width: u32,
    /// When false, images already narrower than `resize_width` keep their size.
    pub allow_upscale: bool,
    /// Intensity ceiling: samples above it are clamped down to it.
    pub truncate_threshold: Option<u8>,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            greyscale: true,
            contrast: 10,
            sharpen: 15,
            blur: Some(1),
            resize_width: 1200,
            allow_upscale: true,
            truncate_threshold: Some(127),
        }
    }
}

impl PreprocessConfig {
    pub fn validate(&self) -> Result<(), PreprocessError> {
        if self.resize_width == 0 {
            return Err(PreprocessError::InvalidConfig("resize_width must be > 0".into()));
        }
        if !(-100..=100).contains(&self.contrast) {
            return Err(PreprocessError::InvalidConfig(format!(
                "contrast must be within -100..=100, got {}",
                self.contrast
            )));
        }
        if self.sharpen > 100 {
            return Err(PreprocessError::InvalidConfig(format!(
                "sharpen must be within 0..=100, got {}",
                self.sharpen
            )));
        }
        if let Some(passes) = self.blur.filter(|&p| p > MAX_BLUR_PASSES) {
            return Err(PreprocessError::InvalidConfig(format!(
                "blur must be within 0..={MAX_BLUR_PASSES}, got {passes}"
            )));
        }
        Ok(())
    }
}

/// 3×3 Gaussian, normalized to sum to one.
const GAUSSIAN_3X3: [f32; 9] = [
    1.0 / 16.0, 2.0 / 16.0, 1.0 / 16.0,
    2.0 / 16.0, 4.0 / 16.0, 2.0 / 16.0,
    1.0 / 16.0, 2.0 / 16.0, 1.0 / 16.0,
];

/// Largest decoded upload the chain will work on.
pub const MAX_INPUT_PIXELS: u64 = 40_000_000;
/// Largest image the resize step may produce.
pub const MAX_OUTPUT_PIXELS: u64 = 12_000_000;
pub const MAX_BLUR_PASSES: u32 = 10;

/// Decode uploaded bytes (JPEG / PNG / WEBP / …).
pub fn decode(data: &[u8]) -> Result<DynamicImage, PreprocessError> {
    if data.is_empty() {
        return Err(PreprocessError::InvalidImage("empty image data".into()));
    }
    image::load_from_memory(data).map_err(|e| PreprocessError::InvalidImage(e.to_string()))
}

/// Validate the config, decode the upload and run the full transform chain.
pub fn prepare_for_ocr(
    data: &[u8],
    config: &PreprocessConfig,
) -> Result<DynamicImage, PreprocessError> {
    config.validate()?;
    let img = decode(data)?;
    check_dimensions(img.width(), img.height(), config)?;
    Ok(preprocess(img, config))
}

/// Reject images whose decoded or resized size exceeds the pixel bounds.
pub fn check_dimensions(width: u32, height: u32, config: &PreprocessConfig) -> Result<(), PreprocessError> {
    let input = u64::from(width) * u64::from(height);
    if input > MAX_INPUT_PIXELS {
        return Err(PreprocessError::InvalidImage(format!(
            "image of {width}x{height} exceeds {MAX_INPUT_PIXELS} pixels"
        )));
    }
    let (w, h) = target_dimensions(width, height, config.resize_width, config.allow_upscale);
    if u64::from(w) * u64::from(h) > MAX_OUTPUT_PIXELS {
        return Err(PreprocessError::InvalidImage(format!(
            "image of {width}x{height} would resize to {w}x{h}, over {MAX_OUTPUT_PIXELS} pixels"
        )));
    }
    Ok(())
}

/// greyscale → contrast → sharpen → blur → resize → truncate.
/// Untrusted uploads go through [`prepare_for_ocr`], which bounds the pixel counts first.
pub fn preprocess(img: DynamicImage, config: &PreprocessConfig) -> DynamicImage {
    let img = if config.greyscale {
        DynamicImage::ImageLuma8(img.to_luma8())
    } else {
        DynamicImage::ImageRgb8(img.to_rgb8())
    };

    let img = if config.contrast != 0 {
        img.adjust_contrast(config.contrast as f32)
    } else {
        img
    };

    let img = if config.sharpen > 0 {
        convolve3x3(img, &sharpen_kernel(config.sharpen))
    } else {
        img
    };

    let passes = config.blur.unwrap_or(0);
    let img = (0..passes).fold(img, |acc, _| convolve3x3(acc, &GAUSSIAN_3X3));

    let img = resize_to_width(img, config.resize_width, config.allow_upscale);

    match config.truncate_threshold {
        Some(threshold) => truncate(img, threshold),
        None => img,
    }
}

/// Edge-enhancing kernel whose weights sum to one, so flat regions are unchanged.
pub fn sharpen_kernel(amount: u32) -> [f32; 9] {
    let amount = amount.min(100) as f32;
    let corner = if amount >= 10.0 { amount * -0.01 } else { 0.0 };
    let edge = amount * -0.025;
    let centre = 1.0 - 4.0 * (corner + edge);
    [corner, edge, corner, edge, centre, edge, corner, edge, corner]
}

/// Output size for a resize to `target` width. Height follows the aspect ratio;
/// neither side drops below one pixel.
pub fn target_dimensions(width: u32, height: u32, target: u32, allow_upscale: bool) -> (u32, u32) {
    if width == 0 || height == 0 || (!allow_upscale && width <= target) {
        return (width.max(1), height.max(1));
    }
    let scaled = (f64::from(height) * f64::from(target) / f64::from(width)).round();
    (target.max(1), (scaled as u32).max(1))
}

fn convolve3x3(img: DynamicImage, kernel: &[f32; 9]) -> DynamicImage {
    match img {
        DynamicImage::ImageLuma8(buf) => DynamicImage::ImageLuma8(filter3x3::<_, f32, u8>(&buf, kernel)),
        DynamicImage::ImageRgb8(buf) => DynamicImage::ImageRgb8(filter3x3::<_, f32, u8>(&buf, kernel)),
        other => DynamicImage::ImageRgb8(filter3x3::<_, f32, u8>(&other.to_rgb8(), kernel)),
    }
}

fn resize_to_width(img: DynamicImage, target: u32, allow_upscale: bool) -> DynamicImage {
    let (w, h) = target_dimensions(img.width(), img.height(), target, allow_upscale);
    if (w, h) == (img.width(), img.height()) {
        img
    } else {
        img.resize_exact(w, h, FilterType::CatmullRom)
    }
}

/// Clamp every sample above `threshold` down to it; samples at or below are
/// left alone. Runs over the pixel buffer in place.
pub fn truncate(img: DynamicImage, threshold: u8) -> DynamicImage {
    match img {
        DynamicImage::ImageLuma8(mut buf) => {
            truncate_in_place(&mut buf, threshold);
            DynamicImage::ImageLuma8(buf)
        }
        DynamicImage::ImageRgb8(mut buf) => {
            clamp_samples(&mut buf, threshold);
            DynamicImage::ImageRgb8(buf)
        }
        other => {
            let mut buf = other.to_rgb8();
            clamp_samples(&mut buf, threshold);
            DynamicImage::ImageRgb8(buf)
        }
    }
}

pub fn truncate_in_place(buf: &mut GrayImage, threshold: u8) {
    clamp_samples(buf, threshold);
}

fn clamp_samples(samples: &mut [u8], threshold: u8) {
    samples.iter_mut().for_each(|s| *s = (*s).min(threshold));
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, PreprocessError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| PreprocessError::Encode(e.to_string()))?;
    Ok(buf)
}

pub fn write_png(img: &DynamicImage, path: &Path) -> Result<(), PreprocessError> {
    img.save_with_format(path, image::ImageFormat::Png)
        .map_err(|e| PreprocessError::Encode(e.to_string()))
}
