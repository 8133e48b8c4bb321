//! Decoded RGB raster shared by every pipeline stage.
//!
//! An [`ImageBuffer`] is immutable once built: cropping, resizing and
//! warping all return new instances.

use crate::geometry::Rect;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("failed to encode image: {0}")]
    Encode(String),
    #[error("image dimensions must be non-zero, got {width}x{height}")]
    ZeroDimensions { width: u32, height: u32 },
    #[error("pixel buffer length {actual} does not match {width}x{height}x3 = {expected}")]
    BufferLength {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// Row-major RGB image with non-zero dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuffer {
    inner: RgbImage,
}

impl ImageBuffer {
    /// Decode JPEG/PNG (or any format enabled in the `image` crate) bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ImageError> {
        let decoded = image::load_from_memory(bytes).map_err(|e| ImageError::Decode(e.to_string()))?;
        Self::from_rgb_image(decoded.to_rgb8())
    }

    /// Wrap an already-decoded interleaved RGB buffer.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, ImageError> {
        if width == 0 || height == 0 {
            return Err(ImageError::ZeroDimensions { width, height });
        }
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(ImageError::BufferLength {
                width,
                height,
                expected,
                actual: pixels.len(),
            });
        }
        let inner = RgbImage::from_raw(width, height, pixels).ok_or(ImageError::BufferLength {
            width,
            height,
            expected,
            actual: 0,
        })?;
        Ok(Self { inner })
    }

    pub fn from_rgb_image(inner: RgbImage) -> Result<Self, ImageError> {
        let (width, height) = inner.dimensions();
        if width == 0 || height == 0 {
            return Err(ImageError::ZeroDimensions { width, height });
        }
        Ok(Self { inner })
    }

    /// Build an image by evaluating `f(x, y)` for every pixel.
    pub fn from_fn(
        width: u32,
        height: u32,
        mut f: impl FnMut(u32, u32) -> [u8; 3],
    ) -> Result<Self, ImageError> {
        Self::from_rgb_image(RgbImage::from_fn(width, height, |x, y| Rgb(f(x, y))))
    }

    /// A single-colour image.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self, ImageError> {
        Self::from_fn(width, height, |_, _| rgb)
    }

    pub fn width(&self) -> u32 {
        self.inner.width()
    }

    pub fn height(&self) -> u32 {
        self.inner.height()
    }

    /// Interleaved RGB bytes, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.inner.as_raw()
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        self.inner.get_pixel(x, y).0
    }

    pub fn as_rgb_image(&self) -> &RgbImage {
        &self.inner
    }

    /// Luma plane using BT.601 weights.
    pub fn to_gray(&self) -> Vec<u8> {
        self.inner
            .pixels()
            .map(|p| {
                let [r, g, b] = p.0;
                (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32)
                    .round()
                    .clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// Crop to `region` after clamping it to the image bounds.
    ///
    /// Returns `None` when the clamped region is narrower or shorter than
    /// `min_size` pixels.
    pub fn crop(&self, region: &Rect, min_size: u32) -> Option<ImageBuffer> {
        let clamped = region.clamp_to(self.width() as f32, self.height() as f32)?;
        let x = clamped.x.floor() as u32;
        let y = clamped.y.floor() as u32;
        let w = (clamped.right().ceil() as u32).min(self.width()).saturating_sub(x);
        let h = (clamped.bottom().ceil() as u32).min(self.height()).saturating_sub(y);
        if w < min_size.max(1) || h < min_size.max(1) {
            return None;
        }
        let inner = imageops::crop_imm(&self.inner, x, y, w, h).to_image();
        Some(Self { inner })
    }

    /// Bilinear resize to exactly `width` x `height`.
    pub fn resize(&self, width: u32, height: u32) -> ImageBuffer {
        if width == self.width() && height == self.height() {
            return self.clone();
        }
        let inner = imageops::resize(&self.inner, width.max(1), height.max(1), FilterType::Triangle);
        Self { inner }
    }

    /// Encode as PNG, mostly for fixtures and debugging dumps.
    pub fn encode_png(&self) -> Result<Vec<u8>, ImageError> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(self.inner.clone())
            .write_to(&mut out, ImageFormat::Png)
            .map_err(|e| ImageError::Encode(e.to_string()))?;
        Ok(out.into_inner())
    }
}
