//! Packed host image.
//!
//! # Memory Layout
//!
//! Pixels are stored **row-major**, top-to-bottom, channels interleaved:
//!
//! ```text
//! Memory: [R G B R G B R G B ...]  <- Row 0
//!         [R G B R G B R G B ...]  <- Row 1
//!         ...
//! ```
//!
//! This is the exact byte layout of the device image buffer, so uploads and
//! downloads are plain memcpys.
//!
//! # Usage
//!
//! ```rust
//! use gpip_core::PackedImage;
//!
//! let mut img = PackedImage::filled(4, 4, 1, 100).unwrap();
//! img.set_pixel(2, 2, &[0]).unwrap();
//! assert_eq!(img.pixel(2, 2).unwrap(), &[0]);
//! assert_eq!(img.pixel(1, 1).unwrap(), &[100]);
//! ```

use crate::{ImageError, Result};

/// Largest supported channel count (RGBA).
pub const MAX_CHANNELS: u32 = 4;

/// Packed, interleaved `u8` image with a fixed channel count.
#[derive(Clone, PartialEq, Eq)]
pub struct PackedImage {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u32,
}

impl PackedImage {
    /// Checks a geometry and returns its byte size.
    ///
    /// Rejects zero dimensions and channel counts outside `1..=4`.
    pub fn byte_size(width: u32, height: u32, channels: u32) -> Result<usize> {
        if width == 0 || height == 0 {
            return Err(ImageError::InvalidDimensions { width, height });
        }
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(ImageError::UnsupportedChannels(channels));
        }
        Ok(width as usize * height as usize * channels as usize)
    }

    /// Creates a zero-filled image.
    pub fn new(width: u32, height: u32, channels: u32) -> Result<Self> {
        Self::filled(width, height, channels, 0)
    }

    /// Creates an image with every byte set to `value`.
    pub fn filled(width: u32, height: u32, channels: u32, value: u8) -> Result<Self> {
        let size = Self::byte_size(width, height, channels)?;
        Ok(Self { data: vec![value; size], width, height, channels })
    }

    /// Wraps existing packed pixel data.
    pub fn from_vec(data: Vec<u8>, width: u32, height: u32, channels: u32) -> Result<Self> {
        let expected = Self::byte_size(width, height, channels)?;
        if data.len() != expected {
            return Err(ImageError::SizeMismatch { expected, actual: data.len() });
        }
        Ok(Self { data, width, height, channels })
    }

    /// Builds an image by evaluating `f(x, y, channel)` for every byte.
    pub fn from_fn<F>(width: u32, height: u32, channels: u32, f: F) -> Result<Self>
    where
        F: Fn(u32, u32, u32) -> u8,
    {
        let mut img = Self::new(width, height, channels)?;
        for y in 0..height {
            for x in 0..width {
                let base = img.offset(x, y);
                for c in 0..channels {
                    img.data[base + c as usize] = f(x, y, c);
                }
            }
        }
        Ok(img)
    }

    /// Width in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Channels per pixel.
    #[inline]
    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// `(width, height, channels)`.
    pub fn dimensions(&self) -> (u32, u32, u32) {
        (self.width, self.height, self.channels)
    }

    /// Total byte length (`width * height * channels`).
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Raw packed bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable raw packed bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consumes the image, returning its bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Channel bytes of the pixel at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> Result<&[u8]> {
        self.check_bounds(x, y)?;
        let base = self.offset(x, y);
        Ok(&self.data[base..base + self.channels as usize])
    }

    /// Overwrites the pixel at `(x, y)`.
    ///
    /// `value` must hold exactly `channels` bytes.
    pub fn set_pixel(&mut self, x: u32, y: u32, value: &[u8]) -> Result<()> {
        self.check_bounds(x, y)?;
        if value.len() != self.channels as usize {
            return Err(ImageError::SizeMismatch {
                expected: self.channels as usize,
                actual: value.len(),
            });
        }
        let base = self.offset(x, y);
        self.data[base..base + value.len()].copy_from_slice(value);
        Ok(())
    }

    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * self.channels as usize
    }

    fn check_bounds(&self, x: u32, y: u32) -> Result<()> {
        if x >= self.width || y >= self.height {
            return Err(ImageError::OutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for PackedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("byte_len", &self.data.len())
            .finish()
    }
}
