//! Error types for host image operations.
//!
//! # Usage
//!
//! ```rust
//! use gpip_core::{ImageError, PackedImage};
//!
//! let err = PackedImage::from_vec(vec![0u8; 5], 2, 2, 1).unwrap_err();
//! assert!(matches!(err, ImageError::SizeMismatch { expected: 4, actual: 5 }));
//! ```

use thiserror::Error;

/// Result type alias using [`ImageError`].
pub type Result<T> = std::result::Result<T, ImageError>;

/// Errors raised while building or accessing a [`PackedImage`](crate::PackedImage).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageError {
    /// Width or height is zero.
    #[error("invalid dimensions: {width}x{height}")]
    InvalidDimensions {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
    },

    /// Channel count outside `1..=MAX_CHANNELS`.
    #[error("unsupported channel count: {0} (expected 1-4)")]
    UnsupportedChannels(u32),

    /// Pixel buffer length does not match `width * height * channels`.
    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Bytes required by the geometry.
        expected: usize,
        /// Bytes supplied.
        actual: usize,
    },

    /// Pixel coordinates outside the image.
    #[error("pixel ({x}, {y}) out of bounds for {width}x{height} image")]
    OutOfBounds {
        /// Requested x.
        x: u32,
        /// Requested y.
        y: u32,
        /// Image width.
        width: u32,
        /// Image height.
        height: u32,
    },
}
