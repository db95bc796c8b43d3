//! # gpip-core
//!
//! Host-side types shared by the gpip GPU image-filter pipeline.
//!
//! - [`PackedImage`] - Packed, interleaved, row-major `u8` image
//! - [`ImageError`] - Validation errors for host images
//!
//! ## Crate Structure
//!
//! ```text
//! gpip-core (this crate)
//!    ^
//!    |
//!    +-- gpip-compute (devices, transfer manager, filters, pipeline)
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod image;

pub use error::{ImageError, Result};
pub use image::{MAX_CHANNELS, PackedImage};
