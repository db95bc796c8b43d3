//! Host-side orchestration for a GPU image-filter pipeline.
//!
//! Manages a compute device, stages one packed `u8` image to and from device
//! memory, compiles per-filter kernels and runs an ordered chain of filters
//! against the single device-resident image buffer.
//!
//! # Architecture
//!
//! ```text
//! GpuImageProcessor
//!     ├── DeviceContext ── Arc<dyn ComputeDevice>
//!     │                        ├── CpuDevice  (rayon reference kernels)
//!     │                        └── WgpuDevice (WGSL compute pipelines)
//!     ├── CommandQueue (in-order, fenced stage boundaries)
//!     ├── DeviceTransferManager (device image buffer + host staging buffer)
//!     └── Vec<Box<dyn Filter>>
//!             ├── KernelFilter   (one compiled kernel + auxiliary buffers)
//!             └── CompoundFilter (Open / Close)
//! ```
//!
//! # Example
//!
//! ```
//! use gpip_compute::{FilterKind, GpuImageProcessor, PipelineBuilder, Backend};
//! use gpip_core::PackedImage;
//!
//! let mut proc = PipelineBuilder::new()
//!     .backend(Backend::Cpu)
//!     .build(4, 4, 1)?;
//! proc.add(FilterKind::Close)?;
//!
//! let mut img = PackedImage::filled(4, 4, 1, 100)?;
//! img.set_pixel(2, 2, &[0])?;
//!
//! proc.send_image(&img)?;
//! let report = proc.process();
//! assert!(report.all_succeeded());
//! let out = proc.receive_image()?;
//! assert!(out.as_bytes().iter().all(|&v| v == 100));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod context;
pub mod device;
pub mod filter;
pub mod kernels;
pub mod processor;
pub mod transfer;

pub use config::{FailurePolicy, PipelineBuilder, PipelineConfig};
pub use context::{CommandQueue, CompiledKernel, DeviceBuffer, DeviceContext, KernelArgs, SyncPolicy};
#[cfg(feature = "wgpu")]
pub use device::WgpuDevice;
pub use device::{
    Backend, BufferAccess, BuildOptions, ComputeDevice, CpuDevice, DeviceLimits, Fence, KernelArg,
    LaunchGeometry, describe_backends, detect_backends, select_best_backend,
};
pub use filter::{
    CompoundFilter, CompoundStage, Filter, FilterCategory, FilterKind, GradientOperator,
    KernelFilter, KernelSpec, LookupTable, Scalar,
};
pub use kernels::KernelSource;
pub use processor::{GpuImageProcessor, ProcessReport, StageOutcome, StageStatus};
pub use transfer::{DeviceImage, DeviceTransferManager, HostStagingBuffer};

use gpip_core::ImageError;
use thiserror::Error;

/// Coarse classification of device errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// No usable device, or the context/queue is unusable.
    InvalidContext,
    /// A buffer is missing, mistyped or too small.
    InvalidBuffer,
    /// Device or host memory could not be allocated.
    AllocationFailure,
    /// Program compilation or kernel creation failed.
    BuildFailure,
    /// A kernel argument or launch parameter is invalid.
    InvalidArgument,
    /// Anything else reported by the device.
    Other,
}

/// Device operation errors.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("No suitable compute device found")]
    NoDevice,

    #[error("Backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("Invalid device context: {0}")]
    InvalidContext(String),

    #[error("Invalid buffer: {0}")]
    InvalidBuffer(String),

    #[error("Image needs {required} bytes but the device buffer holds {capacity}")]
    CapacityExceeded { capacity: usize, required: usize },

    #[error("Failed to allocate {size} bytes for `{label}`: {reason}")]
    AllocationFailure { label: String, size: u64, reason: String },

    #[error("Failed to build kernel `{entry}`:\n{log}")]
    BuildFailure { entry: String, log: String },

    #[error("Invalid kernel argument {index}: {reason}")]
    InvalidArgument { index: usize, reason: String },

    #[error("Invalid image: {0}")]
    Image(#[from] ImageError),

    #[error("Device operation failed: {0}")]
    Other(String),
}

impl DeviceError {
    /// Error classification.
    pub fn kind(&self) -> DeviceErrorKind {
        match self {
            Self::NoDevice | Self::BackendNotAvailable(_) | Self::InvalidContext(_) => {
                DeviceErrorKind::InvalidContext
            }
            Self::InvalidBuffer(_) | Self::CapacityExceeded { .. } => DeviceErrorKind::InvalidBuffer,
            Self::AllocationFailure { .. } => DeviceErrorKind::AllocationFailure,
            Self::BuildFailure { .. } => DeviceErrorKind::BuildFailure,
            Self::InvalidArgument { .. } | Self::Image(_) => DeviceErrorKind::InvalidArgument,
            Self::Other(_) => DeviceErrorKind::Other,
        }
    }

    /// Fatal errors abort pipeline construction and halt processing.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            DeviceErrorKind::InvalidContext
                | DeviceErrorKind::AllocationFailure
                | DeviceErrorKind::BuildFailure
        )
    }

    /// Compiler log of a build failure.
    pub fn build_log(&self) -> Option<&str> {
        match self {
            Self::BuildFailure { log, .. } => Some(log),
            _ => None,
        }
    }

    pub(crate) fn argument(index: usize, reason: impl Into<String>) -> Self {
        Self::InvalidArgument { index, reason: reason.into() }
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds() {
        assert!(DeviceError::NoDevice.is_fatal());
        assert!(DeviceError::BuildFailure { entry: "erode".into(), log: "x".into() }.is_fatal());
        assert!(
            DeviceError::AllocationFailure { label: "img".into(), size: 4, reason: "oom".into() }
                .is_fatal()
        );
        assert!(!DeviceError::argument(3, "bad").is_fatal());
        assert!(!DeviceError::CapacityExceeded { capacity: 4, required: 8 }.is_fatal());
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            DeviceError::CapacityExceeded { capacity: 1, required: 2 }.kind(),
            DeviceErrorKind::InvalidBuffer
        );
        assert_eq!(
            DeviceError::from(ImageError::UnsupportedChannels(7)).kind(),
            DeviceErrorKind::InvalidArgument
        );
        assert_eq!(DeviceError::Other("x".into()).kind(), DeviceErrorKind::Other);
    }

    #[test]
    fn test_build_log_exposed() {
        let err = DeviceError::BuildFailure { entry: "median".into(), log: "line 3: oops".into() };
        assert_eq!(err.build_log(), Some("line 3: oops"));
        assert!(err.to_string().contains("line 3: oops"));
        assert_eq!(DeviceError::NoDevice.build_log(), None);
    }
}
