//! Filters: one capability trait, a primitive single-kernel filter, compound
//! morphology filters and the [`FilterKind`] catalog.
//!
//! # Categories
//!
//! | Category | Reads | Examples |
//! |---|---|---|
//! | `ContextFree` | the pixel itself | LUT, binarization, RGB2HSV |
//! | `Lowpass` | neighborhood, linear | mean, weighted mean |
//! | `Highpass` | neighborhood, linear | Sobel, Prewitt, Roberts, Laplace, corners |
//! | `Morphology` | neighborhood, non-linear | erode, dilate, open, close |
//! | `OrderStatistic` | neighborhood, non-linear | min, max, median |
//!
//! # Example
//!
//! ```
//! use gpip_compute::{FilterKind, GradientOperator};
//!
//! let sobel = FilterKind::Gradient { operator: GradientOperator::Sobel, threshold: 40 };
//! assert_eq!(sobel.name(), "sobel");
//! assert!(sobel.category().is_linear());
//! assert!(FilterKind::Open.is_compound());
//! ```

mod compound;
mod masks;
mod primitive;

pub use compound::{CompoundFilter, CompoundStage};
pub use masks::{GradientOperator, LookupTable, Mask3, mask_bytes, mean_mask, normalization};
pub use primitive::{KernelFilter, KernelSpec, Scalar};

use tracing::warn;

use crate::context::{CommandQueue, DeviceContext};
use crate::device::BuildOptions;
use crate::kernels::KernelSource;
use crate::transfer::DeviceTransferManager;
use crate::{DeviceError, DeviceResult};

/// Largest median halo (9x9 window).
pub const MAX_MEDIAN_HALO: u32 = 4;

/// Default center coefficient of [`FilterKind::MeanVariableCentralPoint`].
pub const DEFAULT_CENTER_WEIGHT: f32 = 0.0;

/// What a filter reads to produce one output pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterCategory {
    /// Point-wise.
    ContextFree,
    /// Linear smoothing.
    Lowpass,
    /// Linear edge response.
    Highpass,
    /// Non-linear min/max structuring.
    Morphology,
    /// Non-linear rank selection.
    OrderStatistic,
}

impl FilterCategory {
    /// Reads a neighborhood, so needs a halo and scratch tile.
    pub fn is_context(&self) -> bool {
        !matches!(self, Self::ContextFree)
    }

    pub fn is_linear(&self) -> bool {
        matches!(self, Self::Lowpass | Self::Highpass)
    }
}

/// One pipeline step.
pub trait Filter: Send {
    fn name(&self) -> &str;

    fn category(&self) -> FilterCategory;

    /// Bind arguments and enqueue without waiting for completion.
    fn bind_and_launch(&mut self, queue: &CommandQueue) -> DeviceResult<()>;

    /// [`bind_and_launch`](Self::bind_and_launch) with the error logged.
    fn filter(&mut self, queue: &CommandQueue) -> bool {
        match self.bind_and_launch(queue) {
            Ok(()) => true,
            Err(err) => {
                warn!(filter = self.name(), kind = ?err.kind(), error = %err, "filter failed");
                false
            }
        }
    }
}

/// Built-in filter configurations.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterKind {
    Erode,
    Dilate,
    Min,
    Max,
    Median,
    /// 3x3 box mean.
    Mean,
    /// 3x3 mean whose center coefficient is `weight`.
    MeanVariableCentralPoint { weight: f32 },
    Lut(LookupTable),
    /// Below `threshold` -> `low`, otherwise `high`.
    Binarization { threshold: u8, low: u8, high: u8 },
    /// Edge magnitude, zeroed below `threshold`.
    Gradient { operator: GradientOperator, threshold: u32 },
    Rgb2Hsv,
    /// Erode then dilate.
    Open,
    /// Dilate then erode.
    Close,
}

impl FilterKind {
    /// [`MeanVariableCentralPoint`](Self::MeanVariableCentralPoint) with
    /// [`DEFAULT_CENTER_WEIGHT`]: the mean of the eight neighbors.
    pub fn mean_variable_central_point() -> Self {
        Self::MeanVariableCentralPoint { weight: DEFAULT_CENTER_WEIGHT }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Erode => "erode",
            Self::Dilate => "dilate",
            Self::Min => "min",
            Self::Max => "max",
            Self::Median => "median",
            Self::Mean => "mean",
            Self::MeanVariableCentralPoint { .. } => "mean_variable_central_point",
            Self::Lut(_) => "lut",
            Self::Binarization { .. } => "binarization",
            Self::Gradient { operator, .. } => operator.name(),
            Self::Rgb2Hsv => "rgb2hsv",
            Self::Open => "open",
            Self::Close => "close",
        }
    }

    pub fn category(&self) -> FilterCategory {
        match self {
            Self::Erode | Self::Dilate | Self::Open | Self::Close => FilterCategory::Morphology,
            Self::Min | Self::Max | Self::Median => FilterCategory::OrderStatistic,
            Self::Mean | Self::MeanVariableCentralPoint { .. } => FilterCategory::Lowpass,
            Self::Gradient { .. } => FilterCategory::Highpass,
            Self::Lut(_) | Self::Binarization { .. } | Self::Rgb2Hsv => FilterCategory::ContextFree,
        }
    }

    pub fn is_compound(&self) -> bool {
        matches!(self, Self::Open | Self::Close)
    }

    /// Kernel spec of a primitive kind. Compound kinds have none.
    pub fn kernel_spec(&self) -> DeviceResult<KernelSpec> {
        let name = self.name();
        let category = self.category();
        let spec = |source: &'static str, entry: &str| {
            KernelSpec::new(name, category, KernelSource::Embedded(source), entry)
        };

        Ok(match self {
            Self::Erode => spec("morphology", "erode"),
            Self::Dilate => spec("morphology", "dilate"),
            Self::Min => spec("morphology", "min_filter"),
            Self::Max => spec("morphology", "max_filter"),
            Self::Median => spec("median", "median"),
            Self::Mean => Self::mean_spec(spec("convolve", "convolve"), 1.0)?,
            Self::MeanVariableCentralPoint { weight } => Self::mean_spec(spec("convolve", "convolve"), *weight)?,
            Self::Lut(table) => spec("lut", "lut").aux("lut", table.to_device_bytes()),
            Self::Binarization { threshold, low, high } => spec("lut", "lut")
                .aux("lut", LookupTable::binarize(*threshold, *low, *high).to_device_bytes()),
            Self::Gradient { operator, threshold } => {
                let (mask_x, mask_y) = operator.masks();
                spec("gradient", "gradient")
                    .aux("mask_x", mask_bytes(&mask_x))
                    .aux("mask_y", mask_bytes(&mask_y))
                    .scalar(Scalar::U32(*threshold))
            }
            Self::Rgb2Hsv => spec("color", "rgb2hsv"),
            Self::Open | Self::Close => {
                return Err(DeviceError::Other(format!("`{name}` is a compound filter")));
            }
        })
    }

    fn mean_spec(spec: KernelSpec, center: f32) -> DeviceResult<KernelSpec> {
        let mask = mean_mask(center);
        let scale = normalization(&mask)?;
        Ok(spec.aux("mask", mask_bytes(&mask)).scalar(Scalar::F32(scale)))
    }

    /// Build against `context` and the image owned by `transfer`.
    pub fn build(
        &self,
        context: &DeviceContext,
        transfer: &DeviceTransferManager,
        options: &BuildOptions,
    ) -> DeviceResult<Box<dyn Filter>> {
        if self.is_compound() {
            return Ok(Box::new(self.build_compound(context, transfer, options)?));
        }
        if matches!(self, Self::Rgb2Hsv) && transfer.channels() < 3 {
            return Err(DeviceError::argument(
                3,
                format!("rgb2hsv needs at least 3 channels, image has {}", transfer.channels()),
            ));
        }
        Ok(Box::new(KernelFilter::new(context, transfer, self.kernel_spec()?, options)?))
    }

    /// Build [`Open`](Self::Open) or [`Close`](Self::Close).
    pub fn build_compound(
        &self,
        context: &DeviceContext,
        transfer: &DeviceTransferManager,
        options: &BuildOptions,
    ) -> DeviceResult<CompoundFilter> {
        let (first, second) = match self {
            Self::Open => (Self::Erode, Self::Dilate),
            Self::Close => (Self::Dilate, Self::Erode),
            _ => return Err(DeviceError::Other(format!("`{}` is not a compound filter", self.name()))),
        };
        Ok(CompoundFilter::new(
            self.name(),
            KernelFilter::new(context, transfer, first.kernel_spec()?, options)?,
            KernelFilter::new(context, transfer, second.kernel_spec()?, options)?,
        ))
    }
}
