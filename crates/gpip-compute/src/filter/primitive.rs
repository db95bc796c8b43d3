//! Single-kernel filters.

use std::sync::Arc;

use tracing::debug;

use super::{Filter, FilterCategory, MAX_MEDIAN_HALO};
use crate::context::{CommandQueue, CompiledKernel, DeviceBuffer, DeviceContext, KernelArgs};
use crate::device::{BufferAccess, BuildOptions, LaunchGeometry, scratch_bytes};
use crate::kernels::KernelSource;
use crate::transfer::{DeviceImage, DeviceTransferManager};
use crate::{DeviceError, DeviceResult};

/// Filter-specific scalar, bound after the halo. Only the types every
/// device can bind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    U32(u32),
    F32(f32),
}

/// Everything needed to build a [`KernelFilter`].
///
/// Custom kernels plug in the same way as the built-in ones:
///
/// ```
/// use gpip_compute::{FilterCategory, KernelSource};
/// use gpip_compute::filter::KernelSpec;
///
/// let spec = KernelSpec::new("wide median", FilterCategory::OrderStatistic, KernelSource::Embedded("median"), "median")
///     .halo(2);
/// assert_eq!(spec.halo_size(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct KernelSpec {
    name: String,
    category: FilterCategory,
    source: KernelSource,
    entry: String,
    halo: u32,
    aux: Vec<(String, Vec<u8>)>,
    scalars: Vec<Scalar>,
}

impl KernelSpec {
    /// Neighborhood categories start with a halo of 1 (3x3 windows).
    pub fn new(name: impl Into<String>, category: FilterCategory, source: KernelSource, entry: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category,
            source,
            entry: entry.into(),
            halo: if category.is_context() { 1 } else { 0 },
            aux: Vec::new(),
            scalars: Vec::new(),
        }
    }

    /// Halo width in pixels. Ignored for context-free filters.
    pub fn halo(mut self, halo: u32) -> Self {
        self.halo = halo;
        self
    }

    /// Read-only auxiliary buffer, bound after the image in call order.
    pub fn aux(mut self, label: impl Into<String>, contents: Vec<u8>) -> Self {
        self.aux.push((label.into(), contents));
        self
    }

    pub fn scalar(mut self, value: Scalar) -> Self {
        self.scalars.push(value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> FilterCategory {
        self.category
    }

    pub fn halo_size(&self) -> u32 {
        self.halo
    }

    /// Scalars bound after the halo, in call order.
    pub fn scalars(&self) -> &[Scalar] {
        &self.scalars
    }
}

/// One compiled kernel plus its auxiliary buffers, launched against the
/// shared device image.
pub struct KernelFilter {
    name: String,
    category: FilterCategory,
    kernel: CompiledKernel,
    aux: Vec<DeviceBuffer>,
    halo: u32,
    scalars: Vec<Scalar>,
    image: Arc<DeviceImage>,
    context: DeviceContext,
}

impl KernelFilter {
    /// Build the kernel and upload auxiliary buffers.
    ///
    /// Fails with the compiler log if the build fails, or with
    /// `InvalidArgument` if the scratch tile cannot fit the device.
    pub fn new(
        context: &DeviceContext,
        transfer: &DeviceTransferManager,
        spec: KernelSpec,
        options: &BuildOptions,
    ) -> DeviceResult<Self> {
        let KernelSpec { name, category, source, entry, halo, aux, scalars } = spec;
        let halo = if category.is_context() { halo } else { 0 };
        if entry == "median" && halo > MAX_MEDIAN_HALO {
            return Err(DeviceError::argument(
                1 + aux.len(),
                format!("median window is limited to a halo of {MAX_MEDIAN_HALO}, got {halo}"),
            ));
        }

        if category.is_context() {
            let scratch = scratch_bytes(options.workgroup, halo, transfer.channels());
            let limit = context.limits().max_local_memory;
            if scratch > limit {
                return Err(DeviceError::argument(
                    1 + aux.len(),
                    format!("`{name}` needs {scratch} bytes of scratch, device allows {limit}"),
                ));
            }
        }

        let kernel = context.build_kernel(&source, &entry, options)?;
        let aux = aux
            .into_iter()
            .map(|(label, contents)| context.create_buffer_init(&label, &contents, BufferAccess::ReadOnly))
            .collect::<DeviceResult<Vec<_>>>()?;

        debug!(filter = %name, entry = %entry, %source, halo, aux = aux.len(), "filter built");
        Ok(Self {
            name,
            category,
            kernel,
            aux,
            halo,
            scalars,
            image: transfer.device_image(),
            context: context.clone(),
        })
    }

    pub fn kernel(&self) -> &CompiledKernel {
        &self.kernel
    }

    pub fn halo(&self) -> u32 {
        self.halo
    }

    /// Auxiliary buffers in binding order.
    pub fn aux_buffers(&self) -> &[DeviceBuffer] {
        &self.aux
    }

    /// Launch geometry for the current image.
    pub fn launch_geometry(&self) -> LaunchGeometry {
        let (width, height, _) = self.image.dimensions();
        LaunchGeometry::covering(width, height, self.kernel.workgroup())
    }
}

impl Filter for KernelFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> FilterCategory {
        self.category
    }

    fn bind_and_launch(&mut self, queue: &CommandQueue) -> DeviceResult<()> {
        if !queue.context().same_device(&self.context) {
            return Err(DeviceError::InvalidContext(format!("`{}` was built for another device", self.name)));
        }

        // image, aux buffers, [scratch], width, height, channels, [halo], scalars
        let (width, height, channels) = self.image.dimensions();
        let launch = self.launch_geometry();
        let mut args = KernelArgs::new().buffer(self.image.buffer());
        for buffer in &self.aux {
            args = args.buffer(buffer);
        }
        if self.category.is_context() {
            args = args.local(scratch_bytes(launch.local, self.halo, channels));
        }
        args = args.u32(width).u32(height).u32(channels);
        if self.category.is_context() {
            args = args.u32(self.halo);
        }
        for scalar in &self.scalars {
            args = match *scalar {
                Scalar::U32(v) => args.u32(v),
                Scalar::F32(v) => args.f32(v),
            };
        }

        queue.enqueue(&self.kernel, &args, &launch)?;
        Ok(())
    }
}

impl std::fmt::Debug for KernelFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelFilter")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("entry", &self.kernel.entry_point())
            .field("halo", &self.halo)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SyncPolicy;
    use crate::device::Backend;
    use gpip_core::PackedImage;

    fn setup(w: u32, h: u32, c: u32) -> (DeviceContext, CommandQueue, DeviceTransferManager) {
        let ctx = DeviceContext::new(Backend::Cpu).unwrap();
        let queue = ctx.create_queue(SyncPolicy::Fenced);
        let tm = DeviceTransferManager::new(&ctx, &queue, w, h, c).unwrap();
        (ctx, queue, tm)
    }

    #[test]
    fn test_context_free_has_no_halo() {
        let (ctx, _queue, tm) = setup(4, 4, 1);
        let spec = KernelSpec::new("hsv", FilterCategory::ContextFree, KernelSource::Embedded("color"), "rgb2hsv")
            .halo(3);
        assert_eq!(spec.halo_size(), 3);
        let filter = KernelFilter::new(&ctx, &tm, spec, &BuildOptions::default()).unwrap();
        assert_eq!(filter.halo(), 0);
    }

    #[test]
    fn test_launch_follows_sent_image() {
        let (ctx, _queue, mut tm) = setup(40, 40, 1);
        let spec = KernelSpec::new("median", FilterCategory::OrderStatistic, KernelSource::Embedded("median"), "median");
        let filter = KernelFilter::new(&ctx, &tm, spec, &BuildOptions::default()).unwrap();
        assert_eq!(filter.launch_geometry().global, [48, 48]);

        tm.send_image(&PackedImage::new(17, 3, 1).unwrap()).unwrap();
        let launch = filter.launch_geometry();
        assert_eq!(launch.global, [32, 16]);
        assert_eq!(launch.groups(), [2, 1]);
    }

    #[test]
    fn test_oversized_scratch_rejected() {
        let (ctx, _queue, tm) = setup(8, 8, 4);
        // (32 + 2*60)^2 * 4 bytes is beyond 64 KiB
        let spec = KernelSpec::new("huge", FilterCategory::Morphology, KernelSource::Embedded("morphology"), "erode")
            .halo(60);
        let opts = BuildOptions { workgroup: [32, 32], ..BuildOptions::default() };
        let err = KernelFilter::new(&ctx, &tm, spec, &opts).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_foreign_queue_rejected() {
        let (ctx, _queue, tm) = setup(4, 4, 1);
        let spec = KernelSpec::new("erode", FilterCategory::Morphology, KernelSource::Embedded("morphology"), "erode");
        let mut filter = KernelFilter::new(&ctx, &tm, spec, &BuildOptions::default()).unwrap();

        let other = DeviceContext::new(Backend::Cpu).unwrap();
        let queue = other.create_queue(SyncPolicy::Fenced);
        assert!(!filter.filter(&queue));
        assert!(matches!(filter.bind_and_launch(&queue), Err(DeviceError::InvalidContext(_))));
    }
}
