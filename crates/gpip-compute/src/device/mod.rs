//! Compute devices.
//!
//! Provides a CPU reference device (rayon) and a wgpu device behind one
//! object-safe trait, with automatic selection.
//!
//! # Architecture
//!
//! ```text
//! ComputeDevice (buffers, program builds, kernel enqueue, fences)
//!     +-- CpuDevice  (native kernels, always available)
//!     +-- WgpuDevice (WGSL compute pipelines, `wgpu` feature)
//! ```
//!
//! Handles returned by a device (`BufferHandle`, `ProgramHandle`) are opaque
//! and downcast back to the concrete type inside the device that made them.

mod cpu;
mod cpu_kernels;
mod detect;

#[cfg(feature = "wgpu")]
mod wgpu_device;

pub use cpu::CpuDevice;
pub use detect::{BackendInfo, describe_backends, detect_backends, select_best_backend};

#[cfg(feature = "wgpu")]
pub use wgpu_device::WgpuDevice;

use std::sync::Arc;

use crate::{DeviceError, DeviceResult};

/// Available compute backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Auto-select best available (wgpu > CPU).
    #[default]
    Auto,
    /// CPU reference device using rayon.
    Cpu,
    /// wgpu device (Vulkan/Metal/DX12).
    Wgpu,
}

impl Backend {
    /// Check if this backend is available on current system.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Auto => true,
            Self::Cpu => true,
            #[cfg(feature = "wgpu")]
            Self::Wgpu => WgpuDevice::is_available(),
            #[cfg(not(feature = "wgpu"))]
            Self::Wgpu => false,
        }
    }

    /// Get human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Cpu => "cpu",
            Self::Wgpu => "wgpu",
        }
    }

    /// Parse a backend name (`auto`, `cpu`, `wgpu`), case-insensitive.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "cpu" => Some(Self::Cpu),
            "wgpu" | "gpu" => Some(Self::Wgpu),
            _ => None,
        }
    }
}

/// Create a device for the given backend.
pub fn create_device(backend: Backend) -> DeviceResult<Arc<dyn ComputeDevice>> {
    match backend {
        Backend::Auto => create_device(select_best_backend()),
        Backend::Cpu => Ok(Arc::new(CpuDevice::new())),
        Backend::Wgpu => {
            #[cfg(feature = "wgpu")]
            {
                Ok(Arc::new(WgpuDevice::new()?))
            }
            #[cfg(not(feature = "wgpu"))]
            {
                Err(DeviceError::BackendNotAvailable("wgpu feature not enabled".to_string()))
            }
        }
    }
}

/// Helper trait for downcasting.
pub trait AsAny: 'static {
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Device memory allocation.
pub trait BufferHandle: AsAny + Send + Sync {
    /// Logical size in bytes.
    fn size(&self) -> u64;

    /// How kernels may access the buffer.
    fn access(&self) -> BufferAccess;
}

/// A compiled program together with its kernel entry point.
pub trait ProgramHandle: AsAny + Send + Sync {
    /// Kernel entry point name.
    fn entry_point(&self) -> &str;

    /// Compiler output (warnings included); empty when the build was silent.
    fn build_log(&self) -> &str;

    /// Work-group size the kernel was compiled for.
    fn workgroup(&self) -> [u32; 2];
}

/// Kernel access to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAccess {
    /// Read and written by kernels (the image buffer).
    ReadWrite,
    /// Uploaded once, read by kernels (lookup tables, masks).
    ReadOnly,
}

/// Program build options.
///
/// `mad_enable` corresponds to the `-cl-mad-enable` compiler flag: devices
/// may fuse multiply-add in kernel arithmetic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub mad_enable: bool,
    /// Work-group size `[x, y]`, baked into the kernel at build time.
    pub workgroup: [u32; 2],
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self { mad_enable: true, workgroup: [16, 16] }
    }
}

impl BuildOptions {
    /// Compiler flag string recorded in build logs.
    pub fn flags(&self) -> String {
        let mut flags = format!("-D WG_X={} -D WG_Y={}", self.workgroup[0], self.workgroup[1]);
        if self.mad_enable {
            flags.push_str(" -cl-mad-enable");
        }
        flags
    }
}

/// One positional kernel argument.
#[derive(Clone, Copy)]
pub enum KernelArg<'a> {
    /// Device buffer.
    Buffer(&'a dyn BufferHandle),
    /// Work-group local scratch of the given byte size.
    Local(u64),
    U32(u32),
    F32(f32),
}

impl KernelArg<'_> {
    /// Raw 32-bit pattern of a scalar argument.
    pub fn scalar_bits(&self) -> Option<u32> {
        match *self {
            Self::U32(v) => Some(v),
            Self::F32(v) => Some(v.to_bits()),
            Self::Buffer(_) | Self::Local(_) => None,
        }
    }

    /// Short type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Buffer(_) => "buffer",
            Self::Local(_) => "local",
            Self::U32(_) => "u32",
            Self::F32(_) => "f32",
        }
    }
}

impl std::fmt::Debug for KernelArg<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffer(b) => write!(f, "Buffer({} bytes)", b.size()),
            Self::Local(n) => write!(f, "Local({n})"),
            Self::U32(v) => write!(f, "U32({v})"),
            Self::F32(v) => write!(f, "F32({v})"),
        }
    }
}

/// 2-D launch geometry: global and local work sizes in work-items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub global: [u32; 2],
    pub local: [u32; 2],
}

impl LaunchGeometry {
    /// Smallest geometry whose global size is a multiple of `local` and
    /// covers `width x height`.
    ///
    /// Kernels must guard against work-items past the image edge.
    pub fn covering(width: u32, height: u32, local: [u32; 2]) -> Self {
        // saturates; validate() then reports the uncovered image
        let round = |dim: u32, l: u32| {
            let l = l.max(1) as u64;
            (dim as u64).div_ceil(l).saturating_mul(l).min(u32::MAX as u64) as u32
        };
        Self {
            global: [round(width, local[0]), round(height, local[1])],
            local,
        }
    }

    /// Work-group counts per dimension.
    pub fn groups(&self) -> [u32; 2] {
        [self.global[0] / self.local[0].max(1), self.global[1] / self.local[1].max(1)]
    }

    /// Checks the geometry against a compiled kernel, the device limits and
    /// the image it must cover.
    pub fn validate(
        &self,
        program: &dyn ProgramHandle,
        limits: &DeviceLimits,
        width: u32,
        height: u32,
    ) -> DeviceResult<()> {
        let [lx, ly] = self.local;
        if lx == 0 || ly == 0 {
            return Err(DeviceError::Other(format!("local work size {lx}x{ly} has a zero dimension")));
        }
        if self.local != program.workgroup() {
            return Err(DeviceError::Other(format!(
                "local work size {lx}x{ly} does not match kernel `{}` built for {}x{}",
                program.entry_point(),
                program.workgroup()[0],
                program.workgroup()[1]
            )));
        }
        if invocations(self.local) > limits.max_workgroup_invocations as u64 {
            return Err(DeviceError::Other(format!(
                "work-group of {} invocations exceeds device limit {}",
                invocations(self.local),
                limits.max_workgroup_invocations
            )));
        }
        if self.global[0] % lx != 0 || self.global[1] % ly != 0 {
            return Err(DeviceError::Other(format!(
                "global size {}x{} is not a multiple of local size {lx}x{ly}",
                self.global[0], self.global[1]
            )));
        }
        if self.global[0] < width || self.global[1] < height {
            return Err(DeviceError::Other(format!(
                "global size {}x{} does not cover image {width}x{height}",
                self.global[0], self.global[1]
            )));
        }
        Ok(())
    }
}

/// Submission token handed out by [`ComputeDevice::enqueue_kernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fence(pub(crate) u64);

impl Fence {
    /// Monotonic submission number.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Device resource limits.
#[derive(Debug, Clone)]
pub struct DeviceLimits {
    /// Maximum invocations per work-group.
    pub max_workgroup_invocations: u32,
    /// Maximum work-group local scratch in bytes.
    pub max_local_memory: u64,
    /// Maximum size of one buffer in bytes.
    pub max_buffer_bytes: u64,
    /// Memory budget for all allocations in bytes.
    pub available_memory: u64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_workgroup_invocations: 256,
            max_local_memory: 16 * 1024,
            max_buffer_bytes: 256 * 1024 * 1024,
            available_memory: 2 * 1024 * 1024 * 1024,
        }
    }
}

/// Core device operations.
///
/// Transfers are blocking. Kernel enqueue is not: the device executes
/// submissions in order and [`wait`](Self::wait) / [`finish`](Self::finish)
/// block until a given submission, or all of them, complete.
pub trait ComputeDevice: Send + Sync {
    /// Backend name.
    fn name(&self) -> &'static str;

    /// Adapter/device description for logs.
    fn description(&self) -> String;

    /// Device limits.
    fn limits(&self) -> &DeviceLimits;

    /// Allocate an uninitialised (zeroed) buffer.
    fn create_buffer(&self, label: &str, size: u64, access: BufferAccess) -> DeviceResult<Box<dyn BufferHandle>>;

    /// Allocate a buffer and upload `contents`.
    fn create_buffer_init(
        &self,
        label: &str,
        contents: &[u8],
        access: BufferAccess,
    ) -> DeviceResult<Box<dyn BufferHandle>> {
        let buffer = self.create_buffer(label, contents.len() as u64, access)?;
        self.write_buffer(buffer.as_ref(), contents)?;
        Ok(buffer)
    }

    /// Blocking host-to-device copy into the start of `buffer`.
    fn write_buffer(&self, buffer: &dyn BufferHandle, data: &[u8]) -> DeviceResult<()>;

    /// Blocking device-to-host copy of the first `out.len()` bytes.
    fn read_buffer(&self, buffer: &dyn BufferHandle, out: &mut [u8]) -> DeviceResult<()>;

    /// Build a program from source and create the kernel `entry`.
    fn build_program(&self, source: &str, entry: &str, options: &BuildOptions) -> DeviceResult<Box<dyn ProgramHandle>>;

    /// Enqueue a kernel launch. Does not wait for completion.
    fn enqueue_kernel(
        &self,
        program: &dyn ProgramHandle,
        args: &[KernelArg<'_>],
        launch: &LaunchGeometry,
    ) -> DeviceResult<Fence>;

    /// Block until the submission behind `fence` has completed.
    fn wait(&self, fence: Fence) -> DeviceResult<()>;

    /// Block until every submission has completed.
    fn finish(&self) -> DeviceResult<()>;
}

/// Invocations in one work-group of size `[x, y]`.
#[inline]
pub fn invocations(workgroup: [u32; 2]) -> u64 {
    workgroup[0] as u64 * workgroup[1] as u64
}

/// Round `value` up to the next multiple of `alignment`.
#[inline]
pub(crate) fn align_to(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Bytes of work-group scratch a neighborhood kernel needs: the tile plus a
/// `halo`-pixel border on every side.
pub fn scratch_bytes(local: [u32; 2], halo: u32, channels: u32) -> u64 {
    let tw = local[0] as u64 + 2 * halo as u64;
    let th = local[1] as u64 + 2 * halo as u64;
    tw * th * channels as u64
}
