//! Device context, command queue and RAII resource wrappers.
//!
//! [`DeviceContext`] is a cheap, reference-counted handle to the selected
//! device. Everything created through it ([`DeviceBuffer`],
//! [`CompiledKernel`], [`CommandQueue`]) holds a clone, so the device
//! outlives every resource built on it regardless of drop order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, trace};

use crate::device::{
    Backend, BufferAccess, BufferHandle, BuildOptions, ComputeDevice, DeviceLimits, Fence,
    KernelArg, LaunchGeometry, ProgramHandle, create_device,
};
use crate::kernels::KernelSource;
use crate::{DeviceError, DeviceResult};

/// Shared handle to the selected compute device.
#[derive(Clone)]
pub struct DeviceContext {
    device: Arc<dyn ComputeDevice>,
}

impl DeviceContext {
    /// Select a device for `backend` and create the context.
    pub fn new(backend: Backend) -> DeviceResult<Self> {
        let device = create_device(backend)?;
        info!(backend = device.name(), device = %device.description(), "device context created");
        Ok(Self { device })
    }

    /// Wrap an existing device.
    pub fn from_device(device: Arc<dyn ComputeDevice>) -> Self {
        Self { device }
    }

    /// Underlying device.
    pub fn device(&self) -> &dyn ComputeDevice {
        self.device.as_ref()
    }

    /// Backend name.
    pub fn name(&self) -> &'static str {
        self.device.name()
    }

    pub fn description(&self) -> String {
        self.device.description()
    }

    pub fn limits(&self) -> &DeviceLimits {
        self.device.limits()
    }

    /// Whether both handles refer to the same device.
    pub fn same_device(&self, other: &DeviceContext) -> bool {
        Arc::ptr_eq(&self.device, &other.device)
    }

    /// Create the in-order command queue for this context.
    pub fn create_queue(&self, sync: SyncPolicy) -> CommandQueue {
        debug!(?sync, "command queue created");
        CommandQueue {
            context: self.clone(),
            sync,
            last: AtomicU64::new(0),
        }
    }

    /// Allocate a zeroed device buffer.
    pub fn create_buffer(&self, label: &str, size: u64, access: BufferAccess) -> DeviceResult<DeviceBuffer> {
        let handle = self.device.create_buffer(label, size, access)?;
        Ok(DeviceBuffer::wrap(self, label, handle))
    }

    /// Allocate a device buffer holding `contents`.
    pub fn create_buffer_init(&self, label: &str, contents: &[u8], access: BufferAccess) -> DeviceResult<DeviceBuffer> {
        let handle = self.device.create_buffer_init(label, contents, access)?;
        Ok(DeviceBuffer::wrap(self, label, handle))
    }

    /// Build `entry` from the support module plus `source`.
    pub fn build_kernel(
        &self,
        source: &KernelSource,
        entry: &str,
        options: &BuildOptions,
    ) -> DeviceResult<CompiledKernel> {
        let text = source.load(entry)?;
        let program = self.device.build_program(&text, entry, options)?;
        if !program.build_log().is_empty() {
            debug!(entry, log = program.build_log(), "build log");
        }
        Ok(CompiledKernel {
            program,
            source: source.clone(),
            _context: self.clone(),
        })
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("backend", &self.device.name())
            .field("device", &self.device.description())
            .finish()
    }
}

/// How stage boundaries are ordered on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// Each stage boundary waits on the previous stage's fence.
    #[default]
    Fenced,
    /// Rely on the queue's in-order execution alone.
    InOrder,
}

impl SyncPolicy {
    /// Parse `fenced` / `in-order`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "fenced" | "fence" => Some(Self::Fenced),
            "in-order" | "inorder" | "in_order" => Some(Self::InOrder),
            _ => None,
        }
    }
}

/// In-order command queue bound to one context.
pub struct CommandQueue {
    context: DeviceContext,
    sync: SyncPolicy,
    // id of the most recent submission, 0 before the first
    last: AtomicU64,
}

impl CommandQueue {
    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn sync_policy(&self) -> SyncPolicy {
        self.sync
    }

    /// Enqueue one kernel launch without waiting for it.
    pub fn enqueue(&self, kernel: &CompiledKernel, args: &KernelArgs<'_>, launch: &LaunchGeometry) -> DeviceResult<Fence> {
        trace!(
            entry = kernel.entry_point(),
            global = ?launch.global,
            local = ?launch.local,
            args = args.len(),
            "enqueue"
        );
        let fence = self
            .context
            .device()
            .enqueue_kernel(kernel.program.as_ref(), args.as_slice(), launch)?;
        self.last.fetch_max(fence.id(), Ordering::AcqRel);
        Ok(fence)
    }

    /// Fence of the most recent submission.
    pub fn last_fence(&self) -> Option<Fence> {
        match self.last.load(Ordering::Acquire) {
            0 => None,
            id => Some(Fence(id)),
        }
    }

    /// Block until `fence` has completed.
    pub fn wait(&self, fence: Fence) -> DeviceResult<()> {
        self.context.device().wait(fence)
    }

    /// Stage boundary: under [`SyncPolicy::Fenced`] wait for the previous
    /// submission before the next stage is enqueued.
    pub fn stage_barrier(&self) -> DeviceResult<()> {
        match (self.sync, self.last_fence()) {
            (SyncPolicy::Fenced, Some(fence)) => {
                trace!(fence = fence.id(), "stage barrier");
                self.wait(fence)
            }
            _ => Ok(()),
        }
    }

    /// Block until every submission has completed.
    pub fn finish(&self) -> DeviceResult<()> {
        self.context.device().finish()
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("sync", &self.sync)
            .field("last_fence", &self.last_fence())
            .finish()
    }
}

/// Owned device buffer, released on drop.
pub struct DeviceBuffer {
    handle: Box<dyn BufferHandle>,
    label: String,
    context: DeviceContext,
}

impl DeviceBuffer {
    fn wrap(context: &DeviceContext, label: &str, handle: Box<dyn BufferHandle>) -> Self {
        Self { handle, label: label.to_string(), context: context.clone() }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.handle.size()
    }

    pub fn access(&self) -> BufferAccess {
        self.handle.access()
    }

    /// Device handle for kernel arguments.
    pub fn handle(&self) -> &dyn BufferHandle {
        self.handle.as_ref()
    }

    /// Blocking upload into the start of the buffer.
    pub fn write(&self, data: &[u8]) -> DeviceResult<()> {
        if data.len() as u64 > self.size() {
            return Err(DeviceError::InvalidBuffer(format!(
                "write of {} bytes into `{}` of {} bytes",
                data.len(),
                self.label,
                self.size()
            )));
        }
        self.context.device().write_buffer(self.handle(), data)
    }

    /// Blocking download of the first `out.len()` bytes.
    pub fn read(&self, out: &mut [u8]) -> DeviceResult<()> {
        if out.len() as u64 > self.size() {
            return Err(DeviceError::InvalidBuffer(format!(
                "read of {} bytes from `{}` of {} bytes",
                out.len(),
                self.label,
                self.size()
            )));
        }
        self.context.device().read_buffer(self.handle(), out)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        debug!(label = %self.label, size = self.handle.size(), "releasing device buffer");
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("label", &self.label)
            .field("size", &self.size())
            .field("access", &self.access())
            .finish()
    }
}

/// Built program and kernel, released on drop.
pub struct CompiledKernel {
    program: Box<dyn ProgramHandle>,
    source: KernelSource,
    _context: DeviceContext,
}

impl CompiledKernel {
    pub fn entry_point(&self) -> &str {
        self.program.entry_point()
    }

    /// Compiler output of the successful build.
    pub fn build_log(&self) -> &str {
        self.program.build_log()
    }

    /// Work-group size baked into the kernel.
    pub fn workgroup(&self) -> [u32; 2] {
        self.program.workgroup()
    }

    pub fn source(&self) -> &KernelSource {
        &self.source
    }
}

impl std::fmt::Debug for CompiledKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("entry", &self.entry_point())
            .field("source", &self.source)
            .field("workgroup", &self.workgroup())
            .finish()
    }
}

/// Positional kernel argument list.
///
/// ```
/// # use gpip_compute::{Backend, BufferAccess, DeviceContext, KernelArgs};
/// let ctx = DeviceContext::new(Backend::Cpu)?;
/// let img = ctx.create_buffer("img", 16, BufferAccess::ReadWrite)?;
/// let args = KernelArgs::new().buffer(&img).u32(4).u32(4).u32(1);
/// assert_eq!(args.len(), 4);
/// # Ok::<(), gpip_compute::DeviceError>(())
/// ```
#[derive(Debug, Default, Clone)]
pub struct KernelArgs<'a> {
    args: Vec<KernelArg<'a>>,
}

impl<'a> KernelArgs<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(mut self, buffer: &'a DeviceBuffer) -> Self {
        self.args.push(KernelArg::Buffer(buffer.handle()));
        self
    }

    /// Work-group local scratch of `bytes`.
    pub fn local(mut self, bytes: u64) -> Self {
        self.args.push(KernelArg::Local(bytes));
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.args.push(KernelArg::U32(value));
        self
    }

    pub fn f32(mut self, value: f32) -> Self {
        self.args.push(KernelArg::F32(value));
        self
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn as_slice(&self) -> &[KernelArg<'a>] {
        &self.args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpuDevice;

    fn cpu() -> DeviceContext {
        DeviceContext::from_device(Arc::new(CpuDevice::new()))
    }

    #[test]
    fn test_buffer_bounds() {
        let ctx = cpu();
        let buf = ctx.create_buffer("img", 8, BufferAccess::ReadWrite).unwrap();
        assert_eq!(buf.size(), 8);
        assert!(buf.write(&[0; 9]).is_err());
        let mut out = [0u8; 9];
        assert!(matches!(buf.read(&mut out), Err(DeviceError::InvalidBuffer(_))));

        buf.write(&[1, 2, 3]).unwrap();
        let mut out = [0u8; 4];
        buf.read(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 0]);
    }

    #[test]
    fn test_buffers_release_on_drop() {
        let dev = Arc::new(CpuDevice::new());
        let ctx = DeviceContext::from_device(dev.clone());
        let a = ctx.create_buffer("a", 128, BufferAccess::ReadWrite).unwrap();
        let b = ctx.create_buffer_init("b", &[1; 64], BufferAccess::ReadOnly).unwrap();
        assert_eq!(dev.allocated_bytes(), 192);
        drop(a);
        assert_eq!(dev.allocated_bytes(), 64);
        drop(ctx);
        // buffer keeps the device alive
        assert_eq!(b.size(), 64);
        drop(b);
        assert_eq!(dev.allocated_bytes(), 0);
    }

    #[test]
    fn test_build_kernel_and_failure() {
        let ctx = cpu();
        let kernel = ctx
            .build_kernel(&KernelSource::Embedded("median"), "median", &BuildOptions::default())
            .unwrap();
        assert_eq!(kernel.entry_point(), "median");
        assert_eq!(kernel.workgroup(), [16, 16]);
        assert!(kernel.build_log().contains("-cl-mad-enable"));

        let err = ctx
            .build_kernel(&KernelSource::Embedded("median"), "erode", &BuildOptions::default())
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.build_log().is_some());
    }

    #[test]
    fn test_stage_barrier_tracks_last_fence() {
        let ctx = cpu();
        let queue = ctx.create_queue(SyncPolicy::Fenced);
        assert!(queue.last_fence().is_none());
        queue.stage_barrier().unwrap();

        let kernel = ctx
            .build_kernel(&KernelSource::Embedded("color"), "rgb2hsv", &BuildOptions::default())
            .unwrap();
        let img = ctx.create_buffer_init("img", &[255, 0, 0], BufferAccess::ReadWrite).unwrap();
        let args = KernelArgs::new().buffer(&img).u32(1).u32(1).u32(3);
        let launch = LaunchGeometry::covering(1, 1, kernel.workgroup());
        let fence = queue.enqueue(&kernel, &args, &launch).unwrap();
        assert_eq!(queue.last_fence(), Some(fence));
        queue.stage_barrier().unwrap();
        queue.finish().unwrap();

        let mut out = [0u8; 3];
        img.read(&mut out).unwrap();
        assert_eq!(out, [0, 255, 255]);
    }

    #[test]
    fn test_sync_policy_parse() {
        assert_eq!(SyncPolicy::parse("Fenced"), Some(SyncPolicy::Fenced));
        assert_eq!(SyncPolicy::parse("in-order"), Some(SyncPolicy::InOrder));
        assert_eq!(SyncPolicy::parse("sometimes"), None);
        assert_eq!(SyncPolicy::default(), SyncPolicy::Fenced);
    }
}
