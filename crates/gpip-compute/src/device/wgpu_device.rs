//! wgpu device.
//!
//! Programs are WGSL compute pipelines. Each launch is one submission that
//! snapshots the image buffer, clears it and dispatches the kernel, which
//! reads the snapshot and writes the image. Buffers are padded to 4 bytes.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, trace};
use wgpu::util::DeviceExt;

use super::{
    AsAny, BufferAccess, BufferHandle, BuildOptions, ComputeDevice, DeviceLimits, Fence, KernelArg,
    LaunchGeometry, ProgramHandle, align_to, invocations,
};
use crate::{DeviceError, DeviceResult};

/// Work-group tile capacity of the WGSL support module, in channel values.
const TILE_CAP: u64 = 4096;

/// GPU storage buffer.
pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
    access: BufferAccess,
    allocated: Arc<AtomicU64>,
}

impl WgpuBuffer {
    fn padded(&self) -> u64 {
        self.buffer.size()
    }
}

impl Drop for WgpuBuffer {
    fn drop(&mut self) {
        self.allocated.fetch_sub(self.buffer.size(), Ordering::Relaxed);
    }
}

impl AsAny for WgpuBuffer {
    fn as_any(&self) -> &dyn std::any::Any { self }
}

impl BufferHandle for WgpuBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn access(&self) -> BufferAccess {
        self.access
    }
}

/// Compute pipeline for one entry point.
pub struct WgpuProgram {
    pipeline: wgpu::ComputePipeline,
    entry: String,
    workgroup: [u32; 2],
    log: String,
}

impl AsAny for WgpuProgram {
    fn as_any(&self) -> &dyn std::any::Any { self }
}

impl ProgramHandle for WgpuProgram {
    fn entry_point(&self) -> &str {
        &self.entry
    }

    fn build_log(&self) -> &str {
        &self.log
    }

    fn workgroup(&self) -> [u32; 2] {
        self.workgroup
    }
}

/// wgpu compute device.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    limits: DeviceLimits,
    allocated: Arc<AtomicU64>,
    // launch-time copy of the image, grown to the largest image seen
    snapshot: Mutex<Option<Arc<wgpu::Buffer>>>,
    // MAP_READ buffer reused by every read_buffer call
    readback: Mutex<Option<wgpu::Buffer>>,
    pending: Mutex<Vec<(u64, wgpu::SubmissionIndex)>>,
    next_fence: AtomicU64,
}

impl WgpuDevice {
    /// Adapter the device would open, if any.
    pub fn find_adapter() -> Option<wgpu::AdapterInfo> {
        pollster::block_on(request_adapter()).map(|(_, adapter)| adapter.get_info())
    }

    /// Check if a wgpu adapter is available.
    pub fn is_available() -> bool {
        Self::find_adapter().is_some()
    }

    /// Create the device on the best adapter.
    pub fn new() -> DeviceResult<Self> {
        pollster::block_on(Self::new_async())
    }

    pub async fn new_async() -> DeviceResult<Self> {
        let (_instance, adapter) = request_adapter().await.ok_or(DeviceError::NoDevice)?;

        let adapter_limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("gpip_device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter_limits.clone(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| DeviceError::InvalidContext(e.to_string()))?;

        // Errors outside an error scope are logged rather than panicking.
        device.on_uncaptured_error(Box::new(|e| {
            error!(error = %e, "uncaptured wgpu error");
        }));

        let adapter_info = adapter.get_info();
        let max_buffer_bytes = adapter_limits
            .max_buffer_size
            .min(adapter_limits.max_storage_buffer_binding_size as u64);
        let limits = DeviceLimits {
            max_workgroup_invocations: adapter_limits.max_compute_invocations_per_workgroup,
            max_local_memory: (adapter_limits.max_compute_workgroup_storage_size as u64 / 4).min(TILE_CAP),
            max_buffer_bytes,
            available_memory: memory_budget(adapter_info.device_type, max_buffer_bytes),
        };

        info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            available_mb = limits.available_memory / (1024 * 1024),
            "wgpu device initialized"
        );

        Ok(Self {
            device,
            queue,
            adapter_info,
            limits,
            allocated: Arc::new(AtomicU64::new(0)),
            snapshot: Mutex::new(None),
            readback: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            next_fence: AtomicU64::new(0),
        })
    }

    /// Adapter info (GPU name, vendor, backend).
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    fn buffer<'a>(&self, handle: &'a dyn BufferHandle, index: usize) -> DeviceResult<&'a WgpuBuffer> {
        handle
            .as_any()
            .downcast_ref::<WgpuBuffer>()
            .ok_or_else(|| DeviceError::argument(index, "buffer was not created by the wgpu device"))
    }

    fn lock<'a, T>(&self, m: &'a Mutex<T>) -> DeviceResult<std::sync::MutexGuard<'a, T>> {
        m.lock().map_err(|_| DeviceError::InvalidContext("wgpu device state poisoned".into()))
    }

    fn scratch_buffer(&self, label: &str, size: u64, usage: wgpu::BufferUsages) -> wgpu::Buffer {
        debug!(label, size, "wgpu: scratch buffer allocated");
        self.device.create_buffer(&wgpu::BufferDescriptor { label: Some(label), size, usage, mapped_at_creation: false })
    }

    /// Snapshot buffer of at least `size` bytes.
    fn snapshot(&self, size: u64) -> DeviceResult<Arc<wgpu::Buffer>> {
        let mut slot = self.lock(&self.snapshot)?;
        if let Some(buf) = slot.as_ref().filter(|b| b.size() >= size) {
            return Ok(Arc::clone(buf));
        }
        let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;
        let buf = Arc::new(self.scratch_buffer("image_snapshot", size, usage));
        *slot = Some(Arc::clone(&buf));
        Ok(buf)
    }
}

impl ComputeDevice for WgpuDevice {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn description(&self) -> String {
        format!("{} ({:?})", self.adapter_info.name, self.adapter_info.backend)
    }

    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn create_buffer(&self, label: &str, size: u64, access: BufferAccess) -> DeviceResult<Box<dyn BufferHandle>> {
        let fail = |reason: String| DeviceError::AllocationFailure { label: label.to_string(), size, reason };
        if size == 0 {
            return Err(fail("zero-sized buffer".into()));
        }
        if size > self.limits.max_buffer_bytes {
            return Err(fail(format!("exceeds max buffer size {}", self.limits.max_buffer_bytes)));
        }
        let padded = align_to(size, wgpu::COPY_BUFFER_ALIGNMENT);
        let prev = self.allocated.fetch_add(padded, Ordering::Relaxed);
        if prev + padded > self.limits.available_memory {
            self.allocated.fetch_sub(padded, Ordering::Relaxed);
            return Err(fail(format!("{} of {} bytes already in use", prev, self.limits.available_memory)));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: padded,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            self.allocated.fetch_sub(padded, Ordering::Relaxed);
            return Err(fail(err.to_string()));
        }

        debug!(label, size, padded, ?access, "wgpu: allocated buffer");
        Ok(Box::new(WgpuBuffer { buffer, size, access, allocated: Arc::clone(&self.allocated) }))
    }

    fn write_buffer(&self, buffer: &dyn BufferHandle, data: &[u8]) -> DeviceResult<()> {
        let buffer = self.buffer(buffer, 0)?;
        if data.len() as u64 > buffer.size {
            return Err(DeviceError::InvalidBuffer(format!(
                "write of {} bytes into a {} byte buffer",
                data.len(),
                buffer.size
            )));
        }
        // Writes must be whole words; the tail word is zero-padded.
        let padded_len = align_to(data.len() as u64, wgpu::COPY_BUFFER_ALIGNMENT) as usize;
        if padded_len == data.len() {
            self.queue.write_buffer(&buffer.buffer, 0, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(padded_len, 0);
            self.queue.write_buffer(&buffer.buffer, 0, &padded);
        }
        let index = self.queue.submit(std::iter::empty());
        let _ = self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        Ok(())
    }

    fn read_buffer(&self, buffer: &dyn BufferHandle, out: &mut [u8]) -> DeviceResult<()> {
        let buffer = self.buffer(buffer, 0)?;
        if out.len() as u64 > buffer.size {
            return Err(DeviceError::InvalidBuffer(format!(
                "read of {} bytes from a {} byte buffer",
                out.len(),
                buffer.size
            )));
        }
        if out.is_empty() {
            return Ok(());
        }
        let size = align_to(out.len() as u64, wgpu::COPY_BUFFER_ALIGNMENT);

        // held until unmapped so concurrent reads cannot remap it
        let mut slot = self.lock(&self.readback)?;
        if slot.as_ref().is_none_or(|b| b.size() < size) {
            let usage = wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ;
            *slot = Some(self.scratch_buffer("readback", size, usage));
        }
        let Some(staging) = slot.as_ref() else {
            return Err(DeviceError::InvalidContext("readback buffer missing".into()));
        };

        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(&buffer.buffer, 0, staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..size);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);

        rx.recv()
            .map_err(|_| DeviceError::Other("map channel closed".into()))?
            .map_err(|e| DeviceError::Other(format!("map failed: {e}")))?;

        let data = slice.get_mapped_range();
        out.copy_from_slice(&data[..out.len()]);
        drop(data);
        staging.unmap();
        Ok(())
    }

    fn build_program(&self, source: &str, entry: &str, options: &BuildOptions) -> DeviceResult<Box<dyn ProgramHandle>> {
        let [wx, wy] = options.workgroup;
        let mut log = format!("wgpu: `{entry}` ({})\n", options.flags());

        if wx == 0 || wy == 0 || invocations(options.workgroup) > self.limits.max_workgroup_invocations as u64 {
            log.push_str(&format!(
                "work-group size {wx}x{wy} outside 1..={} invocations\n",
                self.limits.max_workgroup_invocations
            ));
            return Err(DeviceError::BuildFailure { entry: entry.to_string(), log });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(entry),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let info = pollster::block_on(module.get_compilation_info());
        for msg in &info.messages {
            match &msg.location {
                Some(loc) => {
                    let _ = writeln!(log, "{:?} {}:{}: {}", msg.message_type, loc.line_number, loc.line_position, msg.message);
                }
                None => {
                    let _ = writeln!(log, "{:?}: {}", msg.message_type, msg.message);
                }
            }
        }

        let constants = HashMap::from([("WG_X".to_string(), wx as f64), ("WG_Y".to_string(), wy as f64)]);
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry),
            layout: None, // Auto layout
            module: &module,
            entry_point: Some(entry),
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &constants,
                zero_initialize_workgroup_memory: false,
            },
            cache: None,
        });

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            let _ = writeln!(log, "{err}");
            return Err(DeviceError::BuildFailure { entry: entry.to_string(), log });
        }

        debug!(entry, flags = %options.flags(), "wgpu: built pipeline");
        Ok(Box::new(WgpuProgram {
            pipeline,
            entry: entry.to_string(),
            workgroup: options.workgroup,
            log,
        }))
    }

    fn enqueue_kernel(
        &self,
        program: &dyn ProgramHandle,
        args: &[KernelArg<'_>],
        launch: &LaunchGeometry,
    ) -> DeviceResult<Fence> {
        let program = program
            .as_any()
            .downcast_ref::<WgpuProgram>()
            .ok_or_else(|| DeviceError::InvalidContext("program was not built by the wgpu device".into()))?;

        // Buffers bind in order after the snapshot; scalars pack into the
        // trailing params buffer.
        let mut buffers = Vec::new();
        let mut params: Vec<u32> = Vec::new();
        let mut first_scalar = None;
        for (index, arg) in args.iter().enumerate() {
            match arg {
                KernelArg::Buffer(handle) => {
                    if !params.is_empty() {
                        return Err(DeviceError::argument(index, "buffers must precede scalar arguments"));
                    }
                    buffers.push(self.buffer(*handle, index)?);
                }
                KernelArg::Local(bytes) => {
                    if *bytes > self.limits.max_local_memory {
                        return Err(DeviceError::argument(
                            index,
                            format!("scratch of {bytes} bytes exceeds {} byte limit", self.limits.max_local_memory),
                        ));
                    }
                }
                scalar => {
                    first_scalar.get_or_insert(index);
                    params.extend(scalar.scalar_bits());
                }
            }
        }

        let Some(image) = buffers.first().copied() else {
            return Err(DeviceError::argument(0, "expected the image buffer"));
        };
        let Some(dims_index) = first_scalar.filter(|_| params.len() >= 3) else {
            return Err(DeviceError::argument(args.len(), "expected width, height and channels"));
        };
        let (width, height, channels) = (params[0], params[1], params[2]);
        if width == 0 || height == 0 {
            return Err(DeviceError::argument(dims_index, format!("image size {width}x{height}")));
        }
        if !(1..=4).contains(&channels) {
            return Err(DeviceError::argument(dims_index + 2, format!("{channels} channels")));
        }
        launch.validate(program, &self.limits, width, height)?;

        let needed = width as u64 * height as u64 * channels as u64;
        if image.size < needed {
            return Err(DeviceError::InvalidBuffer(format!(
                "image buffer holds {} bytes, launch needs {needed}",
                image.size
            )));
        }

        let snapshot = self.snapshot(image.padded())?;
        let params_buf = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("params"),
            contents: bytemuck::cast_slice(&params),
            usage: wgpu::BufferUsages::STORAGE,
        });

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let mut entries = vec![
            wgpu::BindGroupEntry { binding: 0, resource: image.buffer.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: snapshot.as_entire_binding() },
        ];
        for (i, aux) in buffers.iter().enumerate().skip(1) {
            entries.push(wgpu::BindGroupEntry { binding: i as u32 + 1, resource: aux.buffer.as_entire_binding() });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: buffers.len() as u32 + 1,
            resource: params_buf.as_entire_binding(),
        });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(program.entry.as_str()),
            layout: &program.pipeline.get_bind_group_layout(0),
            entries: &entries,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("kernel_encoder"),
        });
        encoder.copy_buffer_to_buffer(&image.buffer, 0, &snapshot, 0, image.padded());
        encoder.clear_buffer(&image.buffer, 0, None);
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("kernel_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&program.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let [gx, gy] = launch.groups();
            pass.dispatch_workgroups(gx, gy, 1);
        }
        let index = self.queue.submit(std::iter::once(encoder.finish()));

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(DeviceError::argument(0, format!("launch of `{}` rejected: {err}", program.entry)));
        }

        let id = self.next_fence.fetch_add(1, Ordering::AcqRel) + 1;
        self.lock(&self.pending)?.push((id, index));
        trace!(entry = %program.entry, fence = id, groups = ?launch.groups(), "wgpu: dispatched");
        Ok(Fence(id))
    }

    fn wait(&self, fence: Fence) -> DeviceResult<()> {
        if fence.0 > self.next_fence.load(Ordering::Acquire) {
            return Err(DeviceError::Other(format!("unknown fence {}", fence.0)));
        }
        let index = {
            let mut pending = self.lock(&self.pending)?;
            let index = pending.iter().find(|(id, _)| *id == fence.0).map(|(_, i)| i.clone());
            pending.retain(|(id, _)| *id > fence.0);
            index
        };
        // Already retired by an earlier wait or finish.
        if let Some(index) = index {
            let _ = self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        }
        Ok(())
    }

    fn finish(&self) -> DeviceResult<()> {
        let _ = self.device.poll(wgpu::Maintain::Wait);
        self.lock(&self.pending)?.clear();
        Ok(())
    }
}

async fn request_adapter() -> Option<(wgpu::Instance, wgpu::Adapter)> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await?;
    Some((instance, adapter))
}

/// Host memory, falling back to 4 GiB when the OS does not report it.
fn host_memory_bytes() -> u64 {
    sys_info::mem_info().map_or(4 << 30, |m| m.total * 1024)
}

/// Bytes the device may allocate. wgpu does not report VRAM, so this is a
/// guess unless `GPIP_GPU_MEMORY_MB` sets it: GPUs sharing host memory get
/// a quarter of it, dedicated ones room for four largest buffers. Never
/// less than one largest buffer.
fn memory_budget(device_type: wgpu::DeviceType, max_buffer_bytes: u64) -> u64 {
    let configured = std::env::var("GPIP_GPU_MEMORY_MB").ok().and_then(|v| v.trim().parse::<u64>().ok());
    if let Some(mb) = configured {
        return mb.saturating_mul(1 << 20);
    }
    let guess = match device_type {
        wgpu::DeviceType::DiscreteGpu | wgpu::DeviceType::VirtualGpu => max_buffer_bytes.saturating_mul(4),
        _ => host_memory_bytes() / 4,
    };
    guess.max(max_buffer_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_wgpu_roundtrip() {
        let dev = WgpuDevice::new().unwrap();
        // odd size exercises the padded tail word
        let buf = dev.create_buffer_init("img", &[1, 2, 3, 4, 5], BufferAccess::ReadWrite).unwrap();
        assert_eq!(buf.size(), 5);
        let mut out = [0u8; 5];
        dev.read_buffer(buf.as_ref(), &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5]);
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_readback_buffer_reused() {
        let dev = WgpuDevice::new().unwrap();
        let big = dev.create_buffer_init("big", &[7; 64], BufferAccess::ReadWrite).unwrap();
        let small = dev.create_buffer_init("small", &[1, 2, 3], BufferAccess::ReadWrite).unwrap();

        let mut out = [0u8; 64];
        dev.read_buffer(big.as_ref(), &mut out).unwrap();
        assert_eq!(out, [7; 64]);
        let mut out = [0u8; 3];
        dev.read_buffer(small.as_ref(), &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);

        // the 64 byte buffer from the first read serves the second
        let size = dev.readback.lock().unwrap().as_ref().map(|b| b.size());
        assert_eq!(size, Some(64));
    }

    #[test]
    fn test_memory_budget() {
        if std::env::var_os("GPIP_GPU_MEMORY_MB").is_some() {
            return;
        }
        assert_eq!(memory_budget(wgpu::DeviceType::DiscreteGpu, 1 << 30), 4 << 30);
        assert!(memory_budget(wgpu::DeviceType::IntegratedGpu, 1 << 30) >= 1 << 30);
        assert!(memory_budget(wgpu::DeviceType::Cpu, 1 << 20) >= host_memory_bytes() / 4);
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_wgpu_build_failure_log() {
        let dev = WgpuDevice::new().unwrap();
        let err = dev
            .build_program("fn erode( {", "erode", &BuildOptions::default())
            .err()
            .unwrap();
        assert!(!err.build_log().unwrap().is_empty());
    }
}
