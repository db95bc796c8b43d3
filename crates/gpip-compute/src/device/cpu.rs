//! CPU reference device.
//!
//! Buffers live in host memory and kernels are the native routines in
//! `cpu_kernels`. Submissions execute in order at enqueue time, so every
//! fence is already signalled when it is handed out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, trace};

use super::cpu_kernels::{self, ArgKind, Geometry, NativeKernel};
use super::{
    AsAny, BufferAccess, BufferHandle, BuildOptions, ComputeDevice, DeviceLimits, Fence, KernelArg,
    LaunchGeometry, ProgramHandle, invocations, scratch_bytes,
};
use crate::{DeviceError, DeviceResult};

/// Host-memory buffer.
pub struct CpuBuffer {
    label: String,
    data: RwLock<Vec<u8>>,
    access: BufferAccess,
    allocated: Arc<AtomicU64>,
}

impl CpuBuffer {
    fn read(&self) -> DeviceResult<std::sync::RwLockReadGuard<'_, Vec<u8>>> {
        self.data
            .read()
            .map_err(|_| DeviceError::InvalidBuffer(format!("`{}` lock poisoned", self.label)))
    }

    fn write(&self) -> DeviceResult<std::sync::RwLockWriteGuard<'_, Vec<u8>>> {
        self.data
            .write()
            .map_err(|_| DeviceError::InvalidBuffer(format!("`{}` lock poisoned", self.label)))
    }

    fn len(&self) -> usize {
        self.read().map(|d| d.len()).unwrap_or(0)
    }
}

impl Drop for CpuBuffer {
    fn drop(&mut self) {
        let size = self.data.get_mut().map(|d| d.len()).unwrap_or(0) as u64;
        self.allocated.fetch_sub(size, Ordering::Relaxed);
    }
}

impl AsAny for CpuBuffer {
    fn as_any(&self) -> &dyn std::any::Any { self }
}

impl BufferHandle for CpuBuffer {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn access(&self) -> BufferAccess {
        self.access
    }
}

/// Program resolved to a native kernel.
pub struct CpuProgram {
    entry: String,
    kernel: NativeKernel,
    workgroup: [u32; 2],
    log: String,
}

impl AsAny for CpuProgram {
    fn as_any(&self) -> &dyn std::any::Any { self }
}

impl ProgramHandle for CpuProgram {
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

/// CPU reference device.
pub struct CpuDevice {
    limits: DeviceLimits,
    allocated: Arc<AtomicU64>,
    submitted: AtomicU64,
}

impl CpuDevice {
    /// Create a device sized to the available system RAM.
    pub fn new() -> Self {
        // Fallback to 4GB if detection fails
        let available = sys_info::mem_info()
            .map(|m| m.avail * 1024)
            .unwrap_or(4 * 1024 * 1024 * 1024);

        Self::with_limits(DeviceLimits {
            max_workgroup_invocations: 1024,
            max_local_memory: 64 * 1024,
            max_buffer_bytes: available,
            available_memory: available,
        })
    }

    /// Create a device with explicit limits.
    pub fn with_limits(limits: DeviceLimits) -> Self {
        debug!(
            available_mb = limits.available_memory / (1024 * 1024),
            "CPU device initialized"
        );
        Self {
            limits,
            allocated: Arc::new(AtomicU64::new(0)),
            submitted: AtomicU64::new(0),
        }
    }

    /// Bytes currently held by live buffers.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    fn buffer<'a>(&self, handle: &'a dyn BufferHandle, index: usize) -> DeviceResult<&'a CpuBuffer> {
        handle
            .as_any()
            .downcast_ref::<CpuBuffer>()
            .ok_or_else(|| DeviceError::argument(index, "buffer was not created by the CPU device"))
    }

    fn reserve(&self, label: &str, size: u64) -> DeviceResult<()> {
        let fail = |reason: String| DeviceError::AllocationFailure {
            label: label.to_string(),
            size,
            reason,
        };
        if size == 0 {
            return Err(fail("zero-sized buffer".into()));
        }
        if size > self.limits.max_buffer_bytes {
            return Err(fail(format!("exceeds max buffer size {}", self.limits.max_buffer_bytes)));
        }
        let prev = self.allocated.fetch_add(size, Ordering::Relaxed);
        if prev + size > self.limits.available_memory {
            self.allocated.fetch_sub(size, Ordering::Relaxed);
            return Err(fail(format!(
                "{} of {} bytes already in use",
                prev, self.limits.available_memory
            )));
        }
        Ok(())
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// Syntax checks the CPU device can make on kernel source text.
fn check_source(source: &str, entry: &str) -> Result<(), String> {
    let mut depth = 0i64;
    for (line_no, line) in source.lines().enumerate() {
        let code = line.split("//").next().unwrap_or("");
        for ch in code.chars() {
            match ch {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
            if depth < 0 {
                return Err(format!("line {}: unmatched `}}`", line_no + 1));
            }
        }
    }
    if depth != 0 {
        return Err(format!("unexpected end of source: {depth} unclosed `{{`"));
    }
    if !source.contains(&format!("fn {entry}(")) {
        return Err(format!("entry point `{entry}` not found in source"));
    }
    Ok(())
}

fn u32_at(args: &[KernelArg<'_>], index: usize) -> u32 {
    match args[index] {
        KernelArg::U32(v) => v,
        _ => 0,
    }
}

fn f32_at(args: &[KernelArg<'_>], index: usize) -> f32 {
    match args[index] {
        KernelArg::F32(v) => v,
        _ => 0.0,
    }
}

fn f32_words(bytes: &[u8], count: usize) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .take(count)
        .map(bytemuck::pod_read_unaligned::<f32>)
        .collect()
}

impl ComputeDevice for CpuDevice {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn description(&self) -> String {
        format!("CPU reference device ({} threads)", rayon::current_num_threads())
    }

    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn create_buffer(&self, label: &str, size: u64, access: BufferAccess) -> DeviceResult<Box<dyn BufferHandle>> {
        self.reserve(label, size)?;
        debug!(label, size, ?access, "cpu: allocated buffer");
        Ok(Box::new(CpuBuffer {
            label: label.to_string(),
            data: RwLock::new(vec![0u8; size as usize]),
            access,
            allocated: Arc::clone(&self.allocated),
        }))
    }

    fn write_buffer(&self, buffer: &dyn BufferHandle, data: &[u8]) -> DeviceResult<()> {
        let buffer = self.buffer(buffer, 0)?;
        let mut dst = buffer.write()?;
        if data.len() > dst.len() {
            return Err(DeviceError::InvalidBuffer(format!(
                "write of {} bytes into `{}` of {} bytes",
                data.len(),
                buffer.label,
                dst.len()
            )));
        }
        dst[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &dyn BufferHandle, out: &mut [u8]) -> DeviceResult<()> {
        let buffer = self.buffer(buffer, 0)?;
        let src = buffer.read()?;
        if out.len() > src.len() {
            return Err(DeviceError::InvalidBuffer(format!(
                "read of {} bytes from `{}` of {} bytes",
                out.len(),
                buffer.label,
                src.len()
            )));
        }
        out.copy_from_slice(&src[..out.len()]);
        Ok(())
    }

    fn build_program(&self, source: &str, entry: &str, options: &BuildOptions) -> DeviceResult<Box<dyn ProgramHandle>> {
        let fail = |log: String| DeviceError::BuildFailure { entry: entry.to_string(), log };

        check_source(source, entry).map_err(fail)?;
        let kernel = NativeKernel::from_entry(entry)
            .ok_or_else(|| fail(format!("no native implementation of `{entry}`")))?;

        let [wx, wy] = options.workgroup;
        if wx == 0 || wy == 0 || invocations(options.workgroup) > self.limits.max_workgroup_invocations as u64 {
            return Err(fail(format!(
                "work-group size {wx}x{wy} outside 1..={} invocations",
                self.limits.max_workgroup_invocations
            )));
        }

        let log = format!("cpu: `{entry}` -> native kernel ({})", options.flags());
        debug!(entry, flags = %options.flags(), "cpu: built program");
        Ok(Box::new(CpuProgram {
            entry: entry.to_string(),
            kernel,
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
            .downcast_ref::<CpuProgram>()
            .ok_or_else(|| DeviceError::InvalidContext("program was not built by the CPU device".into()))?;
        let kernel = program.kernel;
        let signature = kernel.signature();

        if args.len() != signature.len() {
            return Err(DeviceError::argument(
                args.len().min(signature.len()),
                format!("`{}` takes {} arguments, got {}", program.entry, signature.len(), args.len()),
            ));
        }
        for (index, (arg, kind)) in args.iter().zip(signature).enumerate() {
            let matches = matches!(
                (arg, kind),
                (KernelArg::Buffer(_), ArgKind::Buffer)
                    | (KernelArg::Local(_), ArgKind::Local)
                    | (KernelArg::U32(_), ArgKind::U32)
                    | (KernelArg::F32(_), ArgKind::F32)
            );
            if !matches {
                return Err(DeviceError::argument(
                    index,
                    format!("expected {}, got {}", kind.name(), arg.type_name()),
                ));
            }
        }

        // image, auxiliary buffers, [scratch], width, height, channels, [halo]
        let aux = kernel.aux_buffers();
        let scratch_index = 1 + aux;
        let dims_index = if kernel.uses_scratch() { scratch_index + 1 } else { scratch_index };
        let width = u32_at(args, dims_index);
        let height = u32_at(args, dims_index + 1);
        let channels = u32_at(args, dims_index + 2);

        if width == 0 || height == 0 {
            return Err(DeviceError::argument(dims_index, format!("image size {width}x{height}")));
        }
        if !(1..=4).contains(&channels) {
            return Err(DeviceError::argument(dims_index + 2, format!("{channels} channels")));
        }
        launch.validate(program, &self.limits, width, height)?;

        let geo = Geometry {
            width: width as usize,
            height: height as usize,
            channels: channels as usize,
            local: [launch.local[0] as usize, launch.local[1] as usize],
        };

        let halo = if kernel.uses_scratch() {
            let halo = u32_at(args, dims_index + 3);
            let required = scratch_bytes(launch.local, halo, channels);
            let KernelArg::Local(given) = args[scratch_index] else {
                return Err(DeviceError::argument(scratch_index, "expected local"));
            };
            if given < required {
                return Err(DeviceError::argument(
                    scratch_index,
                    format!("scratch of {given} bytes, tile needs {required}"),
                ));
            }
            if given > self.limits.max_local_memory {
                return Err(DeviceError::argument(
                    scratch_index,
                    format!("scratch of {given} bytes exceeds {} byte limit", self.limits.max_local_memory),
                ));
            }
            halo as usize
        } else {
            0
        };

        let mut buffers = Vec::with_capacity(1 + aux);
        for index in 0..=aux {
            let KernelArg::Buffer(handle) = args[index] else {
                return Err(DeviceError::argument(index, "expected buffer"));
            };
            buffers.push(self.buffer(handle, index)?);
        }
        let image = buffers[0];
        for (i, other) in buffers.iter().enumerate().skip(1) {
            if std::ptr::eq(image, *other) {
                return Err(DeviceError::argument(i, "auxiliary buffer aliases the image"));
            }
        }

        let mut data = image.write()?;
        if data.len() < geo.byte_len() {
            return Err(DeviceError::InvalidBuffer(format!(
                "`{}` holds {} bytes, launch needs {}",
                image.label,
                data.len(),
                geo.byte_len()
            )));
        }

        let window = 2 * halo + 1;
        let aux_words = |index: usize, words: usize| -> DeviceResult<Vec<f32>> {
            let bytes = buffers[index].read()?;
            if bytes.len() < words * 4 {
                return Err(DeviceError::argument(
                    index,
                    format!("needs {} bytes, buffer holds {}", words * 4, bytes.len()),
                ));
            }
            Ok(f32_words(&bytes, words))
        };

        trace!(entry = %program.entry, width, height, channels, ?launch, "cpu: launch");
        match kernel {
            NativeKernel::Erode | NativeKernel::MinFilter => cpu_kernels::reduce(&mut data, &geo, halo, false),
            NativeKernel::Dilate | NativeKernel::MaxFilter => cpu_kernels::reduce(&mut data, &geo, halo, true),
            NativeKernel::Median => cpu_kernels::median(&mut data, &geo, halo),
            NativeKernel::Convolve => {
                let mask = aux_words(1, window * window)?;
                let scale = f32_at(args, dims_index + 4);
                cpu_kernels::convolve(&mut data, &geo, halo, &mask, scale);
            }
            NativeKernel::Gradient => {
                let mask_x = aux_words(1, window * window)?;
                let mask_y = aux_words(2, window * window)?;
                let threshold = u32_at(args, dims_index + 4);
                cpu_kernels::gradient(&mut data, &geo, halo, &mask_x, &mask_y, threshold);
            }
            NativeKernel::Lut => {
                let bytes = buffers[1].read()?;
                if bytes.len() < 256 * 4 {
                    return Err(DeviceError::argument(1, "lookup table needs 256 entries"));
                }
                let mut table = [0u8; 256];
                for (t, w) in table.iter_mut().zip(bytes.chunks_exact(4)) {
                    *t = bytemuck::pod_read_unaligned::<u32>(w).min(255) as u8;
                }
                cpu_kernels::lut(&mut data, &geo, &table);
            }
            NativeKernel::Rgb2Hsv => {
                if channels < 3 {
                    return Err(DeviceError::argument(dims_index + 2, "rgb2hsv needs at least 3 channels"));
                }
                cpu_kernels::rgb2hsv(&mut data, &geo);
            }
        }

        let id = self.submitted.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(Fence(id))
    }

    fn wait(&self, fence: Fence) -> DeviceResult<()> {
        if fence.0 > self.submitted.load(Ordering::Acquire) {
            return Err(DeviceError::Other(format!("unknown fence {}", fence.0)));
        }
        Ok(())
    }

    fn finish(&self) -> DeviceResult<()> {
        Ok(())
    }
}
