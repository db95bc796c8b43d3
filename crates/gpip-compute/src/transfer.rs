//! Host/device image transfers.
//!
//! [`DeviceTransferManager`] owns the single device-resident image buffer and
//! its host mirror. Both are allocated once, at construction, with a fixed
//! byte capacity; every upload and download reuses them.
//!
//! Filters hold an `Arc<DeviceImage>` so they always launch against the
//! geometry of the most recently sent image.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use gpip_core::PackedImage;
use tracing::debug;

use crate::context::{CommandQueue, DeviceBuffer, DeviceContext};
use crate::device::BufferAccess;
use crate::{DeviceError, DeviceResult};

/// Host mirror of the device image buffer's byte layout.
///
/// Ordinary pageable memory, allocated once and never grown. Downloads land
/// here; the wgpu device maps its own readback buffer for the copy.
pub struct HostStagingBuffer {
    data: Vec<u8>,
}

impl HostStagingBuffer {
    /// Allocate `capacity` zeroed bytes, reporting failure instead of aborting.
    pub fn new(capacity: usize) -> DeviceResult<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity).map_err(|e| DeviceError::AllocationFailure {
            label: "host staging".into(),
            size: capacity as u64,
            reason: e.to_string(),
        })?;
        data.resize(capacity, 0);
        Ok(Self { data })
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for HostStagingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostStagingBuffer").field("capacity", &self.data.len()).finish()
    }
}

/// Device-resident image: the buffer plus the geometry of its contents.
pub struct DeviceImage {
    buffer: DeviceBuffer,
    // width in the high half, height in the low half
    extent: AtomicU64,
    channels: u32,
}

impl DeviceImage {
    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    /// `(width, height, channels)` of the current contents.
    pub fn dimensions(&self) -> (u32, u32, u32) {
        let extent = self.extent.load(Ordering::Acquire);
        ((extent >> 32) as u32, extent as u32, self.channels)
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    fn set_extent(&self, width: u32, height: u32) {
        self.extent.store(((width as u64) << 32) | height as u64, Ordering::Release);
    }
}

impl std::fmt::Debug for DeviceImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (width, height, channels) = self.dimensions();
        f.debug_struct("DeviceImage")
            .field("width", &width)
            .field("height", &height)
            .field("channels", &channels)
            .field("buffer", &self.buffer)
            .finish()
    }
}

/// Owner of the device image buffer and its host staging buffer.
pub struct DeviceTransferManager {
    image: Arc<DeviceImage>,
    host: HostStagingBuffer,
}

impl DeviceTransferManager {
    /// Allocate host and device buffers of `width * height * channels` bytes.
    ///
    /// `queue` must belong to `context`.
    pub fn new(
        context: &DeviceContext,
        queue: &CommandQueue,
        width: u32,
        height: u32,
        channels: u32,
    ) -> DeviceResult<Self> {
        if !queue.context().same_device(context) {
            return Err(DeviceError::InvalidContext("queue belongs to a different device".into()));
        }
        let capacity = PackedImage::byte_size(width, height, channels)?;

        let host = HostStagingBuffer::new(capacity)?;
        let buffer = context.create_buffer("image", capacity as u64, BufferAccess::ReadWrite)?;
        let image = DeviceImage { buffer, extent: AtomicU64::new(0), channels };
        image.set_extent(width, height);
        debug!(width, height, channels, capacity, "transfer manager allocated");

        Ok(Self { image: Arc::new(image), host })
    }

    /// Byte capacity of the device image buffer.
    pub fn capacity(&self) -> usize {
        self.host.capacity()
    }

    /// Geometry of the most recently sent image (construction geometry before that).
    pub fn dimensions(&self) -> (u32, u32, u32) {
        self.image.dimensions()
    }

    pub fn channels(&self) -> u32 {
        self.image.channels()
    }

    /// Bytes of the current image.
    pub fn byte_len(&self) -> usize {
        let (width, height, channels) = self.dimensions();
        width as usize * height as usize * channels as usize
    }

    /// The device image buffer, argument 0 of every kernel.
    pub fn image_buffer(&self) -> &DeviceBuffer {
        self.image.buffer()
    }

    /// Shared handle to the device image for filters.
    pub fn device_image(&self) -> Arc<DeviceImage> {
        Arc::clone(&self.image)
    }

    /// Blocking upload of `image` into the device buffer.
    ///
    /// The image may differ in width and height from the construction
    /// geometry as long as it fits; the channel count may not change.
    pub fn send_image(&mut self, image: &PackedImage) -> DeviceResult<()> {
        if image.channels() != self.channels() {
            return Err(DeviceError::InvalidBuffer(format!(
                "image has {} channels, pipeline was built for {}",
                image.channels(),
                self.channels()
            )));
        }
        if image.byte_len() > self.capacity() {
            return Err(DeviceError::CapacityExceeded { capacity: self.capacity(), required: image.byte_len() });
        }

        self.image.buffer.write(image.as_bytes())?;
        self.image.set_extent(image.width(), image.height());
        debug!(width = image.width(), height = image.height(), bytes = image.byte_len(), "image sent");
        Ok(())
    }

    /// Drain `queue` and download the current image into the host mirror.
    ///
    /// The returned bytes are valid until the next transfer.
    pub fn receive_bytes(&mut self, queue: &CommandQueue) -> DeviceResult<&[u8]> {
        queue.finish()?;
        let (width, height, _) = self.dimensions();
        let len = self.byte_len();
        let host = &mut self.host.as_mut_slice()[..len];
        self.image.buffer.read(host)?;
        debug!(width, height, bytes = len, "image received");
        Ok(host)
    }

    /// [`receive_bytes`](Self::receive_bytes) as an owned image with the
    /// recorded geometry.
    pub fn receive_image(&mut self, queue: &CommandQueue) -> DeviceResult<PackedImage> {
        let (width, height, channels) = self.dimensions();
        let bytes = self.receive_bytes(queue)?.to_vec();
        Ok(PackedImage::from_vec(bytes, width, height, channels)?)
    }
}

impl std::fmt::Debug for DeviceTransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (width, height, channels) = self.dimensions();
        f.debug_struct("DeviceTransferManager")
            .field("width", &width)
            .field("height", &height)
            .field("channels", &channels)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SyncPolicy;
    use crate::device::{Backend, CpuDevice, DeviceLimits};
    use std::sync::Arc;

    #[test]
    fn test_staging_buffer_zeroed() {
        let mut host = HostStagingBuffer::new(4).unwrap();
        assert_eq!(host.as_slice(), &[0; 4]);
        host.as_mut_slice()[1] = 9;
        assert_eq!(host.capacity(), 4);
        assert_eq!(host.as_slice(), &[0, 9, 0, 0]);
    }

    #[test]
    fn test_receive_bytes_views_host_mirror() {
        let ctx = DeviceContext::new(Backend::Cpu).unwrap();
        let queue = ctx.create_queue(SyncPolicy::Fenced);
        let mut tm = DeviceTransferManager::new(&ctx, &queue, 4, 4, 1).unwrap();

        let img = PackedImage::from_fn(2, 3, 1, |x, y, _| (x + 2 * y + 1) as u8).unwrap();
        tm.send_image(&img).unwrap();
        // only the sent image, not the whole capacity
        assert_eq!(tm.receive_bytes(&queue).unwrap(), img.as_bytes());
        assert_eq!(tm.host.as_slice()[..6], *img.as_bytes());
        assert_eq!(tm.receive_image(&queue).unwrap(), img);
    }

    #[test]
    fn test_smaller_image_keeps_geometry() {
        let ctx = DeviceContext::new(Backend::Cpu).unwrap();
        let queue = ctx.create_queue(SyncPolicy::Fenced);
        let mut tm = DeviceTransferManager::new(&ctx, &queue, 4, 4, 1).unwrap();
        assert_eq!(tm.capacity(), 16);

        let img = PackedImage::from_fn(3, 2, 1, |x, y, _| (x + 10 * y) as u8).unwrap();
        tm.send_image(&img).unwrap();
        assert_eq!(tm.dimensions(), (3, 2, 1));
        assert_eq!(tm.device_image().dimensions(), (3, 2, 1));
        assert_eq!(tm.receive_image(&queue).unwrap(), img);
    }

    #[test]
    fn test_rejects_overrun_and_channel_change() {
        let ctx = DeviceContext::new(Backend::Cpu).unwrap();
        let queue = ctx.create_queue(SyncPolicy::Fenced);
        let mut tm = DeviceTransferManager::new(&ctx, &queue, 2, 2, 3).unwrap();

        let big = PackedImage::new(3, 2, 3).unwrap();
        let err = tm.send_image(&big).unwrap_err();
        assert!(matches!(err, DeviceError::CapacityExceeded { capacity: 12, required: 18 }));

        // 12 bytes but 4 channels
        let rgba = PackedImage::new(3, 1, 4).unwrap();
        assert!(matches!(tm.send_image(&rgba), Err(DeviceError::InvalidBuffer(_))));
        assert_eq!(tm.dimensions(), (2, 2, 3));
    }

    #[test]
    fn test_allocation_failure() {
        let dev = CpuDevice::with_limits(DeviceLimits { available_memory: 8, ..DeviceLimits::default() });
        let ctx = DeviceContext::from_device(Arc::new(dev));
        let queue = ctx.create_queue(SyncPolicy::Fenced);
        let err = DeviceTransferManager::new(&ctx, &queue, 4, 4, 1).unwrap_err();
        assert!(matches!(err, DeviceError::AllocationFailure { size: 16, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_foreign_queue_rejected() {
        let a = DeviceContext::new(Backend::Cpu).unwrap();
        let b = DeviceContext::new(Backend::Cpu).unwrap();
        let queue = b.create_queue(SyncPolicy::Fenced);
        let err = DeviceTransferManager::new(&a, &queue, 2, 2, 1).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidContext(_)));
    }

    #[test]
    fn test_invalid_geometry() {
        let ctx = DeviceContext::new(Backend::Cpu).unwrap();
        let queue = ctx.create_queue(SyncPolicy::Fenced);
        let err = DeviceTransferManager::new(&ctx, &queue, 0, 4, 1).unwrap_err();
        assert!(matches!(err, DeviceError::Image(_)));
    }
}
