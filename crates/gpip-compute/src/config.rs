//! Pipeline configuration.
//!
//! # Environment Variables
//!
//! | Variable | Values | Default |
//! |---|---|---|
//! | `GPIP_BACKEND` | `auto`, `cpu`, `wgpu` | `auto` |
//! | `GPIP_LOCAL_SIZE` | `16x16`, `8` (square) | `16x16` |
//! | `GPIP_SYNC` | `fenced`, `in-order` | `fenced` |
//! | `GPIP_ON_FAILURE` | `halt`, `continue` | `halt` |
//! | `GPIP_GPU_MEMORY_MB` | memory budget of the wgpu device | estimated from the adapter |
//!
//! Unparseable values are ignored with a warning.

use std::env;
use std::sync::Arc;

use tracing::warn;

use crate::{DeviceError, DeviceResult};
use crate::context::{DeviceContext, SyncPolicy};
use crate::device::{Backend, BuildOptions, ComputeDevice};
use crate::processor::GpuImageProcessor;

/// What `process()` does after a stage fails with a non-fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop at the first failed stage; later stages are skipped.
    #[default]
    Halt,
    /// Run every stage regardless.
    Continue,
}

impl FailurePolicy {
    /// Parse `halt` / `continue`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "halt" | "stop" => Some(Self::Halt),
            "continue" | "run-all" => Some(Self::Continue),
            _ => None,
        }
    }
}

/// Pipeline settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub backend: Backend,
    /// Work-group size `[x, y]` for every kernel.
    pub local_size: [u32; 2],
    pub sync: SyncPolicy,
    pub on_failure: FailurePolicy,
    /// Allow fused multiply-add in kernels.
    pub mad_enable: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Auto,
            local_size: [16, 16],
            sync: SyncPolicy::Fenced,
            on_failure: FailurePolicy::Halt,
            mad_enable: true,
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `GPIP_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides from `lookup` (keyed by environment variable name).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("GPIP_BACKEND") {
            match Backend::parse(&v) {
                Some(b) => self.backend = b,
                None => warn!(value = %v, "ignoring GPIP_BACKEND"),
            }
        }
        if let Some(v) = lookup("GPIP_LOCAL_SIZE") {
            match parse_local_size(&v) {
                Some(size) => self.local_size = size,
                None => warn!(value = %v, "ignoring GPIP_LOCAL_SIZE"),
            }
        }
        if let Some(v) = lookup("GPIP_SYNC") {
            match SyncPolicy::parse(&v) {
                Some(s) => self.sync = s,
                None => warn!(value = %v, "ignoring GPIP_SYNC"),
            }
        }
        if let Some(v) = lookup("GPIP_ON_FAILURE") {
            match FailurePolicy::parse(&v) {
                Some(p) => self.on_failure = p,
                None => warn!(value = %v, "ignoring GPIP_ON_FAILURE"),
            }
        }
        self
    }

    /// Rejects settings no device can honour.
    pub fn validate(&self) -> DeviceResult<()> {
        let [x, y] = self.local_size;
        if !valid_local_dim(x) || !valid_local_dim(y) {
            return Err(DeviceError::InvalidArgument {
                index: 0,
                reason: format!("local size {x}x{y} outside 1..={MAX_LOCAL_DIM} per dimension"),
            });
        }
        Ok(())
    }

    /// Program build options derived from this config.
    pub fn build_options(&self) -> BuildOptions {
        BuildOptions { mad_enable: self.mad_enable, workgroup: self.local_size }
    }
}

/// Largest work-group dimension accepted from configuration.
pub const MAX_LOCAL_DIM: u32 = 1024;

fn valid_local_dim(d: u32) -> bool {
    (1..=MAX_LOCAL_DIM).contains(&d)
}

/// Parse `WxH` or a single square size; both dimensions must be in `1..=1024`.
fn parse_local_size(value: &str) -> Option<[u32; 2]> {
    let value = value.trim().to_ascii_lowercase();
    let (x, y) = match value.split_once('x') {
        Some((x, y)) => (x.trim().parse().ok()?, y.trim().parse().ok()?),
        None => {
            let s: u32 = value.parse().ok()?;
            (s, s)
        }
    };
    (valid_local_dim(x) && valid_local_dim(y)).then_some([x, y])
}

/// Builder for [`GpuImageProcessor`].
///
/// ```
/// use gpip_compute::{Backend, FailurePolicy, PipelineBuilder};
///
/// let proc = PipelineBuilder::new()
///     .backend(Backend::Cpu)
///     .local_size(8, 8)
///     .on_failure(FailurePolicy::Continue)
///     .build(64, 48, 3)?;
/// assert_eq!(proc.config().local_size, [8, 8]);
/// # Ok::<(), gpip_compute::DeviceError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
}

impl PipelineBuilder {
    /// Start from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from defaults plus environment overrides.
    pub fn from_env() -> Self {
        Self { config: PipelineConfig::from_env() }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn local_size(mut self, x: u32, y: u32) -> Self {
        self.config.local_size = [x, y];
        self
    }

    pub fn sync(mut self, sync: SyncPolicy) -> Self {
        self.config.sync = sync;
        self
    }

    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.config.on_failure = policy;
        self
    }

    pub fn mad_enable(mut self, enable: bool) -> Self {
        self.config.mad_enable = enable;
        self
    }

    /// Select the device and allocate the pipeline for one image geometry.
    ///
    /// Fails with `InvalidArgument` for a local size outside `1..=1024`.
    pub fn build(self, width: u32, height: u32, channels: u32) -> DeviceResult<GpuImageProcessor> {
        self.config.validate()?;
        let context = DeviceContext::new(self.config.backend)?;
        GpuImageProcessor::with_context(context, self.config, width, height, channels)
    }

    /// Like [`build`](Self::build) on an explicit device; the backend setting is ignored.
    pub fn build_with_device(
        self,
        device: Arc<dyn ComputeDevice>,
        width: u32,
        height: u32,
        channels: u32,
    ) -> DeviceResult<GpuImageProcessor> {
        self.config.validate()?;
        GpuImageProcessor::with_context(DeviceContext::from_device(device), self.config, width, height, channels)
    }
}
