//! Pipeline orchestrator.
//!
//! [`GpuImageProcessor`] owns the device context, the command queue, the
//! transfer manager and the ordered filter list. Filters run in insertion
//! order against the one device-resident image.
//!
//! # Lifecycle
//!
//! ```text
//! build -> add / add_processing ... -> send_image -> process -> receive_image
//!                                          ^                        |
//!                                          +------------------------+
//! ```

use gpip_core::PackedImage;
use tracing::{debug, info, warn};

use crate::config::{FailurePolicy, PipelineBuilder, PipelineConfig};
use crate::context::{CommandQueue, DeviceContext};
use crate::device::BuildOptions;
use crate::filter::{Filter, FilterKind};
use crate::transfer::DeviceTransferManager;
use crate::{DeviceError, DeviceResult};

/// Result of one stage in a [`ProcessReport`].
#[derive(Debug)]
pub enum StageStatus {
    Succeeded,
    Failed(DeviceError),
    /// Not run because an earlier stage halted the chain.
    Skipped,
}

/// One registered filter's outcome.
#[derive(Debug)]
pub struct StageOutcome {
    pub index: usize,
    pub name: String,
    pub status: StageStatus,
}

impl StageOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, StageStatus::Succeeded)
    }

    pub fn error(&self) -> Option<&DeviceError> {
        match &self.status {
            StageStatus::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Per-stage outcomes of one `process()` call, in execution order.
#[derive(Debug, Default)]
pub struct ProcessReport {
    stages: Vec<StageOutcome>,
    halted: bool,
}

impl ProcessReport {
    pub fn stages(&self) -> &[StageOutcome] {
        &self.stages
    }

    /// True when every stage succeeded (vacuously for an empty pipeline).
    pub fn all_succeeded(&self) -> bool {
        self.stages.iter().all(StageOutcome::succeeded)
    }

    /// Stages that failed.
    pub fn failures(&self) -> impl Iterator<Item = &StageOutcome> {
        self.stages.iter().filter(|s| s.error().is_some())
    }

    pub fn succeeded_count(&self) -> usize {
        self.stages.iter().filter(|s| s.succeeded()).count()
    }

    /// Whether a failure stopped the chain early.
    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Host-side GPU image-filter pipeline.
///
/// Field order is drop order: filters, then the transfer manager, then the
/// queue, then the context.
pub struct GpuImageProcessor {
    filters: Vec<Box<dyn Filter>>,
    transfer: DeviceTransferManager,
    queue: CommandQueue,
    context: DeviceContext,
    config: PipelineConfig,
}

impl GpuImageProcessor {
    /// Pipeline for `width x height x channels` images, configured from the
    /// environment (see [`PipelineConfig::from_env`]).
    pub fn new(width: u32, height: u32, channels: u32) -> DeviceResult<Self> {
        PipelineBuilder::from_env().build(width, height, channels)
    }

    /// Pipeline on an existing context.
    pub fn with_context(
        context: DeviceContext,
        config: PipelineConfig,
        width: u32,
        height: u32,
        channels: u32,
    ) -> DeviceResult<Self> {
        let queue = context.create_queue(config.sync);
        let transfer = DeviceTransferManager::new(&context, &queue, width, height, channels)?;
        info!(
            backend = context.name(),
            width,
            height,
            channels,
            local = ?config.local_size,
            sync = ?config.sync,
            on_failure = ?config.on_failure,
            "pipeline created"
        );
        Ok(Self { filters: Vec::new(), transfer, queue, context, config })
    }

    /// Append a filter. Insertion order is execution order.
    pub fn add_processing(&mut self, filter: Box<dyn Filter>) {
        debug!(filter = filter.name(), position = self.filters.len(), "filter registered");
        self.filters.push(filter);
    }

    /// Build `kind` against this pipeline's context and image, then register it.
    pub fn add(&mut self, kind: FilterKind) -> DeviceResult<()> {
        let filter = kind.build(&self.context, &self.transfer, &self.build_options())?;
        self.add_processing(filter);
        Ok(())
    }

    /// Run every registered filter once, in order.
    ///
    /// Fatal errors always stop the chain; other failures stop it under
    /// [`FailurePolicy::Halt`]. Stages after a halt are reported as skipped.
    pub fn process(&mut self) -> ProcessReport {
        let mut report = ProcessReport::default();

        for (index, filter) in self.filters.iter_mut().enumerate() {
            let name = filter.name().to_string();
            if report.halted {
                report.stages.push(StageOutcome { index, name, status: StageStatus::Skipped });
                continue;
            }

            let result = if index == 0 {
                filter.bind_and_launch(&self.queue)
            } else {
                self.queue.stage_barrier().and_then(|()| filter.bind_and_launch(&self.queue))
            };

            let status = match result {
                Ok(()) => StageStatus::Succeeded,
                Err(err) => {
                    warn!(stage = index, filter = %name, kind = ?err.kind(), error = %err, "stage failed");
                    if err.is_fatal() || self.config.on_failure == FailurePolicy::Halt {
                        report.halted = true;
                    }
                    StageStatus::Failed(err)
                }
            };
            report.stages.push(StageOutcome { index, name, status });
        }

        debug!(
            stages = report.len(),
            succeeded = report.succeeded_count(),
            halted = report.halted,
            "process finished"
        );
        report
    }

    /// Blocking upload of the input image.
    pub fn send_image(&mut self, image: &PackedImage) -> DeviceResult<()> {
        self.transfer.send_image(image)
    }

    /// Wait for all queued work, then download the image.
    pub fn receive_image(&mut self) -> DeviceResult<PackedImage> {
        self.transfer.receive_image(&self.queue)
    }

    /// Like [`receive_image`](Self::receive_image) but borrows the host
    /// mirror instead of copying it out.
    pub fn receive_bytes(&mut self) -> DeviceResult<&[u8]> {
        self.transfer.receive_bytes(&self.queue)
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn transfer(&self) -> &DeviceTransferManager {
        &self.transfer
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Options every filter of this pipeline is built with.
    pub fn build_options(&self) -> BuildOptions {
        self.config.build_options()
    }

    /// Registered filter names, in execution order.
    pub fn filter_names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl std::fmt::Debug for GpuImageProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuImageProcessor")
            .field("context", &self.context)
            .field("transfer", &self.transfer)
            .field("filters", &self.filter_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SyncPolicy;
    use crate::device::Backend;
    use crate::filter::FilterCategory;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records its run order and fails on demand.
    struct Recorder {
        name: String,
        log: Arc<std::sync::Mutex<Vec<String>>>,
        fail: Option<fn() -> DeviceError>,
        runs: Arc<AtomicUsize>,
    }

    impl Filter for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn category(&self) -> FilterCategory {
            FilterCategory::ContextFree
        }

        fn bind_and_launch(&mut self, _queue: &CommandQueue) -> DeviceResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(self.name.clone());
            match self.fail {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
    }

    fn processor(policy: FailurePolicy) -> GpuImageProcessor {
        PipelineBuilder::new()
            .backend(Backend::Cpu)
            .on_failure(policy)
            .build(4, 4, 1)
            .unwrap()
    }

    fn recorder(
        name: &str,
        log: &Arc<std::sync::Mutex<Vec<String>>>,
        fail: Option<fn() -> DeviceError>,
    ) -> (Box<dyn Filter>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let filter = Recorder { name: name.into(), log: log.clone(), fail, runs: runs.clone() };
        (Box::new(filter), runs)
    }

    fn argument_error() -> DeviceError {
        DeviceError::argument(2, "bad width")
    }

    fn build_error() -> DeviceError {
        DeviceError::BuildFailure { entry: "x".into(), log: "boom".into() }
    }

    #[test]
    fn test_runs_in_insertion_order() {
        let log = Arc::default();
        let mut proc = processor(FailurePolicy::Halt);
        for name in ["a", "b", "c"] {
            proc.add_processing(recorder(name, &log, None).0);
        }
        let report = proc.process();
        assert!(report.all_succeeded());
        assert_eq!(report.len(), 3);
        assert_eq!(*log.lock().unwrap(), ["a", "b", "c"]);
        assert_eq!(proc.filter_names(), ["a", "b", "c"]);
    }

    #[test]
    fn test_halt_skips_remaining() {
        let log = Arc::default();
        let mut proc = processor(FailurePolicy::Halt);
        proc.add_processing(recorder("a", &log, None).0);
        proc.add_processing(recorder("b", &log, Some(argument_error)).0);
        let (c, c_runs) = recorder("c", &log, None);
        proc.add_processing(c);

        let report = proc.process();
        assert!(report.halted());
        assert_eq!(report.succeeded_count(), 1);
        assert_eq!(report.failures().count(), 1);
        assert!(matches!(report.stages()[2].status, StageStatus::Skipped));
        assert_eq!(c_runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_continue_runs_everything() {
        let log = Arc::default();
        let mut proc = processor(FailurePolicy::Continue);
        proc.add_processing(recorder("a", &log, Some(argument_error)).0);
        let (b, b_runs) = recorder("b", &log, None);
        proc.add_processing(b);

        let report = proc.process();
        assert!(!report.halted());
        assert!(!report.all_succeeded());
        assert_eq!(report.stages()[0].error().map(|e| e.kind()), Some(crate::DeviceErrorKind::InvalidArgument));
        assert!(report.stages()[1].succeeded());
        assert_eq!(b_runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fatal_error_halts_under_continue() {
        let log = Arc::default();
        let mut proc = processor(FailurePolicy::Continue);
        proc.add_processing(recorder("a", &log, Some(build_error)).0);
        let (b, b_runs) = recorder("b", &log, None);
        proc.add_processing(b);

        let report = proc.process();
        assert!(report.halted());
        assert_eq!(b_runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_pipeline() {
        let mut proc = processor(FailurePolicy::Halt);
        assert!(proc.is_empty());
        let report = proc.process();
        assert!(report.is_empty());
        assert!(report.all_succeeded());
    }

    #[test]
    fn test_sync_policy_from_config() {
        let proc = PipelineBuilder::new()
            .backend(Backend::Cpu)
            .sync(SyncPolicy::InOrder)
            .build(2, 2, 1)
            .unwrap();
        assert_eq!(proc.queue().sync_policy(), SyncPolicy::InOrder);
    }
}
