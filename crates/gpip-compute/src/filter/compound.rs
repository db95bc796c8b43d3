//! Two-stage morphology filters.

use super::{Filter, FilterCategory, KernelFilter};
use crate::DeviceResult;
use crate::context::CommandQueue;

/// Progress of a compound filter through its two stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundStage {
    /// First sub-filter pending, or failed.
    Stage1,
    /// First sub-filter done; second pending, or failed.
    Stage2,
    /// Both stages enqueued.
    Done,
}

/// Two primitive filters run back to back, with a stage barrier between them.
///
/// Open is erode then dilate; close is dilate then erode.
#[derive(Debug)]
pub struct CompoundFilter {
    name: String,
    first: KernelFilter,
    second: KernelFilter,
    stage: CompoundStage,
}

impl CompoundFilter {
    pub fn new(name: impl Into<String>, first: KernelFilter, second: KernelFilter) -> Self {
        Self { name: name.into(), first, second, stage: CompoundStage::Stage1 }
    }

    /// Stage reached by the last run.
    pub fn stage(&self) -> CompoundStage {
        self.stage
    }

    pub fn stages(&self) -> (&KernelFilter, &KernelFilter) {
        (&self.first, &self.second)
    }
}

impl Filter for CompoundFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> FilterCategory {
        FilterCategory::Morphology
    }

    fn bind_and_launch(&mut self, queue: &CommandQueue) -> DeviceResult<()> {
        self.stage = CompoundStage::Stage1;
        self.first.bind_and_launch(queue)?;

        self.stage = CompoundStage::Stage2;
        queue.stage_barrier()?;
        self.second.bind_and_launch(queue)?;

        self.stage = CompoundStage::Done;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DeviceContext, SyncPolicy};
    use crate::device::{Backend, BuildOptions};
    use crate::filter::{FilterKind, KernelSpec, Scalar};
    use crate::kernels::KernelSource;
    use crate::transfer::DeviceTransferManager;

    #[test]
    fn test_stage_tracking() {
        let ctx = DeviceContext::new(Backend::Cpu).unwrap();
        let queue = ctx.create_queue(SyncPolicy::Fenced);
        let tm = DeviceTransferManager::new(&ctx, &queue, 4, 4, 1).unwrap();
        let opts = BuildOptions::default();

        let mut close = FilterKind::Close.build_compound(&ctx, &tm, &opts).unwrap();
        assert_eq!(close.stage(), CompoundStage::Stage1);
        assert_eq!(close.stages().0.kernel().entry_point(), "dilate");
        assert_eq!(close.stages().1.kernel().entry_point(), "erode");
        assert!(close.filter(&queue));
        assert_eq!(close.stage(), CompoundStage::Done);
    }

    #[test]
    fn test_second_stage_failure_is_recorded() {
        let ctx = DeviceContext::new(Backend::Cpu).unwrap();
        let queue = ctx.create_queue(SyncPolicy::Fenced);
        let tm = DeviceTransferManager::new(&ctx, &queue, 4, 4, 1).unwrap();
        let opts = BuildOptions::default();

        let erode = KernelSpec::new("erode", FilterCategory::Morphology, KernelSource::Embedded("morphology"), "erode");
        // dilate takes no trailing scalars, so the launch is rejected
        let broken = KernelSpec::new("broken", FilterCategory::Morphology, KernelSource::Embedded("morphology"), "dilate")
            .scalar(Scalar::U32(7));
        let mut compound = CompoundFilter::new(
            "broken open",
            KernelFilter::new(&ctx, &tm, erode, &opts).unwrap(),
            KernelFilter::new(&ctx, &tm, broken, &opts).unwrap(),
        );

        assert!(!compound.filter(&queue));
        assert_eq!(compound.stage(), CompoundStage::Stage2);
    }
}
