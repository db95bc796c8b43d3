//! Pipeline tests on the CPU device.

use gpip_compute::{
    Backend, CompoundStage, DeviceError, DeviceErrorKind, FailurePolicy, FilterCategory, FilterKind,
    GpuImageProcessor, GradientOperator, KernelFilter, KernelSpec, KernelSource, PipelineBuilder, Scalar, StageStatus,
    SyncPolicy,
};
use gpip_core::PackedImage;

fn cpu(width: u32, height: u32, channels: u32) -> GpuImageProcessor {
    PipelineBuilder::new().backend(Backend::Cpu).build(width, height, channels).unwrap()
}

/// Run `kinds` over `img` and return the result.
fn run(img: &PackedImage, kinds: &[FilterKind]) -> PackedImage {
    let mut proc = cpu(img.width(), img.height(), img.channels());
    for kind in kinds {
        proc.add(kind.clone()).unwrap();
    }
    proc.send_image(img).unwrap();
    let report = proc.process();
    assert!(report.all_succeeded(), "{report:?}");
    proc.receive_image().unwrap()
}

fn pattern(width: u32, height: u32, channels: u32) -> PackedImage {
    PackedImage::from_fn(width, height, channels, |x, y, c| (x * 7 + y * 13 + c * 31) as u8).unwrap()
}

#[test]
fn test_roundtrip_without_filters() {
    for (w, h, c) in [(1, 1, 1), (4, 4, 1), (17, 5, 3), (33, 20, 4), (2, 9, 2)] {
        let img = pattern(w, h, c);
        let mut proc = cpu(w, h, c);
        proc.send_image(&img).unwrap();
        assert!(proc.process().is_empty());
        let out = proc.receive_image().unwrap();
        assert_eq!(out, img, "{w}x{h}x{c}");
    }
}

#[test]
fn test_close_fills_dark_pixel() {
    let mut img = PackedImage::filled(4, 4, 1, 100).unwrap();
    img.set_pixel(2, 2, &[0]).unwrap();
    let out = run(&img, &[FilterKind::Close]);
    assert!(out.as_bytes().iter().all(|&v| v == 100));
}

#[test]
fn test_open_removes_bright_pixel() {
    let mut img = PackedImage::new(6, 6, 1).unwrap();
    img.set_pixel(1, 1, &[255]).unwrap();
    let out = run(&img, &[FilterKind::Open]);
    assert!(out.as_bytes().iter().all(|&v| v == 0));
}

#[test]
fn test_open_grows_dark_pixel_into_corner() {
    let mut img = PackedImage::filled(4, 4, 1, 100).unwrap();
    img.set_pixel(2, 2, &[0]).unwrap();
    let out = run(&img, &[FilterKind::Open]);

    let zeros = [(2, 2), (3, 2), (2, 3), (3, 3)];
    for y in 0..4 {
        for x in 0..4 {
            let expected = if zeros.contains(&(x, y)) { 0 } else { 100 };
            assert_eq!(out.pixel(x, y).unwrap(), &[expected], "({x}, {y})");
        }
    }
}

#[test]
fn test_filters_chain_in_order() {
    // dilate then erode is close; erode then dilate is open
    let mut img = PackedImage::filled(4, 4, 1, 100).unwrap();
    img.set_pixel(2, 2, &[0]).unwrap();
    let chained = run(&img, &[FilterKind::Erode, FilterKind::Dilate]);
    let open = run(&img, &[FilterKind::Open]);
    assert_eq!(chained, open);
}

#[test]
fn test_smaller_image_accepted() {
    let mut proc = cpu(8, 8, 1);
    proc.add(FilterKind::Lut(gpip_compute::LookupTable::invert())).unwrap();

    let img = pattern(4, 3, 1);
    proc.send_image(&img).unwrap();
    assert!(proc.process().all_succeeded());
    let out = proc.receive_image().unwrap();
    assert_eq!(out.dimensions(), (4, 3, 1));
    for (a, b) in out.as_bytes().iter().zip(img.as_bytes()) {
        assert_eq!(*a, 255 - *b);
    }
}

#[test]
fn test_oversized_image_rejected() {
    let mut proc = cpu(4, 4, 1);
    let err = proc.send_image(&pattern(5, 4, 1)).unwrap_err();
    assert!(matches!(err, DeviceError::CapacityExceeded { capacity: 16, required: 20 }));

    let err = proc.send_image(&pattern(2, 2, 3)).unwrap_err();
    assert_eq!(err.kind(), DeviceErrorKind::InvalidBuffer);
}

#[test]
fn test_invalid_geometry_rejected() {
    let err = PipelineBuilder::new().backend(Backend::Cpu).build(0, 4, 1).unwrap_err();
    assert_eq!(err.kind(), DeviceErrorKind::InvalidArgument);
    let err = PipelineBuilder::new().backend(Backend::Cpu).build(4, 4, 5).unwrap_err();
    assert_eq!(err.kind(), DeviceErrorKind::InvalidArgument);
}

/// Dilate with a trailing scalar the kernel does not take: builds, then
/// fails at launch with a non-fatal argument error.
fn broken(proc: &GpuImageProcessor) -> KernelFilter {
    let spec = KernelSpec::new("broken", FilterCategory::Morphology, KernelSource::Embedded("morphology"), "dilate")
        .scalar(Scalar::U32(1));
    KernelFilter::new(proc.context(), proc.transfer(), spec, &proc.build_options()).unwrap()
}

#[test]
fn test_halt_policy_skips_after_failure() {
    let mut proc = PipelineBuilder::new()
        .backend(Backend::Cpu)
        .on_failure(FailurePolicy::Halt)
        .build(4, 4, 1)
        .unwrap();
    proc.add(FilterKind::Lut(gpip_compute::LookupTable::invert())).unwrap();
    let filter = broken(&proc);
    proc.add_processing(Box::new(filter));
    proc.add(FilterKind::Lut(gpip_compute::LookupTable::invert())).unwrap();

    let img = PackedImage::filled(4, 4, 1, 10).unwrap();
    proc.send_image(&img).unwrap();
    let report = proc.process();

    assert!(report.halted());
    assert!(report.stages()[0].succeeded());
    assert_eq!(report.stages()[1].error().map(|e| e.kind()), Some(DeviceErrorKind::InvalidArgument));
    assert!(matches!(report.stages()[2].status, StageStatus::Skipped));

    // only the first inversion ran
    let out = proc.receive_image().unwrap();
    assert!(out.as_bytes().iter().all(|&v| v == 245));
}

#[test]
fn test_continue_policy_runs_remaining() {
    let mut proc = PipelineBuilder::new()
        .backend(Backend::Cpu)
        .on_failure(FailurePolicy::Continue)
        .build(4, 4, 1)
        .unwrap();
    proc.add(FilterKind::Lut(gpip_compute::LookupTable::invert())).unwrap();
    let filter = broken(&proc);
    proc.add_processing(Box::new(filter));
    proc.add(FilterKind::Lut(gpip_compute::LookupTable::invert())).unwrap();

    let img = PackedImage::filled(4, 4, 1, 10).unwrap();
    proc.send_image(&img).unwrap();
    let report = proc.process();

    assert!(!report.halted());
    assert_eq!(report.succeeded_count(), 2);
    assert_eq!(report.failures().count(), 1);
    let out = proc.receive_image().unwrap();
    assert_eq!(out, img);
}

#[test]
fn test_every_scalar_kind_binds() {
    let img = pattern(6, 5, 1);
    let cases = [
        (FilterKind::Gradient { operator: GradientOperator::Sobel, threshold: 3 }, Scalar::U32(3)),
        (FilterKind::Mean, Scalar::F32(1.0 / 9.0)),
    ];
    for (kind, scalar) in cases {
        // no wildcard: a new variant needs a built-in kernel that takes it
        match scalar {
            Scalar::U32(_) | Scalar::F32(_) => {}
        }
        assert_eq!(kind.kernel_spec().unwrap().scalars(), &[scalar]);
        run(&img, &[kind]);
    }
}

#[test]
fn test_oversized_local_size_rejected() {
    let err = PipelineBuilder::new()
        .backend(Backend::Cpu)
        .local_size(65536, 65536)
        .build(4, 4, 1)
        .unwrap_err();
    assert_eq!(err.kind(), DeviceErrorKind::InvalidArgument);
}

#[test]
fn test_receive_bytes_matches_receive_image() {
    let img = pattern(5, 3, 2);
    let mut proc = cpu(8, 8, 2);
    proc.add(FilterKind::Lut(gpip_compute::LookupTable::invert())).unwrap();
    proc.send_image(&img).unwrap();
    assert!(proc.process().all_succeeded());
    let bytes = proc.receive_bytes().unwrap().to_vec();
    assert_eq!(bytes.len(), 30);
    assert_eq!(proc.receive_image().unwrap().as_bytes(), &bytes[..]);
}

#[test]
fn test_build_failure_surfaces_log() {
    let mut proc = cpu(4, 4, 1);
    let spec = KernelSpec::new("missing", FilterCategory::ContextFree, KernelSource::Embedded("lut"), "posterize");
    let err = KernelFilter::new(proc.context(), proc.transfer(), spec, &proc.build_options()).unwrap_err();
    assert!(err.is_fatal());
    assert!(err.build_log().is_some_and(|log| !log.is_empty()));

    // a failed add leaves the pipeline untouched
    let err = proc
        .add(FilterKind::Rgb2Hsv)
        .expect_err("rgb2hsv needs three channels");
    assert_eq!(err.kind(), DeviceErrorKind::InvalidArgument);
    assert!(proc.is_empty());
}

#[test]
fn test_reprocess_same_image_twice() {
    let mut proc = cpu(3, 3, 1);
    proc.add(FilterKind::Lut(gpip_compute::LookupTable::from_fn(|v| v.saturating_add(10)))).unwrap();
    proc.send_image(&PackedImage::filled(3, 3, 1, 5).unwrap()).unwrap();
    assert!(proc.process().all_succeeded());
    assert!(proc.process().all_succeeded());
    let out = proc.receive_image().unwrap();
    assert!(out.as_bytes().iter().all(|&v| v == 25));
}

#[test]
fn test_in_order_sync_matches_fenced() {
    let mut img = PackedImage::filled(8, 8, 1, 100).unwrap();
    img.set_pixel(3, 4, &[0]).unwrap();

    let mut results = Vec::new();
    for sync in [SyncPolicy::Fenced, SyncPolicy::InOrder] {
        let mut proc = PipelineBuilder::new().backend(Backend::Cpu).sync(sync).build(8, 8, 1).unwrap();
        proc.add(FilterKind::Open).unwrap();
        proc.add(FilterKind::Median).unwrap();
        proc.send_image(&img).unwrap();
        assert!(proc.process().all_succeeded());
        results.push(proc.receive_image().unwrap());
    }
    assert_eq!(results[0], results[1]);
}

#[test]
fn test_small_work_groups() {
    // 8x4 groups over a ragged image exercise partial groups
    let mut img = PackedImage::filled(13, 7, 1, 100).unwrap();
    img.set_pixel(6, 3, &[0]).unwrap();

    let mut proc = PipelineBuilder::new().backend(Backend::Cpu).local_size(8, 4).build(13, 7, 1).unwrap();
    proc.add(FilterKind::Close).unwrap();
    proc.send_image(&img).unwrap();
    assert!(proc.process().all_succeeded());
    let out = proc.receive_image().unwrap();
    assert!(out.as_bytes().iter().all(|&v| v == 100));
}

#[test]
fn test_compound_stage_reaches_done() {
    let proc = cpu(4, 4, 1);
    let mut close = FilterKind::Close
        .build_compound(proc.context(), proc.transfer(), &proc.build_options())
        .unwrap();
    assert_eq!(close.stage(), CompoundStage::Stage1);
    assert!(gpip_compute::Filter::filter(&mut close, proc.queue()));
    assert_eq!(close.stage(), CompoundStage::Done);
}
