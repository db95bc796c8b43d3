//! wgpu device tests. Need a GPU adapter; run with
//! `cargo test --features wgpu -- --ignored`.

#![cfg(feature = "wgpu")]

use gpip_compute::{Backend, FilterKind, GpuImageProcessor, GradientOperator, LookupTable, PipelineBuilder};
use gpip_core::PackedImage;

fn run_on(backend: Backend, img: &PackedImage, kinds: &[FilterKind]) -> PackedImage {
    let mut proc: GpuImageProcessor = PipelineBuilder::new()
        .backend(backend)
        .build(img.width(), img.height(), img.channels())
        .unwrap();
    for kind in kinds {
        proc.add(kind.clone()).unwrap();
    }
    proc.send_image(img).unwrap();
    let report = proc.process();
    assert!(report.all_succeeded(), "{report:?}");
    proc.receive_image().unwrap()
}

fn noisy(width: u32, height: u32, channels: u32) -> PackedImage {
    PackedImage::from_fn(width, height, channels, |x, y, c| ((x * 37 + y * 91 + c * 53) % 251) as u8).unwrap()
}

#[test]
#[ignore = "requires a GPU adapter"]
fn test_wgpu_matches_cpu() {
    let cases = [
        vec![FilterKind::Erode],
        vec![FilterKind::Open, FilterKind::Close],
        vec![FilterKind::Median],
        vec![FilterKind::Lut(LookupTable::invert())],
        vec![FilterKind::Rgb2Hsv],
    ];
    // odd sizes exercise partial work-groups and the padded tail word
    let img = noisy(37, 21, 3);
    for kinds in cases {
        let gpu = run_on(Backend::Wgpu, &img, &kinds);
        let cpu = run_on(Backend::Cpu, &img, &kinds);
        assert_eq!(gpu, cpu, "{kinds:?}");
    }
}

#[test]
#[ignore = "requires a GPU adapter"]
fn test_wgpu_linear_filters_within_one() {
    // fused multiply-add may move a rounding boundary by one
    let img = noisy(24, 16, 3);
    for kind in [FilterKind::Mean, FilterKind::Gradient { operator: GradientOperator::Sobel, threshold: 20 }] {
        let gpu = run_on(Backend::Wgpu, &img, &[kind.clone()]);
        let cpu = run_on(Backend::Cpu, &img, &[kind.clone()]);
        for (a, b) in gpu.as_bytes().iter().zip(cpu.as_bytes()) {
            assert!(a.abs_diff(*b) <= 1, "{kind:?}");
        }
    }
}

#[test]
#[ignore = "requires a GPU adapter"]
fn test_wgpu_roundtrip() {
    let img = noisy(5, 3, 1);
    assert_eq!(run_on(Backend::Wgpu, &img, &[]), img);
}
