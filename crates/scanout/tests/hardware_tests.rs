// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! On-target integration tests against real display and capture hardware.
//!
//! These tests require:
//! - a DRM card with at least one connected output (/dev/dri/card*)
//! - /dev/dma_heap available (CMA or system heap)
//! - a V4L2 capture device at /dev/video0 producing 640x480 YUYV
//!
//! Run with: cargo test --test hardware_tests -- --ignored

#![cfg(target_os = "linux")]

use std::sync::Arc;

use scanout::alloc::PlaneRequest;
use scanout::display::connected_outputs;
use scanout::{
    Allocator, Backend, BackendKind, CapturePipeline, CaptureSpec, CpuAccess, Display,
    DmaHeapAllocator, DrmDevice, DumbAllocator, FlipLoop, KmsScanout, ModeSelection,
    PipelineConfig, Scanout, V4l2Capture,
};

/// Drive the first connected output in its preferred mode.
fn open_kms() -> (Display<KmsScanout>, Arc<DrmDevice>) {
    let device = Arc::new(DrmDevice::open_first_card().expect("no DRM card"));
    let kms = KmsScanout::new(device.clone()).expect("KMS resources");
    let connector = connected_outputs(&kms)
        .expect("connectors")
        .into_iter()
        .next()
        .expect("no connected output");
    let selection = ModeSelection::preferred(&connector).expect("connector without modes");
    let display = Display::open(kms, &[selection]).expect("open display");
    assert_eq!(display.outputs().len(), 1);
    (display, device)
}

// =============================================================================
// Backend detection
// =============================================================================

#[test]
#[ignore = "requires a DRM card"]
fn test_probe_finds_kms() {
    let _ = env_logger::try_init();

    assert!(BackendKind::probe().contains(&BackendKind::Kms));
    let backend = Backend::open(BackendKind::Kms).expect("open KMS backend");
    assert_eq!(backend.kind(), BackendKind::Kms);
    assert!(backend.drm_device().is_some());
    assert!(!backend.crtcs().expect("crtcs").is_empty());
}

// =============================================================================
// Allocators
// =============================================================================

#[test]
#[ignore = "requires /dev/dma_heap"]
fn test_dma_heap_plane_is_mapped_and_synced() {
    let _ = env_logger::try_init();

    let allocator = DmaHeapAllocator::new().expect("dma heap");
    let mut plane = allocator
        .allocate(&PlaneRequest {
            width: 640,
            height: 480,
            bpp: 32,
            tiling: scanout::TilingMode::Linear,
        })
        .expect("allocate");
    assert!(plane.size() >= 640 * 480 * 4);

    plane.begin_cpu_access(CpuAccess::Write).expect("begin");
    plane.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
    plane.end_cpu_access(CpuAccess::Write).expect("end");

    plane.begin_cpu_access(CpuAccess::Read).expect("begin");
    assert_eq!(&plane.as_slice()[..4], &[1, 2, 3, 4]);
    plane.end_cpu_access(CpuAccess::Read).expect("end");
}

#[test]
#[ignore = "requires a DRM card"]
fn test_dumb_buffers_flip() {
    let _ = env_logger::try_init();

    let (display, device) = open_kms();
    let allocator = DumbAllocator::new(device);
    let mut flip =
        FlipLoop::new(display, &allocator, &PipelineConfig::default()).expect("flip loop");
    flip.run(60).expect("flip");
    flip.shutdown().expect("teardown");
}

// =============================================================================
// Capture
// =============================================================================

#[test]
#[ignore = "requires a DRM card with overlay planes and /dev/video0"]
fn test_camera_to_overlay() {
    let _ = env_logger::try_init();

    let (display, _device) = open_kms();
    let spec: CaptureSpec = "640x480@YUYV".parse().expect("capture spec");
    let camera = V4l2Capture::open("/dev/video0", spec).expect("open camera");
    let allocator = DmaHeapAllocator::new().expect("dma heap");
    let config = PipelineConfig {
        fps: 30,
        ..PipelineConfig::default().with_capture(spec)
    };

    let mut capture =
        CapturePipeline::new(display, &allocator, camera, &config).expect("capture pipeline");
    capture.run(90).expect("stream");
    assert_eq!(capture.frames(), 90);
    capture.shutdown().expect("teardown");
}
