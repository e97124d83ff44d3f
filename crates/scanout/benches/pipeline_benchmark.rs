// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Criterion benchmarks for the buffer lifecycle and presentation path.
//!
//! Everything runs on the headless scanout with host memory, so the numbers
//! measure the bookkeeping overhead of the pipeline, not the hardware.
//!
//! ## Run
//! ```bash
//! cargo bench --bench pipeline_benchmark
//! ```
//!
//! ## Machine-readable output
//! ```bash
//! cargo bench --bench pipeline_benchmark -- --output-format bencher
//! ```

#![cfg(target_os = "linux")]

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use scanout::{
    pattern, BufferId, BufferPool, CaptureBridge, Display, HeadlessScanout, HostAllocator,
    LoopbackProducer, Mode, PixelFormat, RateGovernor, TilingMode,
};

// =============================================================================
// Fixtures
// =============================================================================

const RESOLUTIONS: &[(u16, u16)] = &[(640, 480), (1280, 720), (1920, 1080)];

fn display(width: u16, height: u16) -> Display<HeadlessScanout> {
    let name = format!("{width}x{height}");
    let scanout = HeadlessScanout::new()
        .expect("headless scanout")
        .with_output(1, 1, vec![Mode::new(&name, width, height, 60)])
        .with_plane(2, 0b1);
    let selection = format!("1:{name}").parse().expect("mode selection");
    Display::open(scanout, &[selection]).expect("open display")
}

fn pool(
    display: &mut Display<HeadlessScanout>,
    count: usize,
    format: PixelFormat,
    width: u32,
    height: u32,
) -> BufferPool {
    BufferPool::allocate(
        &HostAllocator::new(),
        display.backend_mut(),
        count,
        format,
        width,
        height,
        TilingMode::Linear,
    )
    .expect("allocate pool")
}

// =============================================================================
// Pool and bridge bookkeeping
// =============================================================================

fn bench_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool");

    let mut display = display(640, 480);
    let mut buffers = pool(&mut display, 8, PixelFormat::Xrgb8888, 64, 64);
    group.bench_function("acquire_release", |b| {
        b.iter(|| {
            let id = buffers.acquire_unlocked().expect("free buffer");
            buffers.release(black_box(id)).expect("release");
        });
    });

    let mut capture = pool(&mut display, 8, PixelFormat::Yuyv, 64, 64);
    let mut bridge = CaptureBridge::new(LoopbackProducer::new(64 * 64 * 2));
    bridge.bind(&capture).expect("bind");
    group.bench_function("enqueue_dequeue", |b| {
        b.iter(|| {
            let id = capture.acquire_unlocked().expect("free buffer");
            bridge
                .enqueue(capture.get(id).expect("buffer"))
                .expect("enqueue");
            let filled = bridge.dequeue().expect("dequeue");
            capture.release(black_box(filled.buffer)).expect("release");
        });
    });

    group.finish();
}

// =============================================================================
// Rate governor filter
// =============================================================================

fn bench_governor(c: &mut Criterion) {
    let mut governor = RateGovernor::new(30);
    let mut i = 0u64;
    c.bench_function("governor/next_sleep", |b| {
        b.iter(|| {
            i += 1;
            let elapsed = Duration::from_micros(if i % 2 == 0 { 10_000 } else { 50_000 });
            black_box(governor.next_sleep(elapsed))
        });
    });
}

// =============================================================================
// Presentation and pattern fill
// =============================================================================

fn bench_present(c: &mut Criterion) {
    let mut group = c.benchmark_group("present");
    group.sample_size(20);

    for &(width, height) in RESOLUTIONS {
        let id = format!("{width}x{height}");
        let (w, h) = (u32::from(width), u32::from(height));

        let mut primary_display = display(width, height);
        let primary = pool(&mut primary_display, 2, PixelFormat::Xrgb8888, w, h);
        let ids: Vec<BufferId> = primary.ids().collect();
        let mut next = 0;
        group.bench_with_input(BenchmarkId::new("primary", &id), &ids, |b, ids| {
            b.iter(|| {
                next = (next + 1) % ids.len();
                primary_display
                    .present_primary(primary.get(ids[next]).expect("buffer"))
                    .expect("present");
            });
        });

        let mut overlay_display = display(width, height);
        let overlay = pool(&mut overlay_display, 1, PixelFormat::Nv12, w, h);
        let buffer = overlay.buffers().next().expect("buffer");
        group.bench_with_input(BenchmarkId::new("overlay", &id), &(w, h), |b, &(w, h)| {
            b.iter(|| {
                overlay_display
                    .present_overlay(buffer, 0, 0, w, h)
                    .expect("present overlay");
            });
        });
    }

    group.finish();
}

fn bench_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("fill");
    group.sample_size(10);

    for format in [PixelFormat::Xrgb8888, PixelFormat::Yuyv, PixelFormat::Nv12] {
        let (width, height) = (1280u32, 720u32);
        let mut display = display(1280, 720);
        let mut buffers = pool(&mut display, 1, format, width, height);
        let id = buffers.ids().next().expect("buffer");
        let bytes: usize = buffers
            .get(id)
            .expect("buffer")
            .planes()
            .iter()
            .map(|p| p.size())
            .sum();

        group.throughput(Throughput::Bytes(bytes as u64));
        let mut frame = 0;
        group.bench_function(BenchmarkId::new(format.to_string(), "1280x720"), |b| {
            b.iter(|| {
                frame += 2;
                pattern::fill(buffers.get_mut(id).expect("buffer"), frame).expect("fill");
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pool, bench_governor, bench_present, bench_fill);
criterion_main!(benches);
