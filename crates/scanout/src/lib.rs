// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! # EdgeFirst Scanout
//!
//! Zero-copy buffer lifecycle and display pipeline for embedded video
//! scanout on Linux.
//!
//! The crate coordinates memory shared between independently owned
//! subsystems: a display controller scanning buffers out, and a camera or
//! decoder filling them. Buffers cross those boundaries by dma-buf
//! descriptor, never by copy.
//!
//! - [`BufferPool`] owns a fixed set of format-aware, multi-plane buffers
//!   and tracks which stage holds each one.
//! - [`Display`] drives one or more outputs side by side, presenting on the
//!   primary plane with page flips or on an overlay plane with scaling.
//! - [`CaptureBridge`] hands pool buffers to a [`Producer`] by descriptor
//!   and maps its completions back to buffer identities.
//! - [`RateGovernor`] paces presentation to a target frame rate.
//! - [`FlipLoop`] and [`CapturePipeline`] combine them into steady-state
//!   loops.
//!
//! ## Example
//!
//! ```no_run
//! use scanout::{Backend, Display, DmaHeapAllocator, FlipLoop, PipelineConfig};
//!
//! # fn main() -> scanout::Result<()> {
//! let backend = Backend::open_first()?;
//! let display = Display::open(backend, &["32:1920x1080".parse()?])?;
//! let mut flip = FlipLoop::new(display, &DmaHeapAllocator::new()?, &PipelineConfig::default())?;
//! flip.run(500)?;
//! flip.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform
//!
//! Linux only: DRM/KMS, dma-heap and V4L2 are reached through raw ioctls.
//! [`HeadlessScanout`] and [`LoopbackProducer`] run the same pipeline
//! without hardware.

#![cfg(target_os = "linux")]

pub mod alloc;
pub mod buffer;
pub mod config;
pub mod device;
pub mod display;
mod error;
pub mod format;
pub mod governor;
pub mod pattern;
pub mod pipeline;
pub mod pool;
pub mod producer;
mod sys;

pub use alloc::{
    Allocation, Allocator, CpuAccess, DmaHeapAllocator, DumbAllocator, HostAllocator, TilingMode,
};
pub use buffer::{Buffer, BufferId, BufferState, Plane};
pub use config::{CaptureSpec, ModeSelection, PipelineConfig};
pub use device::DrmDevice;
pub use display::{
    Backend, BackendKind, Display, HeadlessScanout, KmsScanout, Mode, Output, Scanout,
};
pub use error::{Error, OutputFailure, Result};
pub use format::PixelFormat;
pub use governor::{Mark, RateGovernor};
pub use pipeline::{CapturePipeline, FlipLoop};
pub use pool::{BufferPool, PoolCounts};
pub use producer::{
    CaptureBridge, Completion, Filled, LoopbackProducer, MemoryMode, Producer, V4l2Capture,
};
