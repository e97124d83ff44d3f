// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use log::warn;

use crate::alloc::{Allocation, CpuAccess};
use crate::display::FramebufferId;
use crate::error::Result;
use crate::format::PixelFormat;

/// Index of a buffer inside its [`BufferPool`](crate::pool::BufferPool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) usize);

impl BufferId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which stage currently owns a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// In the pool's unlocked set, ready for reuse.
    Free,
    /// Handed out by the pool: being filled by the CPU or queued to a
    /// producer.
    InFlight,
    /// Being scanned out by the display.
    Presenting,
}

/// One memory plane of a buffer.
pub struct Plane {
    memory: Box<dyn Allocation>,
    pitch: u32,
    offset: u32,
}

impl Plane {
    pub(crate) fn new(memory: Box<dyn Allocation>) -> Self {
        let pitch = memory.pitch();
        Self {
            memory,
            pitch,
            offset: 0,
        }
    }

    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.memory.size()
    }

    pub fn descriptor(&self) -> BorrowedFd<'_> {
        self.memory.descriptor()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.memory.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.memory.as_mut_slice()
    }

    pub(crate) fn memory(&self) -> &dyn Allocation {
        self.memory.as_ref()
    }
}

impl fmt::Debug for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plane")
            .field("fd", &self.memory.descriptor().as_raw_fd())
            .field("pitch", &self.pitch)
            .field("size", &self.memory.size())
            .finish()
    }
}

/// A presentable, produceable image: fixed format and geometry, 1-4 memory
/// planes and the framebuffer it was registered as.
#[derive(Debug)]
pub struct Buffer {
    id: BufferId,
    format: PixelFormat,
    width: u32,
    height: u32,
    planes: Vec<Plane>,
    framebuffer: FramebufferId,
}

impl Buffer {
    pub(crate) fn new(
        id: BufferId,
        format: PixelFormat,
        width: u32,
        height: u32,
        planes: Vec<Plane>,
        framebuffer: FramebufferId,
    ) -> Self {
        Self {
            id,
            format,
            width,
            height,
            planes,
            framebuffer,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn planes_mut(&mut self) -> &mut [Plane] {
        &mut self.planes
    }

    pub fn framebuffer(&self) -> FramebufferId {
        self.framebuffer
    }

    /// Descriptor of the first plane, the identity a producer sees.
    pub fn descriptor(&self) -> RawFd {
        self.planes[0].descriptor().as_raw_fd()
    }

    /// Run `f` over the mapped planes inside a CPU write window.
    ///
    /// If a plane cannot enter the window, the planes already in it are
    /// closed again before the error is returned.
    pub fn write_with<F: FnOnce(&mut [Plane])>(&mut self, f: F) -> Result<()> {
        for (begun, plane) in self.planes.iter().enumerate() {
            if let Err(e) = plane.memory.begin_cpu_access(CpuAccess::Write) {
                for open in &self.planes[..begun] {
                    if let Err(end) = open.memory.end_cpu_access(CpuAccess::Write) {
                        warn!("{}: could not end CPU access: {end}", self.id);
                    }
                }
                return Err(e);
            }
        }
        f(&mut self.planes);
        for plane in &self.planes {
            plane.memory.end_cpu_access(CpuAccess::Write)?;
        }
        Ok(())
    }

    /// Ownership-transition barrier: wait for pending device access and flush
    /// CPU caches so the next consumer observes a consistent image.
    pub(crate) fn fence(&self) -> Result<()> {
        for plane in &self.planes {
            plane.memory().begin_cpu_access(CpuAccess::ReadWrite)?;
            plane.memory().end_cpu_access(CpuAccess::ReadWrite)?;
        }
        Ok(())
    }
}
