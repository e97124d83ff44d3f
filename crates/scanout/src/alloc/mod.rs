// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Device memory allocation.
//!
//! An [`Allocator`] hands out single memory planes that are CPU-mapped and
//! exportable as a shareable descriptor (a dma-buf or memfd). CPU access is
//! bracketed with [`Allocation::begin_cpu_access`] /
//! [`Allocation::end_cpu_access`] so cached mappings stay coherent with the
//! display controller and capture hardware.

mod dumb;
mod heap;
mod host;

pub use dumb::DumbAllocator;
pub use heap::DmaHeapAllocator;
pub use host::HostAllocator;

use std::fmt;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr::{self, NonNull};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::sys::dma_buf;

/// Pitch alignment for tiled containers.
pub const TILED_PITCH_ALIGN: u32 = 4096;

/// Tiling hint for scanout buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TilingMode {
    #[default]
    Linear,
    Tiled8,
    Tiled16,
    Tiled32,
    /// Pick the tile element size from each plane's bits per pixel.
    Auto,
}

impl TilingMode {
    /// Tile element size in bits for a plane of `bpp`, or `None` for linear.
    pub fn element_bits(&self, bpp: u32) -> Option<u32> {
        match self {
            TilingMode::Linear => None,
            TilingMode::Tiled8 => Some(8),
            TilingMode::Tiled16 => Some(16),
            TilingMode::Tiled32 => Some(32),
            TilingMode::Auto => match bpp {
                8 | 16 | 32 => Some(bpp),
                _ => None,
            },
        }
    }
}

impl FromStr for TilingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "8" => Ok(TilingMode::Tiled8),
            "16" => Ok(TilingMode::Tiled16),
            "32" => Ok(TilingMode::Tiled32),
            "auto" => Ok(TilingMode::Auto),
            "linear" => Ok(TilingMode::Linear),
            _ => Err(Error::InvalidArgument(format!(
                "invalid tiling mode '{s}', expected 8, 16, 32 or auto"
            ))),
        }
    }
}

impl fmt::Display for TilingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TilingMode::Linear => f.write_str("linear"),
            TilingMode::Tiled8 => f.write_str("8"),
            TilingMode::Tiled16 => f.write_str("16"),
            TilingMode::Tiled32 => f.write_str("32"),
            TilingMode::Auto => f.write_str("auto"),
        }
    }
}

/// Geometry of a single memory plane to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneRequest {
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    pub tiling: TilingMode,
}

impl PlaneRequest {
    pub fn is_tiled(&self) -> bool {
        self.tiling.element_bits(self.bpp).is_some()
    }

    /// Bytes per row, aligned for tiled layouts.
    pub fn pitch(&self) -> u32 {
        let pitch = self.width * self.bpp / 8;
        if self.is_tiled() {
            pitch.next_multiple_of(TILED_PITCH_ALIGN)
        } else {
            pitch
        }
    }

    pub fn size(&self) -> usize {
        self.pitch() as usize * self.height as usize
    }
}

/// Direction of a CPU access window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuAccess {
    Read,
    Write,
    ReadWrite,
}

impl CpuAccess {
    fn sync_flags(self) -> u64 {
        match self {
            CpuAccess::Read => dma_buf::DMA_BUF_SYNC_READ,
            CpuAccess::Write => dma_buf::DMA_BUF_SYNC_WRITE,
            CpuAccess::ReadWrite => dma_buf::DMA_BUF_SYNC_RW,
        }
    }
}

/// One mapped, shareable memory plane.
pub trait Allocation {
    /// Shareable descriptor for zero-copy import by other devices.
    fn descriptor(&self) -> BorrowedFd<'_>;

    fn pitch(&self) -> u32;

    fn size(&self) -> usize;

    fn as_slice(&self) -> &[u8];

    fn as_mut_slice(&mut self) -> &mut [u8];

    /// Start a CPU access window; pending device writes become visible.
    fn begin_cpu_access(&self, access: CpuAccess) -> Result<()>;

    /// End a CPU access window; CPU writes are flushed for device reads.
    fn end_cpu_access(&self, access: CpuAccess) -> Result<()>;
}

pub trait Allocator {
    fn allocate(&self, request: &PlaneRequest) -> Result<Box<dyn Allocation>>;

    /// Short name used in log messages.
    fn name(&self) -> &'static str;
}

/// A shared CPU mapping of a descriptor, unmapped on drop.
pub(crate) struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping {
    pub(crate) fn new(fd: BorrowedFd<'_>, len: usize, offset: libc::off_t) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidArgument("cannot map an empty allocation".into()));
        }

        // SAFETY: fd is a valid descriptor for at least `offset + len` bytes;
        // the kernel validates the range and reports failure via MAP_FAILED.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Io {
                context: format!("mmap of {len} bytes"),
                source: std::io::Error::last_os_error(),
            });
        }

        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| Error::InvalidState("mmap returned a null mapping".into()))?;
        Ok(Self { ptr, len })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is valid for `len` bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// Issue `DMA_BUF_IOCTL_SYNC` on a dma-buf descriptor.
pub(crate) fn dma_buf_sync(fd: BorrowedFd<'_>, access: CpuAccess, end: bool) -> Result<()> {
    let phase = if end {
        dma_buf::DMA_BUF_SYNC_END
    } else {
        dma_buf::DMA_BUF_SYNC_START
    };
    let sync = dma_buf::dma_buf_sync {
        flags: access.sync_flags() | phase,
    };
    loop {
        // SAFETY: `sync` outlives the call and matches the ioctl's layout.
        match unsafe { dma_buf::dma_buf_ioctl_sync(fd.as_raw_fd(), &sync) } {
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EINTR) | Err(nix::errno::Errno::EAGAIN) => continue,
            Err(e) => return Err(Error::os("dma-buf", "DMA_BUF_IOCTL_SYNC")(e)),
        }
    }
}
