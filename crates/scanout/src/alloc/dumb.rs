// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use log::{debug, warn};
use nix::errno::Errno;

use super::{dma_buf_sync, Allocation, Allocator, CpuAccess, Mapping, PlaneRequest};
use crate::device::DrmDevice;
use crate::error::{Error, Result};
use crate::sys::drm;

/// Allocates linear "dumb" scanout buffers on a DRM device and exports them
/// as dma-bufs.
///
/// Dumb buffers are always linear, so tiling hints are ignored and the
/// kernel chooses the pitch.
pub struct DumbAllocator {
    device: Arc<DrmDevice>,
}

impl DumbAllocator {
    pub fn new(device: Arc<DrmDevice>) -> Self {
        Self { device }
    }
}

impl Allocator for DumbAllocator {
    fn allocate(&self, request: &PlaneRequest) -> Result<Box<dyn Allocation>> {
        if request.is_tiled() {
            debug!("dumb buffers are linear, ignoring tiling hint {}", request.tiling);
        }

        let mut create = drm::drm_mode_create_dumb {
            height: request.height,
            width: request.width,
            bpp: request.bpp,
            ..Default::default()
        };
        // SAFETY: `create` matches struct drm_mode_create_dumb.
        unsafe { drm::drm_mode_create_dumb_ioctl(self.device.as_fd().as_raw_fd(), &mut create) }
            .map_err(Error::os("drm", "DRM_IOCTL_MODE_CREATE_DUMB"))?;

        // From here on the handle must be destroyed on every error path.
        let handle = DumbHandle {
            device: self.device.clone(),
            handle: create.handle,
        };

        let mut map = drm::drm_mode_map_dumb {
            handle: create.handle,
            ..Default::default()
        };
        // SAFETY: `map` matches struct drm_mode_map_dumb.
        unsafe { drm::drm_mode_map_dumb_ioctl(self.device.as_fd().as_raw_fd(), &mut map) }
            .map_err(Error::os("drm", "DRM_IOCTL_MODE_MAP_DUMB"))?;

        let size = create.size as usize;
        let offset = libc::off_t::try_from(map.offset)
            .map_err(|_| Error::InvalidState(format!("dumb map offset {} overflows", map.offset)))?;
        let mapping = Mapping::new(self.device.as_fd(), size, offset)?;
        let fd = self.device.prime_handle_to_fd(create.handle)?;

        debug!(
            "dumb buffer {}: {}x{}@{}bpp pitch={} size={}",
            create.handle, request.width, request.height, request.bpp, create.pitch, size
        );

        Ok(Box::new(DumbAllocation {
            mapping,
            fd,
            pitch: create.pitch,
            _handle: handle,
        }))
    }

    fn name(&self) -> &'static str {
        "dumb"
    }
}

struct DumbHandle {
    device: Arc<DrmDevice>,
    handle: u32,
}

impl Drop for DumbHandle {
    fn drop(&mut self) {
        let mut destroy = drm::drm_mode_destroy_dumb {
            handle: self.handle,
        };
        // SAFETY: `destroy` matches struct drm_mode_destroy_dumb.
        let ret = unsafe {
            drm::drm_mode_destroy_dumb_ioctl(self.device.as_fd().as_raw_fd(), &mut destroy)
        };
        match ret {
            Ok(_) => {}
            // The scanout closes imported GEM handles with its framebuffers,
            // which already released a dumb handle on the same device.
            Err(Errno::ENOENT | Errno::EINVAL) => {
                debug!("dumb buffer {} already released", self.handle)
            }
            Err(e) => warn!("failed to destroy dumb buffer {}: {e}", self.handle),
        }
    }
}

struct DumbAllocation {
    mapping: Mapping,
    fd: OwnedFd,
    pitch: u32,
    _handle: DumbHandle,
}

impl Allocation for DumbAllocation {
    fn descriptor(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    fn pitch(&self) -> u32 {
        self.pitch
    }

    fn size(&self) -> usize {
        self.mapping.len()
    }

    fn as_slice(&self) -> &[u8] {
        self.mapping.as_slice()
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        self.mapping.as_mut_slice()
    }

    fn begin_cpu_access(&self, access: CpuAccess) -> Result<()> {
        dma_buf_sync(self.fd.as_fd(), access, false)
    }

    fn end_cpu_access(&self, access: CpuAccess) -> Result<()> {
        dma_buf_sync(self.fd.as_fd(), access, true)
    }
}
