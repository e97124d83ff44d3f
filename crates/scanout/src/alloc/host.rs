// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::atomic::{fence, Ordering};

use super::{Allocation, Allocator, CpuAccess, Mapping, PlaneRequest};
use crate::error::{Error, Result};

/// Allocates planes from anonymous shared memory (memfd).
///
/// The descriptor can be passed to other processes like a dma-buf, but no
/// device can scan it out. Used by the headless backend and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostAllocator;

impl HostAllocator {
    pub fn new() -> Self {
        Self
    }
}

impl Allocator for HostAllocator {
    fn allocate(&self, request: &PlaneRequest) -> Result<Box<dyn Allocation>> {
        let size = request.size();
        let name = b"scanout-plane\0";
        // SAFETY: `name` is NUL terminated and outlives the call.
        let raw = unsafe {
            libc::memfd_create(name.as_ptr() as *const libc::c_char, libc::MFD_CLOEXEC)
        };
        if raw < 0 {
            return Err(Error::Io {
                context: "memfd_create".into(),
                source: std::io::Error::last_os_error(),
            });
        }
        // SAFETY: memfd_create returned a fresh descriptor we now own.
        let file = File::from(unsafe { OwnedFd::from_raw_fd(raw) });
        file.set_len(size as u64)
            .map_err(Error::io(format!("resize memfd to {size} bytes")))?;
        let fd = OwnedFd::from(file);
        let mapping = Mapping::new(fd.as_fd(), size, 0)?;

        Ok(Box::new(HostAllocation {
            mapping,
            fd,
            pitch: request.pitch(),
        }))
    }

    fn name(&self) -> &'static str {
        "host"
    }
}

struct HostAllocation {
    mapping: Mapping,
    fd: OwnedFd,
    pitch: u32,
}

impl Allocation for HostAllocation {
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

    // Host memory is coherent; a full fence still orders CPU writes against
    // whoever reads the shared mapping next.
    fn begin_cpu_access(&self, _access: CpuAccess) -> Result<()> {
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn end_cpu_access(&self, _access: CpuAccess) -> Result<()> {
        fence(Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::TilingMode;

    #[test]
    fn test_host_allocation_is_mapped_and_shareable() {
        let alloc = HostAllocator::new();
        let mut plane = alloc
            .allocate(&PlaneRequest {
                width: 64,
                height: 8,
                bpp: 32,
                tiling: TilingMode::Linear,
            })
            .unwrap();

        assert_eq!(plane.pitch(), 256);
        assert_eq!(plane.size(), 256 * 8);
        assert!(plane.descriptor().as_fd().try_clone_to_owned().is_ok());

        plane.begin_cpu_access(CpuAccess::Write).unwrap();
        plane.as_mut_slice().fill(0xa5);
        plane.end_cpu_access(CpuAccess::Write).unwrap();
        assert!(plane.as_slice().iter().all(|&b| b == 0xa5));
    }

    #[test]
    fn test_descriptors_are_distinct() {
        use std::os::fd::AsRawFd;

        let alloc = HostAllocator::new();
        let req = PlaneRequest {
            width: 16,
            height: 16,
            bpp: 8,
            tiling: TilingMode::Linear,
        };
        let a = alloc.allocate(&req).unwrap();
        let b = alloc.allocate(&req).unwrap();
        assert_ne!(a.descriptor().as_raw_fd(), b.descriptor().as_raw_fd());
    }
}
