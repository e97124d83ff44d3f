// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use std::fs::OpenOptions;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};
use crate::sys::drm;

/// An open DRM device node.
///
/// Scanout and dumb-buffer allocation share one device through an
/// `Arc<DrmDevice>` so GEM handles created by one are valid for the other.
#[derive(Debug)]
pub struct DrmDevice {
    fd: OwnedFd,
    path: PathBuf,
}

impl DrmDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(Error::io(format!("open {}", path.display())))?;
        debug!("opened DRM device {}", path.display());
        Ok(Self {
            fd: file.into(),
            path: path.to_path_buf(),
        })
    }

    /// Open the first primary node under `/dev/dri` that answers
    /// `DRM_IOCTL_MODE_GETRESOURCES`, i.e. one that can drive a display.
    pub fn open_first_card() -> Result<Self> {
        let mut last_err = None;
        for n in 0..8 {
            let path = format!("/dev/dri/card{n}");
            if !Path::new(&path).exists() {
                continue;
            }
            match Self::open(&path) {
                Ok(dev) if dev.has_mode_resources() => return Ok(dev),
                Ok(_) => debug!("{path} has no mode-setting resources"),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::Unsupported("no KMS capable DRM device found".into())))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn has_mode_resources(&self) -> bool {
        let mut res = drm::drm_mode_card_res::default();
        // SAFETY: counts-only query, all array pointers are null.
        unsafe { drm::drm_mode_getresources(self.fd.as_raw_fd(), &mut res) }.is_ok()
            && res.count_crtcs > 0
    }

    /// Import a dma-buf descriptor as a GEM handle on this device.
    pub fn prime_fd_to_handle(&self, fd: BorrowedFd<'_>) -> Result<u32> {
        let mut prime = drm::drm_prime_handle {
            handle: 0,
            flags: 0,
            fd: fd.as_raw_fd(),
        };
        // SAFETY: `prime` matches struct drm_prime_handle and outlives the call.
        unsafe { drm::drm_prime_fd_to_handle(self.fd.as_raw_fd(), &mut prime) }
            .map_err(Error::os("drm", "DRM_IOCTL_PRIME_FD_TO_HANDLE"))?;
        Ok(prime.handle)
    }

    /// Export a GEM handle as a dma-buf descriptor.
    pub fn prime_handle_to_fd(&self, handle: u32) -> Result<OwnedFd> {
        let mut prime = drm::drm_prime_handle {
            handle,
            flags: drm::DRM_CLOEXEC | drm::DRM_RDWR,
            fd: -1,
        };
        // SAFETY: as above.
        unsafe { drm::drm_prime_handle_to_fd(self.fd.as_raw_fd(), &mut prime) }
            .map_err(Error::os("drm", "DRM_IOCTL_PRIME_HANDLE_TO_FD"))?;
        // SAFETY: on success the kernel installed a fresh descriptor we now own.
        Ok(unsafe { OwnedFd::from_raw_fd(prime.fd) })
    }

    pub fn gem_close(&self, handle: u32) -> Result<()> {
        let close = drm::drm_gem_close { handle, pad: 0 };
        // SAFETY: `close` matches struct drm_gem_close.
        unsafe { drm::drm_gem_close_ioctl(self.fd.as_raw_fd(), &close) }
            .map_err(Error::os("drm", "DRM_IOCTL_GEM_CLOSE"))?;
        Ok(())
    }
}

impl AsFd for DrmDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
