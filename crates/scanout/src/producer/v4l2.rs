// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::{debug, info};
use nix::errno::Errno;

use super::{Completion, MemoryMode, Producer};
use crate::config::CaptureSpec;
use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::sys::v4l2;

/// Retries of an ioctl interrupted by a signal before giving up.
const MAX_EINTR_RETRIES: u32 = 8;

/// Single-plane V4L2 capture importing dma-buf buffers.
pub struct V4l2Capture {
    fd: OwnedFd,
    path: PathBuf,
    spec: CaptureSpec,
    // Bytes the driver needs in each slot, from VIDIOC_QUERYBUF.
    lengths: Vec<u32>,
}

impl V4l2Capture {
    /// Open `path` and configure it for `spec`.
    ///
    /// Fails with [`Error::UnsupportedFormat`] if the driver adjusts the
    /// requested geometry or format.
    pub fn open(path: impl AsRef<Path>, spec: CaptureSpec) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(Error::io(format!("open {}", path.display())))?;
        let capture = Self {
            fd: file.into(),
            path: path.to_path_buf(),
            spec,
            lengths: Vec::new(),
        };
        capture.set_format()?;
        info!("{}: capturing {spec}", path.display());
        Ok(capture)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn spec(&self) -> CaptureSpec {
        self.spec
    }

    fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn set_format(&self) -> Result<()> {
        let mut format = v4l2::v4l2_format::new(v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE);
        // SAFETY: G_FMT fills the union for the capture type.
        unsafe { v4l2::vidioc_g_fmt(self.raw(), &mut format) }
            .map_err(Error::os("v4l2", "VIDIOC_G_FMT"))?;

        // SAFETY: `pix` is the active member for VIDEO_CAPTURE.
        let pix = unsafe { &mut format.fmt.pix };
        pix.width = self.spec.width;
        pix.height = self.spec.height;
        pix.pixelformat = self.spec.format.device_fourcc();
        pix.field = v4l2::V4L2_FIELD_NONE;

        // SAFETY: as above.
        unsafe { v4l2::vidioc_s_fmt(self.raw(), &mut format) }
            .map_err(Error::os("v4l2", "VIDIOC_S_FMT"))?;

        // SAFETY: S_FMT writes back the negotiated format.
        let pix = unsafe { format.fmt.pix };
        if pix.width != self.spec.width
            || pix.height != self.spec.height
            || pix.pixelformat != self.spec.format.device_fourcc()
        {
            let got = PixelFormat::ALL
                .into_iter()
                .find(|f| f.device_fourcc() == pix.pixelformat)
                .map(|f| f.to_string())
                .unwrap_or_else(|| format!("0x{:08x}", pix.pixelformat));
            return Err(Error::UnsupportedFormat(format!(
                "{} adjusted {} to {}x{}@{got}",
                self.path.display(),
                self.spec,
                pix.width,
                pix.height
            )));
        }
        debug!(
            "{}: bytesperline={} sizeimage={}",
            self.path.display(),
            pix.bytesperline,
            pix.sizeimage
        );
        Ok(())
    }
}

/// Size of the memory behind a dma-buf or memfd descriptor.
fn dmabuf_size(fd: RawFd) -> Result<u64> {
    // SAFETY: seeking a caller-owned descriptor touches no process memory;
    // dma-bufs are accessed through mappings, not the file offset.
    let end = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
    let end = Errno::result(end).map_err(Error::os("v4l2", "lseek dmabuf"))?;
    Ok(end as u64)
}

fn check_slot_size(index: usize, required: u32, actual: u64) -> Result<()> {
    if actual < u64::from(required) {
        return Err(Error::InvalidArgument(format!(
            "dmabuf for slot {index} holds {actual} bytes, driver needs {required}"
        )));
    }
    Ok(())
}

fn retry_eintr<F>(mut f: F) -> nix::Result<()>
where
    F: FnMut() -> nix::Result<libc::c_int>,
{
    let mut retries = 0;
    loop {
        match f() {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) if retries < MAX_EINTR_RETRIES => retries += 1,
            Err(e) => return Err(e),
        }
    }
}

impl Producer for V4l2Capture {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn memory_mode(&self) -> MemoryMode {
        MemoryMode::DmaBuf
    }

    fn max_planes(&self) -> usize {
        1
    }

    fn request_buffers(&mut self, count: usize) -> Result<usize> {
        let mut req = v4l2::v4l2_requestbuffers {
            count: u32::try_from(count)
                .map_err(|_| Error::InvalidArgument(format!("{count} buffers")))?,
            type_: v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: v4l2::V4L2_MEMORY_DMABUF,
            ..Default::default()
        };
        // SAFETY: `req` matches struct v4l2_requestbuffers.
        unsafe { v4l2::vidioc_reqbufs(self.raw(), &mut req) }
            .map_err(Error::os("v4l2", "VIDIOC_REQBUFS"))?;

        self.lengths = (0..req.count)
            .map(|index| -> Result<u32> {
                let mut buf = v4l2::v4l2_buffer::new(
                    v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE,
                    v4l2::V4L2_MEMORY_DMABUF,
                );
                buf.index = index;
                // SAFETY: `buf` matches struct v4l2_buffer.
                unsafe { v4l2::vidioc_querybuf(self.raw(), &mut buf) }
                    .map_err(Error::os("v4l2", "VIDIOC_QUERYBUF"))?;
                Ok(buf.length)
            })
            .collect::<Result<Vec<u32>>>()?;
        debug!(
            "{}: {} dmabuf slots of {:?} bytes",
            self.path.display(),
            self.lengths.len(),
            self.lengths
        );
        Ok(self.lengths.len())
    }

    fn queue(&mut self, index: usize, descriptor: RawFd) -> Result<()> {
        let Some(&required) = self.lengths.get(index) else {
            return Err(Error::InvalidArgument(format!(
                "index {index} beyond {} requested buffers",
                self.lengths.len()
            )));
        };
        check_slot_size(index, required, dmabuf_size(descriptor)?)?;

        let mut buf =
            v4l2::v4l2_buffer::new(v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE, v4l2::V4L2_MEMORY_DMABUF);
        buf.index = index as u32;
        buf.length = required;
        buf.m = v4l2::v4l2_buffer_m { fd: descriptor };
        // SAFETY: `buf` matches struct v4l2_buffer.
        retry_eintr(|| unsafe { v4l2::vidioc_qbuf(self.raw(), &mut buf) })
            .map_err(Error::os("v4l2", "VIDIOC_QBUF"))
    }

    fn dequeue(&mut self) -> Result<Completion> {
        let mut buf =
            v4l2::v4l2_buffer::new(v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE, v4l2::V4L2_MEMORY_DMABUF);
        // SAFETY: `buf` matches struct v4l2_buffer.
        retry_eintr(|| unsafe { v4l2::vidioc_dqbuf(self.raw(), &mut buf) })
            .map_err(Error::os("v4l2", "VIDIOC_DQBUF"))?;
        Ok(Completion {
            index: buf.index as usize,
            descriptor: buf.fd(),
            bytes_used: buf.bytesused,
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        let type_ = v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        // SAFETY: STREAMON reads the buffer type.
        unsafe { v4l2::vidioc_streamon(self.raw(), &type_) }
            .map_err(Error::os("v4l2", "VIDIOC_STREAMON"))?;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        let type_ = v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        // SAFETY: STREAMOFF reads the buffer type.
        unsafe { v4l2::vidioc_streamoff(self.raw(), &type_) }
            .map_err(Error::os("v4l2", "VIDIOC_STREAMOFF"))?;
        Ok(())
    }
}
