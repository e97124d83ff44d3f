// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Subset of the V4L2 kernel ABI (include/uapi/linux/videodev2.h) needed for
//! single-plane DMABUF capture.

#![allow(non_camel_case_types)]

use nix::{ioctl_readwrite, ioctl_write_ptr};

const V4L2_IOCTL_BASE: u8 = b'V';

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_MEMORY_DMABUF: u32 = 4;
pub const V4L2_FIELD_NONE: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_pix_format {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_format_fmt {
    pub pix: v4l2_pix_format,
    pub raw_data: [u8; 200],
    // v4l2_window carries pointers, which sets the union alignment.
    _align: *mut libc::c_void,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_format {
    pub type_: u32,
    pub fmt: v4l2_format_fmt,
}

impl v4l2_format {
    pub fn new(type_: u32) -> Self {
        Self {
            type_,
            fmt: v4l2_format_fmt { raw_data: [0; 200] },
        }
    }
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct v4l2_requestbuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_buffer_m {
    pub offset: u32,
    pub userptr: libc::c_ulong,
    pub planes: *mut libc::c_void,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: v4l2_timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: v4l2_buffer_m,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

impl v4l2_buffer {
    pub fn new(type_: u32, memory: u32) -> Self {
        Self {
            index: 0,
            type_,
            bytesused: 0,
            flags: 0,
            field: 0,
            timestamp: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            timecode: v4l2_timecode::default(),
            sequence: 0,
            memory,
            m: v4l2_buffer_m { userptr: 0 },
            length: 0,
            reserved2: 0,
            request_fd: 0,
        }
    }

    pub fn fd(&self) -> i32 {
        // SAFETY: every variant is plain data and the union is zero-initialized
        // through its widest integer member.
        unsafe { self.m.fd }
    }
}

ioctl_readwrite!(vidioc_g_fmt, V4L2_IOCTL_BASE, 4, v4l2_format);
ioctl_readwrite!(vidioc_s_fmt, V4L2_IOCTL_BASE, 5, v4l2_format);
ioctl_readwrite!(vidioc_reqbufs, V4L2_IOCTL_BASE, 8, v4l2_requestbuffers);
ioctl_readwrite!(vidioc_querybuf, V4L2_IOCTL_BASE, 9, v4l2_buffer);
ioctl_readwrite!(vidioc_qbuf, V4L2_IOCTL_BASE, 15, v4l2_buffer);
ioctl_readwrite!(vidioc_dqbuf, V4L2_IOCTL_BASE, 17, v4l2_buffer);
ioctl_write_ptr!(vidioc_streamon, V4L2_IOCTL_BASE, 18, libc::c_int);
ioctl_write_ptr!(vidioc_streamoff, V4L2_IOCTL_BASE, 19, libc::c_int);

#[cfg(all(test, target_pointer_width = "64"))]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_abi_sizes() {
        assert_eq!(size_of::<v4l2_pix_format>(), 48);
        assert_eq!(size_of::<v4l2_format>(), 208);
        assert_eq!(size_of::<v4l2_requestbuffers>(), 20);
        assert_eq!(size_of::<v4l2_buffer>(), 88);
    }
}
