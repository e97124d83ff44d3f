// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! dma-buf CPU access synchronization (include/uapi/linux/dma-buf.h).

#![allow(non_camel_case_types)]

use nix::ioctl_write_ptr;

const DMA_BUF_BASE: u8 = b'b';

pub const DMA_BUF_SYNC_READ: u64 = 1 << 0;
pub const DMA_BUF_SYNC_WRITE: u64 = 1 << 1;
pub const DMA_BUF_SYNC_RW: u64 = DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE;
pub const DMA_BUF_SYNC_START: u64 = 0 << 2;
pub const DMA_BUF_SYNC_END: u64 = 1 << 2;

#[repr(C)]
#[derive(Debug, Default)]
pub struct dma_buf_sync {
    pub flags: u64,
}

ioctl_write_ptr!(dma_buf_ioctl_sync, DMA_BUF_BASE, 0, dma_buf_sync);
