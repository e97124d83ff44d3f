// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Raw kernel ABI structures and ioctl wrappers.

pub(crate) mod dma_buf;
pub(crate) mod drm;
pub(crate) mod v4l2;
