// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use dma_heap::{Heap, HeapKind};
use log::debug;

use super::{dma_buf_sync, Allocation, Allocator, CpuAccess, Mapping, PlaneRequest};
use crate::error::{Error, Result};

/// Allocates planes from a Linux DMA heap.
pub struct DmaHeapAllocator {
    heap: Heap,
    name: &'static str,
}

impl DmaHeapAllocator {
    /// Contiguous CMA heap, falling back to the system heap when no CMA
    /// region is configured.
    pub fn new() -> Result<Self> {
        match Heap::new(HeapKind::Cma) {
            Ok(heap) => Ok(Self { heap, name: "cma" }),
            Err(cma_err) => {
                debug!("CMA heap unavailable ({cma_err}), trying system heap");
                let heap = Heap::new(HeapKind::System).map_err(|e| Error::Io {
                    context: "open DMA heap".into(),
                    source: std::io::Error::other(e.to_string()),
                })?;
                Ok(Self {
                    heap,
                    name: "system",
                })
            }
        }
    }

    pub fn with_kind(kind: HeapKind, name: &'static str) -> Result<Self> {
        let heap = Heap::new(kind).map_err(|e| Error::Io {
            context: format!("open {name} DMA heap"),
            source: std::io::Error::other(e.to_string()),
        })?;
        Ok(Self { heap, name })
    }
}

impl Allocator for DmaHeapAllocator {
    fn allocate(&self, request: &PlaneRequest) -> Result<Box<dyn Allocation>> {
        let pitch = request.pitch();
        let size = request.size();
        let fd = self.heap.allocate(size).map_err(|e| Error::Io {
            context: format!("allocate {size} bytes from {} heap", self.name),
            source: std::io::Error::other(e.to_string()),
        })?;
        let mapping = Mapping::new(fd.as_fd(), size, 0)?;
        debug!(
            "{} heap: {}x{}@{}bpp pitch={} size={}",
            self.name, request.width, request.height, request.bpp, pitch, size
        );
        Ok(Box::new(HeapAllocation { fd, mapping, pitch }))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

struct HeapAllocation {
    // Declared first so the mapping is torn down before the descriptor closes.
    mapping: Mapping,
    fd: OwnedFd,
    pitch: u32,
}

impl Allocation for HeapAllocation {
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
