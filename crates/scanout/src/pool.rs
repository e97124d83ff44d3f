// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Fixed-size pool of presentable buffers.
//!
//! Buffers live in an index-addressed arena and carry an explicit
//! [`BufferState`]. Free buffers additionally sit on the unlocked stack,
//! which hands out the most recently released buffer first.

use log::{debug, warn};

use crate::alloc::{Allocator, PlaneRequest, TilingMode};
use crate::buffer::{Buffer, BufferId, BufferState, Plane};
use crate::display::{FramebufferDesc, FramebufferPlane, Scanout};
use crate::error::{Error, Result};
use crate::format::PixelFormat;

struct Slot {
    buffer: Buffer,
    state: BufferState,
}

/// How many buffers are in each state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolCounts {
    pub unlocked: usize,
    pub in_flight: usize,
    pub presenting: usize,
}

impl PoolCounts {
    pub fn total(&self) -> usize {
        self.unlocked + self.in_flight + self.presenting
    }
}

pub struct BufferPool {
    slots: Vec<Slot>,
    unlocked: Vec<BufferId>,
}

impl BufferPool {
    /// Allocate `count` buffers of one format and geometry and register each
    /// with `scanout`.
    ///
    /// Every plane of a buffer is allocated before its framebuffer is
    /// created. If any buffer fails, the buffers already built are
    /// unregistered and freed, and the error names the failing index.
    pub fn allocate<A, S>(
        allocator: &A,
        scanout: &mut S,
        count: usize,
        format: PixelFormat,
        width: u32,
        height: u32,
        tiling: TilingMode,
    ) -> Result<Self>
    where
        A: Allocator + ?Sized,
        S: Scanout + ?Sized,
    {
        if count == 0 {
            return Err(Error::InvalidArgument("pool needs at least one buffer".into()));
        }
        format.validate(width, height)?;

        let mut slots: Vec<Slot> = Vec::with_capacity(count);
        for index in 0..count {
            match allocate_buffer(allocator, scanout, BufferId(index), format, width, height, tiling) {
                Ok(buffer) => slots.push(Slot {
                    buffer,
                    state: BufferState::Free,
                }),
                Err(e) => {
                    warn!("buffer {index} of {count} failed, releasing {index} allocated");
                    for slot in slots.drain(..) {
                        unregister(scanout, &slot.buffer);
                    }
                    return Err(Error::Allocation {
                        index,
                        source: Box::new(e),
                    });
                }
            }
        }

        debug!(
            "{} pool: {count} x {width}x{height} {format} ({tiling})",
            allocator.name()
        );
        let unlocked = (0..count).map(BufferId).collect();
        Ok(Self { slots, unlocked })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = BufferId> + '_ {
        (0..self.slots.len()).map(BufferId)
    }

    pub fn buffers(&self) -> impl Iterator<Item = &Buffer> {
        self.slots.iter().map(|s| &s.buffer)
    }

    pub fn get(&self, id: BufferId) -> Option<&Buffer> {
        self.slots.get(id.0).map(|s| &s.buffer)
    }

    pub fn get_mut(&mut self, id: BufferId) -> Option<&mut Buffer> {
        self.slots.get_mut(id.0).map(|s| &mut s.buffer)
    }

    pub fn state(&self, id: BufferId) -> Option<BufferState> {
        self.slots.get(id.0).map(|s| s.state)
    }

    /// Take the most recently released buffer, or `None` when every buffer
    /// is in flight or presenting.
    pub fn acquire_unlocked(&mut self) -> Option<BufferId> {
        let id = self.unlocked.pop()?;
        self.slots[id.0].state = BufferState::InFlight;
        debug!("acquired buffer {id}");
        Some(id)
    }

    /// Take a specific free buffer out of the unlocked set.
    pub fn acquire(&mut self, id: BufferId) -> Result<()> {
        let state = self.slot(id)?.state;
        if state != BufferState::Free {
            return Err(Error::InvalidState(format!(
                "buffer {id} is {state:?}, not free"
            )));
        }
        self.unlocked.retain(|&u| u != id);
        self.slots[id.0].state = BufferState::InFlight;
        Ok(())
    }

    /// Return a buffer to the unlocked set.
    ///
    /// Runs the buffer's CPU/device ownership fence first, so the next user
    /// sees every write made while it was out.
    pub fn release(&mut self, id: BufferId) -> Result<()> {
        let slot = self.slot(id)?;
        if slot.state == BufferState::Free {
            return Err(Error::InvalidState(format!("buffer {id} released twice")));
        }
        slot.buffer.fence()?;
        self.slots[id.0].state = BufferState::Free;
        self.unlocked.push(id);
        debug!("released buffer {id}");
        Ok(())
    }

    /// Record that the display now scans out `id`.
    pub fn mark_presenting(&mut self, id: BufferId) -> Result<()> {
        let state = self.slot(id)?.state;
        match state {
            BufferState::InFlight => {
                self.slots[id.0].state = BufferState::Presenting;
                Ok(())
            }
            BufferState::Presenting => Ok(()),
            BufferState::Free => Err(Error::InvalidState(format!(
                "buffer {id} is free and cannot be presented"
            ))),
        }
    }

    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts::default();
        for slot in &self.slots {
            match slot.state {
                BufferState::Free => counts.unlocked += 1,
                BufferState::InFlight => counts.in_flight += 1,
                BufferState::Presenting => counts.presenting += 1,
            }
        }
        counts
    }

    /// Check that the unlocked stack and the per-buffer states agree and
    /// that every buffer is accounted for exactly once.
    pub fn check_invariants(&self) -> Result<()> {
        let mut seen = vec![false; self.slots.len()];
        for &id in &self.unlocked {
            let Some(slot) = self.slots.get(id.0) else {
                return Err(Error::InvalidState(format!("unlocked {id} out of range")));
            };
            if std::mem::replace(&mut seen[id.0], true) {
                return Err(Error::InvalidState(format!("{id} unlocked twice")));
            }
            if slot.state != BufferState::Free {
                return Err(Error::InvalidState(format!(
                    "unlocked {id} is {:?}",
                    slot.state
                )));
            }
        }
        let counts = self.counts();
        if counts.unlocked != self.unlocked.len() {
            return Err(Error::InvalidState(format!(
                "{} free buffers but {} unlocked",
                counts.unlocked,
                self.unlocked.len()
            )));
        }
        if counts.total() != self.slots.len() {
            return Err(Error::InvalidState("pool counts do not add up".into()));
        }
        Ok(())
    }

    /// Unregister every framebuffer, then free the memory.
    ///
    /// All buffers are torn down even if some unregistrations fail; the
    /// first failure is returned.
    pub fn teardown<S: Scanout + ?Sized>(self, scanout: &mut S) -> Result<()> {
        let mut result = Ok(());
        for slot in &self.slots {
            if slot.state != BufferState::Free {
                debug!("tearing down {} while {:?}", slot.buffer.id(), slot.state);
            }
            if let Err(e) = scanout.remove_framebuffer(slot.buffer.framebuffer()) {
                warn!("failed to remove {}: {e}", slot.buffer.framebuffer());
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    fn slot(&self, id: BufferId) -> Result<&Slot> {
        self.slots
            .get(id.0)
            .ok_or_else(|| Error::InvalidArgument(format!("buffer {id} not in pool")))
    }
}

fn allocate_buffer<A, S>(
    allocator: &A,
    scanout: &mut S,
    id: BufferId,
    format: PixelFormat,
    width: u32,
    height: u32,
    tiling: TilingMode,
) -> Result<Buffer>
where
    A: Allocator + ?Sized,
    S: Scanout + ?Sized,
{
    let planes = format
        .planes()
        .iter()
        .map(|layout| {
            let (w, h) = layout.dimensions(width, height);
            allocator
                .allocate(&PlaneRequest {
                    width: w,
                    height: h,
                    bpp: layout.bpp,
                    tiling,
                })
                .map(Plane::new)
        })
        .collect::<Result<Vec<_>>>()?;

    let desc = FramebufferDesc {
        format,
        width,
        height,
        planes: planes
            .iter()
            .map(|p| FramebufferPlane {
                fd: p.descriptor(),
                pitch: p.pitch(),
                offset: p.offset(),
            })
            .collect(),
    };
    let framebuffer = scanout.add_framebuffer(&desc)?;
    Ok(Buffer::new(id, format, width, height, planes, framebuffer))
}

fn unregister<S: Scanout + ?Sized>(scanout: &mut S, buffer: &Buffer) {
    if let Err(e) = scanout.remove_framebuffer(buffer.framebuffer()) {
        warn!("failed to remove {} of {}: {e}", buffer.framebuffer(), buffer.id());
    }
}
