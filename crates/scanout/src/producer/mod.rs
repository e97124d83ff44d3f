// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Producers fill pool buffers asynchronously: camera capture, hardware
//! decoders or a loopback for testing.
//!
//! The [`CaptureBridge`] registers pool buffers with a [`Producer`] by their
//! shareable descriptor and maps the producer's completions back to buffer
//! identities.

mod loopback;
mod v4l2;

pub use loopback::LoopbackProducer;
pub use v4l2::V4l2Capture;

use std::os::fd::RawFd;

use log::{debug, warn};

use crate::buffer::{Buffer, BufferId};
use crate::error::{Error, Result};
use crate::pool::BufferPool;

/// How a producer accepts buffer memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMode {
    /// Imports externally allocated dma-buf descriptors.
    DmaBuf,
    /// Only fills memory it allocated itself.
    Internal,
}

/// A filled buffer as reported by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Producer-side index, as assigned at registration.
    pub index: usize,
    /// Descriptor the producer believes it filled.
    pub descriptor: RawFd,
    pub bytes_used: u32,
}

/// Capture or decode engine that fills buffers it is handed.
pub trait Producer {
    fn name(&self) -> &'static str;

    fn memory_mode(&self) -> MemoryMode;

    /// Largest number of memory planes per buffer the producer can import.
    fn max_planes(&self) -> usize;

    /// Reserve `count` buffer slots; returns how many were granted.
    fn request_buffers(&mut self, count: usize) -> Result<usize>;

    /// Hand slot `index`, backed by `descriptor`, over for filling.
    fn queue(&mut self, index: usize, descriptor: RawFd) -> Result<()>;

    /// Block until a queued buffer has been filled.
    fn dequeue(&mut self) -> Result<Completion>;

    fn stream_on(&mut self) -> Result<()>;

    /// Stop filling. Buffers still queued are given back unfilled and are
    /// never reported by `dequeue`.
    fn stream_off(&mut self) -> Result<()>;
}

impl<P: Producer + ?Sized> Producer for Box<P> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn memory_mode(&self) -> MemoryMode {
        (**self).memory_mode()
    }

    fn max_planes(&self) -> usize {
        (**self).max_planes()
    }

    fn request_buffers(&mut self, count: usize) -> Result<usize> {
        (**self).request_buffers(count)
    }

    fn queue(&mut self, index: usize, descriptor: RawFd) -> Result<()> {
        (**self).queue(index, descriptor)
    }

    fn dequeue(&mut self) -> Result<Completion> {
        (**self).dequeue()
    }

    fn stream_on(&mut self) -> Result<()> {
        (**self).stream_on()
    }

    fn stream_off(&mut self) -> Result<()> {
        (**self).stream_off()
    }
}

/// A buffer returned by [`CaptureBridge::dequeue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filled {
    pub buffer: BufferId,
    pub bytes_used: u32,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    buffer: BufferId,
    descriptor: RawFd,
    queued: bool,
}

/// Zero-copy hand-off between a [`BufferPool`] and a [`Producer`].
pub struct CaptureBridge<P: Producer> {
    producer: P,
    bindings: Vec<Binding>,
    streaming: bool,
}

impl<P: Producer> CaptureBridge<P> {
    pub fn new(producer: P) -> Self {
        Self {
            producer,
            bindings: Vec::new(),
            streaming: false,
        }
    }

    pub fn producer(&self) -> &P {
        &self.producer
    }

    pub fn producer_mut(&mut self) -> &mut P {
        &mut self.producer
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Buffers currently held by the producer.
    pub fn queued(&self) -> usize {
        self.bindings.iter().filter(|b| b.queued).count()
    }

    /// Register every buffer of `pool` with the producer by descriptor.
    pub fn bind(&mut self, pool: &BufferPool) -> Result<()> {
        if !self.bindings.is_empty() {
            return Err(Error::Protocol(format!(
                "{} already has {} buffers bound",
                self.producer.name(),
                self.bindings.len()
            )));
        }
        if self.producer.memory_mode() != MemoryMode::DmaBuf {
            return Err(Error::Unsupported(format!(
                "{} cannot import shared buffers",
                self.producer.name()
            )));
        }
        let max_planes = self.producer.max_planes();
        if let Some(buffer) = pool.buffers().find(|b| b.planes().len() > max_planes) {
            return Err(Error::Unsupported(format!(
                "{} imports {max_planes} plane(s), buffer {} has {}",
                self.producer.name(),
                buffer.id(),
                buffer.planes().len()
            )));
        }

        let count = pool.len();
        let granted = self.producer.request_buffers(count)?;
        if granted != count {
            return Err(Error::Protocol(format!(
                "{} granted {granted} of {count} buffers",
                self.producer.name()
            )));
        }

        self.bindings = pool
            .buffers()
            .map(|b| Binding {
                buffer: b.id(),
                descriptor: b.descriptor(),
                queued: false,
            })
            .collect();
        debug!("bound {count} buffers to {}", self.producer.name());
        Ok(())
    }

    /// Hand `buffer` to the producer for filling.
    pub fn enqueue(&mut self, buffer: &Buffer) -> Result<()> {
        let descriptor = buffer.descriptor();
        let index = self
            .bindings
            .iter()
            .position(|b| b.descriptor == descriptor)
            .ok_or_else(|| {
                Error::Protocol(format!("buffer {} (fd {descriptor}) is not bound", buffer.id()))
            })?;
        if self.bindings[index].queued {
            return Err(Error::Protocol(format!(
                "buffer {} is already queued",
                buffer.id()
            )));
        }
        self.producer.queue(index, descriptor)?;
        self.bindings[index].queued = true;
        debug!("queued {} as index {index}", buffer.id());
        Ok(())
    }

    /// Block until the producer returns a filled buffer.
    ///
    /// The producer's index is authoritative; if its descriptor disagrees
    /// with the bound one the mismatch is logged and the index wins.
    pub fn dequeue(&mut self) -> Result<Filled> {
        let completion = self.producer.dequeue()?;
        let binding = self.bindings.get_mut(completion.index).ok_or_else(|| {
            Error::Protocol(format!(
                "{} completed unknown index {}",
                self.producer.name(),
                completion.index
            ))
        })?;
        if binding.descriptor != completion.descriptor {
            warn!(
                "index {}: producer reported fd {}, bound fd {}",
                completion.index, completion.descriptor, binding.descriptor
            );
        }
        if !binding.queued {
            warn!("index {} completed without being queued", completion.index);
        }
        binding.queued = false;
        debug!(
            "dequeued {} ({} bytes)",
            binding.buffer, completion.bytes_used
        );
        Ok(Filled {
            buffer: binding.buffer,
            bytes_used: completion.bytes_used,
        })
    }

    pub fn start(&mut self) -> Result<()> {
        if self.queued() == 0 {
            return Err(Error::InvalidState(
                "queue at least one buffer before streaming".into(),
            ));
        }
        self.producer.stream_on()?;
        self.streaming = true;
        Ok(())
    }

    /// Stop streaming. The producer gives up every buffer it still holds;
    /// their identities are returned so the caller can release them.
    pub fn stop(&mut self) -> Result<Vec<BufferId>> {
        self.producer.stream_off()?;
        self.streaming = false;
        let reclaimed: Vec<BufferId> = self
            .bindings
            .iter_mut()
            .filter(|b| b.queued)
            .map(|b| {
                b.queued = false;
                b.buffer
            })
            .collect();
        if !reclaimed.is_empty() {
            debug!("reclaimed {} queued buffer(s) from {}", reclaimed.len(), self.producer.name());
        }
        Ok(reclaimed)
    }

    pub fn into_producer(self) -> P {
        self.producer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{HostAllocator, TilingMode};
    use crate::display::{HeadlessScanout, Mode};
    use crate::format::PixelFormat;

    fn make_pool(format: PixelFormat, count: usize) -> (HeadlessScanout, BufferPool) {
        let mut scanout = HeadlessScanout::new()
            .unwrap()
            .with_output(1, 1, vec![Mode::new("64x32", 64, 32, 60)]);
        let pool = BufferPool::allocate(
            &HostAllocator::new(),
            &mut scanout,
            count,
            format,
            64,
            32,
            TilingMode::Linear,
        )
        .unwrap();
        (scanout, pool)
    }

    #[test]
    fn test_bind_twice_is_protocol_error() {
        let (_s, pool) = make_pool(PixelFormat::Yuyv, 2);
        let mut bridge = CaptureBridge::new(LoopbackProducer::new(128));
        bridge.bind(&pool).unwrap();
        assert!(matches!(bridge.bind(&pool), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_bind_rejects_multi_plane() {
        let (_s, pool) = make_pool(PixelFormat::Nv12, 2);
        let mut bridge = CaptureBridge::new(LoopbackProducer::new(128));
        assert!(matches!(bridge.bind(&pool), Err(Error::Unsupported(_))));

        let mut bridge = CaptureBridge::new(LoopbackProducer::new(128).with_max_planes(2));
        bridge.bind(&pool).unwrap();
    }

    #[test]
    fn test_bind_rejects_short_grant() {
        let (_s, pool) = make_pool(PixelFormat::Yuyv, 4);
        let mut bridge = CaptureBridge::new(LoopbackProducer::new(128).with_max_buffers(3));
        assert!(matches!(bridge.bind(&pool), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_bind_rejects_internal_memory() {
        let (_s, pool) = make_pool(PixelFormat::Yuyv, 1);
        let mut bridge =
            CaptureBridge::new(LoopbackProducer::new(128).with_memory_mode(MemoryMode::Internal));
        assert!(matches!(bridge.bind(&pool), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_enqueue_resolves_by_descriptor() {
        let (_s, pool) = make_pool(PixelFormat::Yuyv, 3);
        let mut bridge = CaptureBridge::new(LoopbackProducer::new(1280));
        bridge.bind(&pool).unwrap();

        let buffer = pool.get(BufferId(2)).unwrap();
        bridge.enqueue(buffer).unwrap();
        assert!(matches!(bridge.enqueue(buffer), Err(Error::Protocol(_))));
        assert_eq!(bridge.queued(), 1);
        assert_eq!(bridge.producer().queued_indices(), vec![2]);

        let filled = bridge.dequeue().unwrap();
        assert_eq!(filled.buffer, BufferId(2));
        assert_eq!(filled.bytes_used, 1280);
        assert_eq!(bridge.queued(), 0);
    }

    #[test]
    fn test_unbound_buffer_rejected() {
        let (_s, pool) = make_pool(PixelFormat::Yuyv, 1);
        let (_s2, other) = make_pool(PixelFormat::Yuyv, 1);
        let mut bridge = CaptureBridge::new(LoopbackProducer::new(1));
        bridge.bind(&pool).unwrap();
        let stranger = other.get(BufferId(0)).unwrap();
        assert!(matches!(bridge.enqueue(stranger), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_descriptor_mismatch_is_not_fatal() {
        let (_s, pool) = make_pool(PixelFormat::Yuyv, 2);
        let mut bridge = CaptureBridge::new(LoopbackProducer::new(64));
        bridge.bind(&pool).unwrap();
        bridge.producer_mut().misreport_descriptor(1);
        bridge.enqueue(pool.get(BufferId(1)).unwrap()).unwrap();
        assert_eq!(bridge.dequeue().unwrap().buffer, BufferId(1));
    }

    #[test]
    fn test_start_requires_queued_buffer() {
        let (_s, pool) = make_pool(PixelFormat::Yuyv, 2);
        let mut bridge = CaptureBridge::new(LoopbackProducer::new(64));
        bridge.bind(&pool).unwrap();
        assert!(matches!(bridge.start(), Err(Error::InvalidState(_))));

        bridge.enqueue(pool.get(BufferId(0)).unwrap()).unwrap();
        bridge.start().unwrap();
        assert!(bridge.is_streaming());
        assert!(bridge.producer().is_streaming());
        assert_eq!(bridge.stop().unwrap(), vec![BufferId(0)]);
        assert!(!bridge.is_streaming());
        assert_eq!(bridge.queued(), 0);
    }
}
