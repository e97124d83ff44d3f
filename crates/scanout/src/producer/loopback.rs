// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::os::fd::RawFd;

use log::trace;

use super::{Completion, MemoryMode, Producer};
use crate::error::{Error, Result};

/// A producer that completes whatever it is given without touching the
/// memory.
///
/// Buffers complete in queue order unless a completion order has been
/// scripted with [`LoopbackProducer::complete_in_order`]. Every completion
/// reports the same `bytes_used`.
#[derive(Debug)]
pub struct LoopbackProducer {
    bytes_used: u32,
    max_buffers: usize,
    max_planes: usize,
    memory: MemoryMode,
    slots: usize,
    queue: VecDeque<(usize, RawFd)>,
    script: VecDeque<usize>,
    misreport: Option<usize>,
    streaming: bool,
}

impl LoopbackProducer {
    pub fn new(bytes_used: u32) -> Self {
        Self {
            bytes_used,
            max_buffers: usize::MAX,
            max_planes: 1,
            memory: MemoryMode::DmaBuf,
            slots: 0,
            queue: VecDeque::new(),
            script: VecDeque::new(),
            misreport: None,
            streaming: false,
        }
    }

    /// Grant at most `max` buffers in `request_buffers`.
    pub fn with_max_buffers(mut self, max: usize) -> Self {
        self.max_buffers = max;
        self
    }

    pub fn with_max_planes(mut self, max: usize) -> Self {
        self.max_planes = max;
        self
    }

    pub fn with_memory_mode(mut self, memory: MemoryMode) -> Self {
        self.memory = memory;
        self
    }

    /// Complete these indices first, in this order, as soon as each one is
    /// queued.
    pub fn complete_in_order(&mut self, order: impl IntoIterator<Item = usize>) {
        self.script.extend(order);
    }

    /// Report a bogus descriptor the next time `index` completes.
    pub fn misreport_descriptor(&mut self, index: usize) {
        self.misreport = Some(index);
    }

    pub fn queued_indices(&self) -> Vec<usize> {
        self.queue.iter().map(|&(index, _)| index).collect()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    fn next_position(&mut self) -> Option<usize> {
        if let Some(&wanted) = self.script.front() {
            if let Some(pos) = self.queue.iter().position(|&(index, _)| index == wanted) {
                self.script.pop_front();
                return Some(pos);
            }
        }
        (!self.queue.is_empty()).then_some(0)
    }
}

impl Producer for LoopbackProducer {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn memory_mode(&self) -> MemoryMode {
        self.memory
    }

    fn max_planes(&self) -> usize {
        self.max_planes
    }

    fn request_buffers(&mut self, count: usize) -> Result<usize> {
        self.slots = count.min(self.max_buffers);
        Ok(self.slots)
    }

    fn queue(&mut self, index: usize, descriptor: RawFd) -> Result<()> {
        if index >= self.slots {
            return Err(Error::InvalidArgument(format!(
                "index {index} beyond {} requested buffers",
                self.slots
            )));
        }
        trace!("loopback: queue {index} fd {descriptor}");
        self.queue.push_back((index, descriptor));
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Completion> {
        // Nothing would ever complete; blocking here would hang forever.
        let pos = self
            .next_position()
            .ok_or_else(|| Error::InvalidState("dequeue with no buffer queued".into()))?;
        let (index, mut descriptor) = self
            .queue
            .remove(pos)
            .ok_or_else(|| Error::InvalidState("loopback queue out of sync".into()))?;
        if self.misreport == Some(index) {
            self.misreport = None;
            descriptor = -1;
        }
        Ok(Completion {
            index,
            descriptor,
            bytes_used: self.bytes_used,
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.streaming = false;
        self.queue.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_by_default() {
        let mut p = LoopbackProducer::new(10);
        assert_eq!(p.request_buffers(3).unwrap(), 3);
        p.queue(2, 12).unwrap();
        p.queue(0, 10).unwrap();
        assert_eq!(p.dequeue().unwrap().index, 2);
        assert_eq!(p.dequeue().unwrap().index, 0);
        assert!(p.dequeue().is_err());
    }

    #[test]
    fn test_scripted_order() {
        let mut p = LoopbackProducer::new(10);
        p.request_buffers(3).unwrap();
        p.complete_in_order([1, 0]);
        p.queue(0, 10).unwrap();
        p.queue(1, 11).unwrap();
        p.queue(2, 12).unwrap();
        let order: Vec<usize> = (0..3).map(|_| p.dequeue().unwrap().index).collect();
        assert_eq!(order, vec![1, 0, 2]);
    }

    #[test]
    fn test_queue_beyond_request_fails() {
        let mut p = LoopbackProducer::new(10).with_max_buffers(2);
        assert_eq!(p.request_buffers(4).unwrap(), 2);
        assert!(p.queue(2, 5).is_err());
    }
}
