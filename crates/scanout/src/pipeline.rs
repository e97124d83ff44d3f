// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Steady-state loops tying the pool, display, producer and governor
//! together.
//!
//! [`FlipLoop`] renders a moving pattern into primary buffers and
//! page-flips between them. [`CapturePipeline`] streams producer-filled
//! buffers onto an overlay plane above a static background.
//!
//! Both loops follow the same ownership rule: a buffer goes back to the
//! pool only once the buffer replacing it on screen has been confirmed.

use log::{debug, info, warn};

use crate::alloc::{Allocator, TilingMode};
use crate::buffer::BufferId;
use crate::config::PipelineConfig;
use crate::display::{Display, Scanout};
use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::governor::{Mark, RateGovernor};
use crate::pattern;
use crate::pool::BufferPool;
use crate::producer::{CaptureBridge, Producer};

/// Pattern frame painted into the background behind the overlay.
const BACKGROUND_FRAME: u32 = 42;

/// Smallest pool that can keep one buffer on screen while filling another.
const MIN_BUFFERS: usize = 2;

fn check_buffer_count(config: &PipelineConfig) -> Result<()> {
    config.validate()?;
    if config.buffer_count < MIN_BUFFERS {
        return Err(Error::InvalidArgument(format!(
            "{} buffer(s) requested, at least {MIN_BUFFERS} are needed to flip",
            config.buffer_count
        )));
    }
    Ok(())
}

/// Page-flip through a pool of pattern-filled primary buffers.
pub struct FlipLoop<S: Scanout> {
    display: Display<S>,
    pool: BufferPool,
    governor: RateGovernor,
    mark: Mark,
    frame: u32,
    presenting: Option<BufferId>,
    // Replaced on screen, but the replacing flip was never confirmed.
    retired: Vec<BufferId>,
}

impl<S: Scanout> FlipLoop<S> {
    /// Allocate `config.buffer_count` primary buffers.
    ///
    /// A zero width or height in `config` takes the display's combined
    /// geometry so one buffer spans every output.
    pub fn new<A>(mut display: Display<S>, allocator: &A, config: &PipelineConfig) -> Result<Self>
    where
        A: Allocator + ?Sized,
    {
        check_buffer_count(config)?;
        let width = if config.width == 0 { display.width() } else { config.width };
        let height = if config.height == 0 { display.height() } else { config.height };
        if width == 0 || height == 0 {
            return Err(Error::InvalidState("display has no active outputs".into()));
        }

        display.set_flip_timeout(config.flip_timeout);
        let pool = BufferPool::allocate(
            allocator,
            display.backend_mut(),
            config.buffer_count,
            config.format,
            width,
            height,
            config.tiling,
        )?;
        info!(
            "flipping {} x {width}x{height} {} buffers at {}",
            config.buffer_count,
            config.format,
            fps_label(config.fps)
        );

        Ok(Self {
            display,
            pool,
            governor: RateGovernor::new(config.fps),
            mark: Mark::now(),
            frame: 0,
            presenting: None,
            retired: Vec::new(),
        })
    }

    pub fn display(&self) -> &Display<S> {
        &self.display
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Frames presented so far, including ones whose present reported an
    /// error.
    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn presenting(&self) -> Option<BufferId> {
        self.presenting
    }

    /// Fill the next buffer, present it and pace the loop.
    ///
    /// The buffer becomes the presenting one whatever the outcome. The
    /// buffer it replaced returns to the pool only when the present fully
    /// succeeded; otherwise it is held until a later present does.
    pub fn step(&mut self) -> Result<()> {
        let id = self
            .pool
            .acquire_unlocked()
            .ok_or_else(|| Error::InvalidState("no unlocked primary buffer".into()))?;
        let buffer = self
            .pool
            .get_mut(id)
            .ok_or_else(|| Error::InvalidState(format!("buffer {id} vanished from the pool")))?;
        if let Err(e) = pattern::fill(buffer, self.frame.wrapping_mul(2)) {
            self.pool.release(id)?;
            return Err(e);
        }

        let result = self.display.present_primary(buffer);
        self.pool.mark_presenting(id)?;
        let previous = self.presenting.replace(id);
        match &result {
            Ok(()) => {
                for old in self.retired.drain(..).chain(previous) {
                    self.pool.release(old)?;
                }
            }
            Err(e) => {
                warn!("frame {}: holding previous buffer after {e}", self.frame);
                self.retired.extend(previous);
            }
        }

        self.governor.maintain_rate();
        debug!("frame {} displayed after {:?}", self.frame, self.mark.lap());
        self.frame = self.frame.wrapping_add(1);
        result
    }

    /// Present `frames` frames, stopping at the first error.
    pub fn run(&mut self, frames: u32) -> Result<()> {
        for _ in 0..frames {
            self.step()?;
        }
        info!("presented {} frame(s)", self.frame);
        Ok(())
    }

    /// Unregister and free every buffer, handing the display back.
    pub fn shutdown(self) -> Result<Display<S>> {
        let Self {
            mut display, pool, ..
        } = self;
        pool.teardown(display.backend_mut())?;
        Ok(display)
    }
}

/// Producer frames shown on an overlay plane over a static background.
pub struct CapturePipeline<S: Scanout, P: Producer> {
    display: Display<S>,
    background: BufferPool,
    pool: BufferPool,
    bridge: CaptureBridge<P>,
    governor: RateGovernor,
    mark: Mark,
    frames: u64,
    overlay: Option<BufferId>,
    // Off the overlay but still scanned out by an output that failed to
    // take a newer frame.
    retired: Vec<BufferId>,
}

impl<S: Scanout, P: Producer> CapturePipeline<S, P> {
    /// Put a pattern background on the primary plane, then allocate the
    /// video pool at the configured capture geometry and bind it to
    /// `producer`.
    pub fn new<A>(
        mut display: Display<S>,
        allocator: &A,
        producer: P,
        config: &PipelineConfig,
    ) -> Result<Self>
    where
        A: Allocator + ?Sized,
    {
        check_buffer_count(config)?;
        if config.width == 0 || config.height == 0 {
            return Err(Error::InvalidArgument("capture geometry is required".into()));
        }
        if display.width() == 0 || display.height() == 0 {
            return Err(Error::InvalidState("display has no active outputs".into()));
        }
        display.set_flip_timeout(config.flip_timeout);

        let background = show_background(&mut display, allocator)?;
        let pool = match BufferPool::allocate(
            allocator,
            display.backend_mut(),
            config.buffer_count,
            config.format,
            config.width,
            config.height,
            config.tiling,
        ) {
            Ok(pool) => pool,
            Err(e) => {
                discard(background, &mut display);
                return Err(e);
            }
        };

        let mut bridge = CaptureBridge::new(producer);
        if let Err(e) = bridge.bind(&pool) {
            discard(pool, &mut display);
            discard(background, &mut display);
            return Err(e);
        }
        info!(
            "streaming {} x {}x{}@{} from {} at {}",
            config.buffer_count,
            config.width,
            config.height,
            config.format,
            bridge.producer().name(),
            fps_label(config.fps)
        );

        Ok(Self {
            display,
            background,
            pool,
            bridge,
            governor: RateGovernor::new(config.fps),
            mark: Mark::now(),
            frames: 0,
            overlay: None,
            retired: Vec::new(),
        })
    }

    pub fn display(&self) -> &Display<S> {
        &self.display
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn display_mut(&mut self) -> &mut Display<S> {
        &mut self.display
    }

    pub fn bridge(&self) -> &CaptureBridge<P> {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut CaptureBridge<P> {
        &mut self.bridge
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Buffer currently on the overlay plane.
    pub fn overlay(&self) -> Option<BufferId> {
        self.overlay
    }

    /// Buffers taken off the overlay but still scanned out somewhere.
    pub fn retired(&self) -> &[BufferId] {
        &self.retired
    }

    /// Queue one buffer and start the producer.
    pub fn prime(&mut self) -> Result<()> {
        if self.bridge.is_streaming() {
            return Err(Error::InvalidState("capture already streaming".into()));
        }
        self.enqueue_next()?;
        self.bridge.start()
    }

    /// Keep the producer fed, wait for the next filled buffer and show it.
    ///
    /// When every free buffer is already queued the step only waits for a
    /// completion. A buffer taken off the overlay returns to the pool once
    /// no output's plane scans it out any more, so after a partial failure
    /// it is held. A frame no output took goes straight back to the pool.
    pub fn step(&mut self) -> Result<()> {
        if !self.bridge.is_streaming() {
            return Err(Error::InvalidState("prime the capture before stepping".into()));
        }
        if !self.enqueue_next()? && self.bridge.queued() == 0 {
            return Err(Error::InvalidState(
                "capture pool starved: nothing free and nothing queued".into(),
            ));
        }

        let filled = self.bridge.dequeue()?;
        let buffer = self.pool.get(filled.buffer).ok_or_else(|| {
            Error::Protocol(format!("{} completed outside the pool", filled.buffer))
        })?;
        let result = self
            .display
            .present_overlay(buffer, 0, 0, buffer.width(), buffer.height());
        if self.display.overlay_shows(filled.buffer) {
            self.pool.mark_presenting(filled.buffer)?;
            self.retired.extend(self.overlay.replace(filled.buffer));
        } else {
            warn!("frame {}: {} not shown on any output", self.frames, filled.buffer);
            self.pool.release(filled.buffer)?;
        }

        let (held, done): (Vec<BufferId>, Vec<BufferId>) = self
            .retired
            .drain(..)
            .partition(|&id| self.display.overlay_shows(id));
        self.retired = held;
        for id in done {
            self.pool.release(id)?;
        }
        if !self.retired.is_empty() {
            debug!("holding {:?} still scanned out", self.retired);
        }

        self.governor.maintain_rate();
        debug!(
            "frame {}: {} ({} bytes) after {:?}",
            self.frames,
            filled.buffer,
            filled.bytes_used,
            self.mark.lap()
        );
        self.frames += 1;
        result
    }

    /// Show `frames` frames. Soft errors skip the frame or output and the
    /// loop carries on; anything else ends it.
    pub fn run(&mut self, frames: u64) -> Result<()> {
        if !self.bridge.is_streaming() {
            self.prime()?;
        }
        for _ in 0..frames {
            match self.step() {
                Ok(()) => {}
                Err(e) if e.is_soft() => warn!("frame {}: {e}", self.frames),
                Err(e) => return Err(e),
            }
        }
        info!("displayed {} frame(s)", self.frames);
        Ok(())
    }

    /// Stop the producer, return its buffers to the pool and free both
    /// pools, handing the display back.
    pub fn shutdown(self) -> Result<Display<S>> {
        let Self {
            mut display,
            background,
            mut pool,
            mut bridge,
            ..
        } = self;

        let stopped = bridge.stop();
        if let Ok(reclaimed) = &stopped {
            for &id in reclaimed {
                if let Err(e) = pool.release(id) {
                    warn!("could not reclaim {id}: {e}");
                }
            }
        }
        let freed = pool.teardown(display.backend_mut());
        let cleared = background.teardown(display.backend_mut());
        stopped?;
        freed?;
        cleared?;
        Ok(display)
    }

    /// Hand the most recently released buffer to the producer. Returns
    /// false when no buffer is free.
    fn enqueue_next(&mut self) -> Result<bool> {
        let Some(id) = self.pool.acquire_unlocked() else {
            return Ok(false);
        };
        let queued = match self.pool.get(id) {
            Some(buffer) => self.bridge.enqueue(buffer),
            None => Err(Error::InvalidState(format!("buffer {id} vanished from the pool"))),
        };
        if let Err(e) = queued {
            self.pool.release(id)?;
            return Err(e);
        }
        Ok(true)
    }
}

fn show_background<S, A>(display: &mut Display<S>, allocator: &A) -> Result<BufferPool>
where
    S: Scanout,
    A: Allocator + ?Sized,
{
    let (width, height) = (display.width(), display.height());
    let mut background = BufferPool::allocate(
        allocator,
        display.backend_mut(),
        1,
        PixelFormat::Xrgb8888,
        width,
        height,
        TilingMode::Linear,
    )?;
    let id = background
        .acquire_unlocked()
        .ok_or_else(|| Error::InvalidState("background pool is empty".into()))?;
    let shown = match background.get_mut(id) {
        Some(buffer) => match pattern::fill(buffer, BACKGROUND_FRAME) {
            Ok(()) => display.present_primary(buffer),
            Err(e) => Err(e),
        },
        None => Err(Error::InvalidState("background buffer missing".into())),
    };
    match shown {
        Ok(()) => {}
        Err(e) if e.is_soft() => warn!("background not fully shown: {e}"),
        Err(e) => {
            discard(background, display);
            return Err(e);
        }
    }
    background.mark_presenting(id)?;
    Ok(background)
}

fn discard<S: Scanout>(pool: BufferPool, display: &mut Display<S>) {
    if let Err(e) = pool.teardown(display.backend_mut()) {
        warn!("cleanup after failed setup: {e}");
    }
}

fn fps_label(fps: u32) -> String {
    if fps == 0 {
        "display rate".to_string()
    } else {
        format!("{fps} fps")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::HostAllocator;
    use crate::buffer::BufferState;
    use crate::display::{HeadlessScanout, Mode};
    use crate::config::{CaptureSpec, ModeSelection};
    use crate::producer::LoopbackProducer;

    fn display() -> Display<HeadlessScanout> {
        let scanout = HeadlessScanout::new()
            .unwrap()
            .with_output(1, 1, vec![Mode::new("64x32", 64, 32, 60)])
            .with_plane(5, 0b1);
        Display::open(scanout, &["1:64x32".parse::<ModeSelection>().unwrap()]).unwrap()
    }

    #[test]
    fn test_flip_loop_needs_two_buffers() {
        let config = PipelineConfig {
            buffer_count: 1,
            ..Default::default()
        };
        let result = FlipLoop::new(display(), &HostAllocator::new(), &config);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_flip_loop_uses_display_geometry() {
        let mut flip = FlipLoop::new(display(), &HostAllocator::new(), &PipelineConfig::default())
            .unwrap();
        let buffer = flip.pool().buffers().next().unwrap();
        assert_eq!((buffer.width(), buffer.height()), (64, 32));

        flip.run(5).unwrap();
        assert_eq!(flip.frame(), 5);
        let counts = flip.pool().counts();
        assert_eq!(counts.presenting, 1);
        assert_eq!(counts.unlocked, 2);
        assert_eq!(flip.display().current(), flip.presenting());
        flip.pool().check_invariants().unwrap();

        let display = flip.shutdown().unwrap();
        assert_eq!(display.backend().framebuffer_count(), 0);
    }

    #[test]
    fn test_flip_loop_holds_buffer_after_timeout() {
        let config = PipelineConfig {
            flip_timeout: std::time::Duration::from_millis(20),
            ..Default::default()
        };
        let mut flip = FlipLoop::new(display(), &HostAllocator::new(), &config).unwrap();
        flip.step().unwrap();
        flip.display.backend_mut().set_stalled(true);
        assert!(matches!(flip.step(), Err(Error::Timeout { .. })));
        assert_eq!(flip.pool().counts().presenting, 2);

        flip.display.backend_mut().set_stalled(false);
        flip.step().unwrap();
        let counts = flip.pool().counts();
        assert_eq!((counts.presenting, counts.unlocked), (1, 2));
        flip.pool().check_invariants().unwrap();
    }

    #[test]
    fn test_background_covers_display() {
        let mut display = display();
        let background = show_background(&mut display, &HostAllocator::new()).unwrap();
        let id = background.ids().next().unwrap();
        let buffer = background.get(id).unwrap();
        assert_eq!((buffer.width(), buffer.height()), (64, 32));
        assert_eq!(buffer.format(), PixelFormat::Xrgb8888);
        assert_eq!(background.state(id), Some(BufferState::Presenting));
        assert_eq!(display.current(), Some(id));
        assert_eq!(
            display.backend().crtc_state(1).unwrap().framebuffer,
            buffer.framebuffer()
        );

        background.teardown(display.backend_mut()).unwrap();
        assert_eq!(display.backend().framebuffer_count(), 0);
    }

    #[test]
    fn test_failed_overlay_keeps_shown_buffer() {
        let spec: CaptureSpec = "32x16@YUYV".parse().unwrap();
        let config = PipelineConfig::default().with_capture(spec);
        let mut capture = CapturePipeline::new(
            display(),
            &HostAllocator::new(),
            LoopbackProducer::new(32 * 16 * 2),
            &config,
        )
        .unwrap();
        capture.prime().unwrap();
        capture.step().unwrap();
        let shown = capture.overlay().unwrap();
        let fb = capture.pool().get(shown).unwrap().framebuffer();

        capture.display_mut().backend_mut().fail_plane(5);
        for _ in 0..4 {
            let err = capture.step().unwrap_err();
            assert!(err.is_soft());
            assert_eq!(capture.overlay(), Some(shown));
            assert_eq!(capture.pool().state(shown), Some(BufferState::Presenting));
            assert_eq!(
                capture.display().backend().plane_state(5).unwrap().framebuffer,
                fb
            );
            assert_eq!(capture.pool().counts().presenting, 1);
            capture.pool().check_invariants().unwrap();
        }

        capture.display_mut().backend_mut().clear_faults();
        capture.step().unwrap();
        assert_ne!(capture.overlay(), Some(shown));
        assert_eq!(capture.pool().state(shown), Some(BufferState::Free));
        assert!(capture.retired().is_empty());
        capture.pool().check_invariants().unwrap();
    }

    #[test]
    fn test_capture_requires_geometry() {
        let producer = LoopbackProducer::new(0);
        let result = CapturePipeline::new(
            display(),
            &HostAllocator::new(),
            producer,
            &PipelineConfig::default(),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_capture_cycles_buffers() {
        let spec: CaptureSpec = "32x16@YUYV".parse().unwrap();
        let config = PipelineConfig::default().with_capture(spec);
        let mut capture = CapturePipeline::new(
            display(),
            &HostAllocator::new(),
            LoopbackProducer::new(32 * 16 * 2),
            &config,
        )
        .unwrap();

        capture.prime().unwrap();
        assert_eq!(capture.bridge().queued(), 1);
        capture.run(6).unwrap();
        assert_eq!(capture.frames(), 6);

        let overlay = capture.overlay().unwrap();
        assert_eq!(capture.pool().state(overlay), Some(BufferState::Presenting));
        assert_eq!(capture.display().current_overlay(), Some(overlay));
        capture.pool().check_invariants().unwrap();

        let plane = capture.display().backend().plane_state(5).unwrap().clone();
        assert_eq!((plane.dst.width, plane.dst.height), (64, 32));

        let display = capture.shutdown().unwrap();
        assert_eq!(display.backend().framebuffer_count(), 0);
    }

    #[test]
    fn test_capture_with_two_buffers_waits_on_producer() {
        let spec: CaptureSpec = "32x16@UYVY".parse().unwrap();
        let config = PipelineConfig {
            buffer_count: 2,
            ..PipelineConfig::default().with_capture(spec)
        };
        let mut capture = CapturePipeline::new(
            display(),
            &HostAllocator::new(),
            LoopbackProducer::new(1),
            &config,
        )
        .unwrap();
        capture.run(4).unwrap();
        assert_eq!(capture.frames(), 4);
        capture.pool().check_invariants().unwrap();
        capture.shutdown().unwrap();
    }

    #[test]
    fn test_step_before_prime_fails() {
        let spec: CaptureSpec = "32x16@YUYV".parse().unwrap();
        let config = PipelineConfig::default().with_capture(spec);
        let mut capture = CapturePipeline::new(
            display(),
            &HostAllocator::new(),
            LoopbackProducer::new(1),
            &config,
        )
        .unwrap();
        assert!(matches!(capture.step(), Err(Error::InvalidState(_))));
    }
}
