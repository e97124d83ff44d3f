// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, trace, warn};
use nix::errno::Errno;

use super::{
    Connector, FlipEvent, FramebufferDesc, FramebufferId, Mode, OverlayPlane, Rect, Scanout,
    SourceRect,
};
use crate::error::{Error, Result};
use crate::format::PixelFormat;

/// State of one CRTC after a mode-set or flip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrtcState {
    pub framebuffer: FramebufferId,
    pub connector: u32,
    pub mode: String,
    pub x: u32,
    pub y: u32,
}

/// State of one overlay plane after `set_plane`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneState {
    pub crtc: u32,
    pub framebuffer: FramebufferId,
    pub dst: Rect,
    pub src: SourceRect,
}

/// What a registered framebuffer was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferInfo {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: usize,
}

/// An in-process display controller.
///
/// Outputs, modes and overlay planes are declared up front. Flips complete
/// immediately by writing to an internal socket pair, so waiters go through
/// the same poll path as on a real device. Faults can be injected per CRTC
/// or plane, and flip completion can be stalled to exercise timeouts; a
/// stalled flip still completes once it is delivered.
#[derive(Debug)]
pub struct HeadlessScanout {
    crtcs: Vec<u32>,
    connectors: Vec<Connector>,
    planes: Vec<OverlayPlane>,
    framebuffers: HashMap<u32, FramebufferInfo>,
    next_fb: u32,
    crtc_state: HashMap<u32, CrtcState>,
    plane_state: HashMap<u32, PlaneState>,
    pending: VecDeque<FlipEvent>,
    held: Vec<FlipEvent>,
    sequence: u32,
    modesets: usize,
    stalled: bool,
    failing_crtcs: HashSet<u32>,
    failing_planes: HashSet<u32>,
    notify: UnixStream,
    events: UnixStream,
}

impl HeadlessScanout {
    pub fn new() -> Result<Self> {
        let (notify, events) = UnixStream::pair().map_err(Error::io("create event socket pair"))?;
        notify
            .set_nonblocking(true)
            .map_err(Error::io("set event socket non-blocking"))?;
        events
            .set_nonblocking(true)
            .map_err(Error::io("set event socket non-blocking"))?;
        Ok(Self {
            crtcs: Vec::new(),
            connectors: Vec::new(),
            planes: Vec::new(),
            framebuffers: HashMap::new(),
            next_fb: 1,
            crtc_state: HashMap::new(),
            plane_state: HashMap::new(),
            pending: VecDeque::new(),
            held: Vec::new(),
            sequence: 0,
            modesets: 0,
            stalled: false,
            failing_crtcs: HashSet::new(),
            failing_planes: HashSet::new(),
            notify,
            events,
        })
    }

    /// Add a connected output driven by `crtc`. The CRTC is appended to the
    /// pipe list if it is new.
    pub fn with_output(mut self, connector: u32, crtc: u32, modes: Vec<Mode>) -> Self {
        let pipe = match self.crtcs.iter().position(|&c| c == crtc) {
            Some(pipe) => pipe,
            None => {
                self.crtcs.push(crtc);
                self.crtcs.len() - 1
            }
        };
        self.connectors.push(Connector {
            id: connector,
            connected: true,
            crtc: Some(crtc),
            possible_crtcs: 1 << pipe,
            modes,
        });
        self
    }

    /// Add an overlay plane usable on the pipes in `possible_crtcs`.
    pub fn with_plane(mut self, id: u32, possible_crtcs: u32) -> Self {
        self.planes.push(OverlayPlane { id, possible_crtcs });
        self
    }

    /// Accept flips but hold back their completion. Un-stalling delivers
    /// everything held.
    pub fn set_stalled(&mut self, stalled: bool) {
        self.stalled = stalled;
        if !stalled {
            if let Err(e) = self.deliver_stalled() {
                warn!("headless: could not deliver held flips: {e}");
            }
        }
    }

    /// Report the completion of every held flip, leaving the stall in place
    /// for later flips. Returns how many completions were released.
    pub fn deliver_stalled(&mut self) -> Result<usize> {
        let count = self.held.len();
        if count > 0 {
            self.pending.extend(self.held.drain(..));
            self.signal()?;
        }
        Ok(count)
    }

    /// Flips not yet reported because of a stall.
    pub fn held_flips(&self) -> usize {
        self.held.len()
    }

    /// Make mode-sets and flips on `crtc` fail with `EBUSY`.
    pub fn fail_crtc(&mut self, crtc: u32) {
        self.failing_crtcs.insert(crtc);
    }

    /// Make `set_plane` on `plane` fail with `EINVAL`.
    pub fn fail_plane(&mut self, plane: u32) {
        self.failing_planes.insert(plane);
    }

    /// Undo every `fail_crtc` and `fail_plane`.
    pub fn clear_faults(&mut self) {
        self.failing_crtcs.clear();
        self.failing_planes.clear();
    }

    pub fn crtc_state(&self, crtc: u32) -> Option<&CrtcState> {
        self.crtc_state.get(&crtc)
    }

    pub fn plane_state(&self, plane: u32) -> Option<&PlaneState> {
        self.plane_state.get(&plane)
    }

    pub fn framebuffer(&self, fb: FramebufferId) -> Option<&FramebufferInfo> {
        self.framebuffers.get(&fb.0)
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn modeset_count(&self) -> usize {
        self.modesets
    }

    fn signal(&mut self) -> Result<()> {
        match (&self.notify).write(&[1]) {
            // A full socket is already readable.
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            other => other.map(|_| ()).map_err(Error::io("signal flip completion")),
        }
    }

    fn check_framebuffer(&self, fb: FramebufferId) -> Result<()> {
        if self.framebuffers.contains_key(&fb.0) {
            Ok(())
        } else {
            Err(Error::os("headless", "lookup framebuffer")(Errno::ENOENT))
        }
    }

    fn check_crtc(&self, crtc: u32, operation: &'static str) -> Result<()> {
        if !self.crtcs.contains(&crtc) {
            return Err(Error::os("headless", operation)(Errno::EINVAL));
        }
        if self.failing_crtcs.contains(&crtc) {
            return Err(Error::os("headless", operation)(Errno::EBUSY));
        }
        Ok(())
    }
}

impl Scanout for HeadlessScanout {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn crtcs(&self) -> Result<Vec<u32>> {
        Ok(self.crtcs.clone())
    }

    fn connectors(&self) -> Result<Vec<u32>> {
        Ok(self.connectors.iter().map(|c| c.id).collect())
    }

    fn connector(&self, id: u32) -> Result<Connector> {
        self.connectors
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown connector {id}")))
    }

    fn overlay_planes(&self) -> Result<Vec<OverlayPlane>> {
        Ok(self.planes.clone())
    }

    fn add_framebuffer(&mut self, desc: &FramebufferDesc<'_>) -> Result<FramebufferId> {
        if desc.planes.len() != desc.format.plane_count() {
            return Err(Error::InvalidArgument(format!(
                "{} needs {} plane(s), got {}",
                desc.format,
                desc.format.plane_count(),
                desc.planes.len()
            )));
        }
        let id = self.next_fb;
        self.next_fb += 1;
        self.framebuffers.insert(
            id,
            FramebufferInfo {
                format: desc.format,
                width: desc.width,
                height: desc.height,
                planes: desc.planes.len(),
            },
        );
        debug!(
            "headless: fb{id} {}x{} {}",
            desc.width, desc.height, desc.format
        );
        Ok(FramebufferId(id))
    }

    fn remove_framebuffer(&mut self, fb: FramebufferId) -> Result<()> {
        self.framebuffers
            .remove(&fb.0)
            .map(|_| ())
            .ok_or_else(|| Error::os("headless", "remove framebuffer")(Errno::ENOENT))
    }

    fn set_crtc(
        &mut self,
        crtc: u32,
        fb: FramebufferId,
        x: u32,
        y: u32,
        connector: u32,
        mode: &Mode,
    ) -> Result<()> {
        self.check_crtc(crtc, "set crtc")?;
        self.check_framebuffer(fb)?;
        self.crtc_state.insert(
            crtc,
            CrtcState {
                framebuffer: fb,
                connector,
                mode: mode.name.clone(),
                x,
                y,
            },
        );
        self.modesets += 1;
        Ok(())
    }

    fn page_flip(&mut self, crtc: u32, fb: FramebufferId) -> Result<()> {
        self.check_crtc(crtc, "page flip")?;
        self.check_framebuffer(fb)?;
        let state = self
            .crtc_state
            .get_mut(&crtc)
            .ok_or_else(|| Error::InvalidState(format!("crtc {crtc} has no mode set")))?;
        state.framebuffer = fb;

        self.sequence = self.sequence.wrapping_add(1);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let event = FlipEvent {
            crtc,
            sequence: self.sequence,
            tv_sec: now.as_secs() as u32,
            tv_usec: now.subsec_micros(),
        };
        if self.stalled {
            trace!("headless: flip on crtc {crtc} stalled");
            self.held.push(event);
            return Ok(());
        }
        self.pending.push_back(event);
        self.signal()
    }

    fn set_plane(
        &mut self,
        plane: u32,
        crtc: u32,
        fb: FramebufferId,
        dst: Rect,
        src: SourceRect,
    ) -> Result<()> {
        if !self.planes.iter().any(|p| p.id == plane) || self.failing_planes.contains(&plane) {
            return Err(Error::os("headless", "set plane")(Errno::EINVAL));
        }
        self.check_crtc(crtc, "set plane")?;
        self.check_framebuffer(fb)?;
        self.plane_state.insert(
            plane,
            PlaneState {
                crtc,
                framebuffer: fb,
                dst,
                src,
            },
        );
        Ok(())
    }

    fn event_source(&self) -> BorrowedFd<'_> {
        self.events.as_fd()
    }

    fn dispatch_events(&mut self) -> Result<Vec<FlipEvent>> {
        let mut buf = [0u8; 64];
        loop {
            match (&self.events).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io("read flip events")(e)),
            }
        }
        Ok(self.pending.drain(..).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanout() -> HeadlessScanout {
        HeadlessScanout::new()
            .unwrap()
            .with_output(4, 40, vec![Mode::new("640x480", 640, 480, 60)])
            .with_output(5, 41, vec![Mode::new("800x600", 800, 600, 60)])
            .with_plane(30, 0b11)
    }

    #[test]
    fn test_pipes_follow_declaration_order() {
        let s = scanout();
        assert_eq!(s.crtcs().unwrap(), vec![40, 41]);
        assert_eq!(s.connector(5).unwrap().possible_crtcs, 0b10);
        assert!(s.connector(6).is_err());
    }

    #[test]
    fn test_flip_requires_modeset() {
        let mut s = scanout();
        let mode = s.connector(4).unwrap().modes[0].clone();
        s.framebuffers.insert(
            1,
            FramebufferInfo {
                format: PixelFormat::Xrgb8888,
                width: 640,
                height: 480,
                planes: 1,
            },
        );
        assert!(s.page_flip(40, FramebufferId(1)).is_err());

        s.set_crtc(40, FramebufferId(1), 0, 0, 4, &mode).unwrap();
        s.page_flip(40, FramebufferId(1)).unwrap();
        let events = s.dispatch_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].crtc, 40);
        assert!(s.dispatch_events().unwrap().is_empty());
    }

    #[test]
    fn test_stalled_flips_complete_when_delivered() {
        let mut s = scanout();
        let mode = s.connector(4).unwrap().modes[0].clone();
        s.framebuffers.insert(
            1,
            FramebufferInfo {
                format: PixelFormat::Xrgb8888,
                width: 640,
                height: 480,
                planes: 1,
            },
        );
        s.set_crtc(40, FramebufferId(1), 0, 0, 4, &mode).unwrap();

        s.set_stalled(true);
        s.page_flip(40, FramebufferId(1)).unwrap();
        assert!(s.dispatch_events().unwrap().is_empty());
        assert_eq!(s.held_flips(), 1);

        assert_eq!(s.deliver_stalled().unwrap(), 1);
        s.page_flip(40, FramebufferId(1)).unwrap();
        let events = s.dispatch_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(s.held_flips(), 1);

        s.set_stalled(false);
        assert_eq!(s.dispatch_events().unwrap().len(), 1);
        assert_eq!(s.held_flips(), 0);
    }

    #[test]
    fn test_unknown_framebuffer_rejected() {
        let mut s = scanout();
        let mode = s.connector(4).unwrap().modes[0].clone();
        assert!(s.set_crtc(40, FramebufferId(99), 0, 0, 4, &mode).is_err());
        assert!(s.remove_framebuffer(FramebufferId(99)).is_err());
    }
}
