// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Scanout backends and the display pipeline built on top of them.
//!
//! A [`Scanout`] is the narrow capability interface a display controller
//! exposes: discover outputs, register buffers as framebuffers, mode-set,
//! submit page flips and overlay updates, and report flip completion through
//! a pollable event descriptor. [`Display`] drives one or more outputs side
//! by side through that interface.

mod backend;
mod headless;
mod kms;
mod pipeline;

pub use backend::{Backend, BackendKind};
pub use headless::{CrtcState, FramebufferInfo, HeadlessScanout, PlaneState};
pub use kms::KmsScanout;
pub use pipeline::{Display, Output, DEFAULT_FLIP_TIMEOUT, MAX_WAIT_RETRIES};

use std::fmt;
use std::os::fd::BorrowedFd;

use crate::error::Result;
use crate::format::PixelFormat;
use crate::sys::drm;

/// Opaque handle of a registered framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferId(pub u32);

impl fmt::Display for FramebufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fb{}", self.0)
    }
}

/// A display timing as reported by a connector.
#[derive(Debug, Clone)]
pub struct Mode {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub refresh: u32,
    pub(crate) info: drm::drm_mode_modeinfo,
}

impl Mode {
    /// A mode with only its visible geometry filled in, as used by backends
    /// that do not program real timings.
    pub fn new(name: &str, width: u16, height: u16, refresh: u32) -> Self {
        let mut info = drm::drm_mode_modeinfo {
            hdisplay: width,
            vdisplay: height,
            vrefresh: refresh,
            ..Default::default()
        };
        let len = name.len().min(drm::DRM_DISPLAY_MODE_LEN - 1);
        info.name[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self::from_info(info)
    }

    pub(crate) fn from_info(info: drm::drm_mode_modeinfo) -> Self {
        let end = info.name.iter().position(|&b| b == 0).unwrap_or(info.name.len());
        Self {
            name: String::from_utf8_lossy(&info.name[..end]).into_owned(),
            width: info.hdisplay as u32,
            height: info.vdisplay as u32,
            refresh: info.vrefresh,
            info,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}x{}@{})", self.name, self.width, self.height, self.refresh)
    }
}

/// An output connector and the modes it advertises.
#[derive(Debug, Clone)]
pub struct Connector {
    pub id: u32,
    pub connected: bool,
    /// CRTC currently driving the connector through its encoder, if any.
    pub crtc: Option<u32>,
    /// Bitmask of CRTC indices the connector's encoder can be routed to.
    pub possible_crtcs: u32,
    pub modes: Vec<Mode>,
}

/// Every connector that currently has a display attached, in the
/// controller's order.
pub fn connected_outputs<S: Scanout + ?Sized>(scanout: &S) -> Result<Vec<Connector>> {
    let mut connected = Vec::new();
    for id in scanout.connectors()? {
        let connector = scanout.connector(id)?;
        if connector.connected && !connector.modes.is_empty() {
            connected.push(connector);
        }
    }
    Ok(connected)
}

/// A hardware overlay plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayPlane {
    pub id: u32,
    /// Bitmask of CRTC indices (pipes) this plane can be attached to.
    pub possible_crtcs: u32,
}

impl OverlayPlane {
    pub fn supports_pipe(&self, pipe: usize) -> bool {
        pipe < 32 && self.possible_crtcs & (1 << pipe) != 0
    }
}

/// Completion of one page flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipEvent {
    pub crtc: u32,
    pub sequence: u32,
    pub tv_sec: u32,
    pub tv_usec: u32,
}

/// Destination rectangle in output pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Source rectangle in 16.16 fixed point buffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl SourceRect {
    pub const FRACTIONAL_BITS: u32 = 16;

    pub fn from_pixels(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x: x << Self::FRACTIONAL_BITS,
            y: y << Self::FRACTIONAL_BITS,
            width: width << Self::FRACTIONAL_BITS,
            height: height << Self::FRACTIONAL_BITS,
        }
    }
}

/// One memory plane of a framebuffer being registered.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferPlane<'a> {
    pub fd: BorrowedFd<'a>,
    pub pitch: u32,
    pub offset: u32,
}

/// Everything a backend needs to turn memory into a presentable handle.
#[derive(Debug, Clone)]
pub struct FramebufferDesc<'a> {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<FramebufferPlane<'a>>,
}

/// Display controller capability interface.
pub trait Scanout {
    fn name(&self) -> &'static str;

    /// CRTC ids in pipe order.
    fn crtcs(&self) -> Result<Vec<u32>>;

    /// Ids of every connector, connected or not.
    fn connectors(&self) -> Result<Vec<u32>>;

    fn connector(&self, id: u32) -> Result<Connector>;

    fn overlay_planes(&self) -> Result<Vec<OverlayPlane>>;

    fn add_framebuffer(&mut self, desc: &FramebufferDesc<'_>) -> Result<FramebufferId>;

    fn remove_framebuffer(&mut self, fb: FramebufferId) -> Result<()>;

    /// Synchronous mode-set scanning out `fb` from offset (`x`, `y`).
    fn set_crtc(
        &mut self,
        crtc: u32,
        fb: FramebufferId,
        x: u32,
        y: u32,
        connector: u32,
        mode: &Mode,
    ) -> Result<()>;

    /// Schedule a flip; completion is reported by [`Scanout::dispatch_events`].
    fn page_flip(&mut self, crtc: u32, fb: FramebufferId) -> Result<()>;

    fn set_plane(
        &mut self,
        plane: u32,
        crtc: u32,
        fb: FramebufferId,
        dst: Rect,
        src: SourceRect,
    ) -> Result<()>;

    /// Descriptor that becomes readable when completion events are pending.
    fn event_source(&self) -> BorrowedFd<'_>;

    /// Drain pending completion events without blocking.
    fn dispatch_events(&mut self) -> Result<Vec<FlipEvent>>;
}
