// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::os::fd::BorrowedFd;
use std::str::FromStr;
use std::sync::Arc;

use libloading::Library;
use log::{debug, info, warn};

use super::{
    Connector, FlipEvent, FramebufferDesc, FramebufferId, HeadlessScanout, KmsScanout, Mode,
    OverlayPlane, Rect, Scanout, SourceRect,
};
use crate::device::DrmDevice;
use crate::error::{Error, Result};

const X11_LIBRARIES: &[&str] = &["libX11.so.6", "libdri2.so.0"];
const GPU_LIBRARIES: &[&str] = &["libEGL.so.1", "libGLESv2.so.2", "libgbm.so.1"];

/// The kinds of display backend the pipeline knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Direct DRM/KMS scanout.
    Kms,
    /// Windowed presentation through an X server's DRI2 buffers.
    X11,
    /// Buffers imported as GPU textures and composited with EGL.
    GpuComposited,
    /// In-process scanout without hardware.
    Headless,
}

impl BackendKind {
    /// Whether the pieces this backend needs are present on the system.
    pub fn is_available(&self) -> bool {
        match self {
            BackendKind::Kms => (0..8).any(|n| {
                std::path::Path::new(&format!("/dev/dri/card{n}")).exists()
            }),
            BackendKind::X11 => {
                std::env::var_os("DISPLAY").is_some() && libraries_present(X11_LIBRARIES)
            }
            BackendKind::GpuComposited => libraries_present(GPU_LIBRARIES),
            BackendKind::Headless => true,
        }
    }

    /// Available hardware backends in order of preference: a running X
    /// server first, then bare KMS. GPU composition is only used on request.
    pub fn probe() -> Vec<BackendKind> {
        let found: Vec<_> = [BackendKind::X11, BackendKind::Kms]
            .into_iter()
            .filter(BackendKind::is_available)
            .collect();
        debug!("available display backends: {found:?}");
        found
    }
}

fn libraries_present(names: &[&str]) -> bool {
    names.iter().all(|name| {
        // SAFETY: only system display libraries are loaded, and their
        // initialisers have no preconditions.
        match unsafe { Library::new(name) } {
            Ok(_) => true,
            Err(e) => {
                debug!("{name} not loadable: {e}");
                false
            }
        }
    })
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "kms" => Ok(BackendKind::Kms),
            "x11" => Ok(BackendKind::X11),
            "gpu" | "gpu-composited" => Ok(BackendKind::GpuComposited),
            "headless" => Ok(BackendKind::Headless),
            _ => Err(Error::InvalidArgument(format!(
                "unknown backend '{s}', expected kms, x11, gpu or headless"
            ))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Kms => "kms",
            BackendKind::X11 => "x11",
            BackendKind::GpuComposited => "gpu",
            BackendKind::Headless => "headless",
        })
    }
}

/// An opened display backend.
pub enum Backend {
    Kms(KmsScanout),
    Headless(HeadlessScanout),
}

impl Backend {
    /// Open a backend of the given kind.
    ///
    /// The headless backend comes up with a single 1280x720 output on
    /// connector 1 / crtc 1 and one overlay plane.
    pub fn open(kind: BackendKind) -> Result<Self> {
        match kind {
            BackendKind::Kms => {
                let device = Arc::new(DrmDevice::open_first_card()?);
                Ok(Backend::Kms(KmsScanout::new(device)?))
            }
            BackendKind::X11 | BackendKind::GpuComposited => Err(Error::Unsupported(format!(
                "{kind} backend depends on vendor display extensions"
            ))),
            BackendKind::Headless => Ok(Backend::Headless(
                HeadlessScanout::new()?
                    .with_output(
                        1,
                        1,
                        vec![
                            Mode::new("1280x720", 1280, 720, 60),
                            Mode::new("1920x1080", 1920, 1080, 60),
                            Mode::new("640x480", 640, 480, 60),
                        ],
                    )
                    .with_plane(1, 0b1),
            )),
        }
    }

    /// Open the first probed backend that comes up.
    pub fn open_first() -> Result<Self> {
        let mut last_err = None;
        for kind in BackendKind::probe() {
            match Backend::open(kind) {
                Ok(backend) => {
                    info!("using {kind} display backend");
                    return Ok(backend);
                }
                Err(e) => {
                    warn!("{kind} display backend unavailable: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Unsupported("no display backend found".into())))
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Kms(_) => BackendKind::Kms,
            Backend::Headless(_) => BackendKind::Headless,
        }
    }

    /// The DRM device behind a KMS backend, for dumb-buffer allocation.
    pub fn drm_device(&self) -> Option<Arc<DrmDevice>> {
        match self {
            Backend::Kms(kms) => Some(kms.device().clone()),
            Backend::Headless(_) => None,
        }
    }
}

macro_rules! delegate {
    ($self:ident, $s:ident => $e:expr) => {
        match $self {
            Backend::Kms($s) => $e,
            Backend::Headless($s) => $e,
        }
    };
}

impl Scanout for Backend {
    fn name(&self) -> &'static str {
        delegate!(self, s => s.name())
    }

    fn crtcs(&self) -> Result<Vec<u32>> {
        delegate!(self, s => s.crtcs())
    }

    fn connectors(&self) -> Result<Vec<u32>> {
        delegate!(self, s => s.connectors())
    }

    fn connector(&self, id: u32) -> Result<Connector> {
        delegate!(self, s => s.connector(id))
    }

    fn overlay_planes(&self) -> Result<Vec<OverlayPlane>> {
        delegate!(self, s => s.overlay_planes())
    }

    fn add_framebuffer(&mut self, desc: &FramebufferDesc<'_>) -> Result<FramebufferId> {
        delegate!(self, s => s.add_framebuffer(desc))
    }

    fn remove_framebuffer(&mut self, fb: FramebufferId) -> Result<()> {
        delegate!(self, s => s.remove_framebuffer(fb))
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
        delegate!(self, s => s.set_crtc(crtc, fb, x, y, connector, mode))
    }

    fn page_flip(&mut self, crtc: u32, fb: FramebufferId) -> Result<()> {
        delegate!(self, s => s.page_flip(crtc, fb))
    }

    fn set_plane(
        &mut self,
        plane: u32,
        crtc: u32,
        fb: FramebufferId,
        dst: Rect,
        src: SourceRect,
    ) -> Result<()> {
        delegate!(self, s => s.set_plane(plane, crtc, fb, dst, src))
    }

    fn event_source(&self) -> BorrowedFd<'_> {
        delegate!(self, s => s.event_source())
    }

    fn dispatch_events(&mut self) -> Result<Vec<FlipEvent>> {
        delegate!(self, s => s.dispatch_events())
    }
}
