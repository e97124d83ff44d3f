// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::{Connector, Mode, OverlayPlane, Rect, Scanout, SourceRect};
use crate::buffer::{Buffer, BufferId};
use crate::config::ModeSelection;
use crate::error::{Error, OutputFailure, Result};

/// Upper bound on one present call's wait for flip completions.
pub const DEFAULT_FLIP_TIMEOUT: Duration = Duration::from_secs(3);

/// How many times a single wait tolerates `EAGAIN`/`EINTR` from poll.
pub const MAX_WAIT_RETRIES: u32 = 8;

/// One display output bound to a connector, mode and CRTC.
#[derive(Debug, Clone)]
pub struct Output {
    pub connector: u32,
    pub crtc: u32,
    /// Index of `crtc` in the controller's CRTC list.
    pub pipe: usize,
    pub mode: Mode,
    /// Horizontal offset of this output inside the side-by-side surface.
    pub x_offset: u32,
    overlay: Option<u32>,
    overlay_buffer: Option<BufferId>,
    // Flips the current present call is waiting for.
    pending: u64,
    // Flips given up on after a timeout whose completions are still due.
    abandoned: u64,
}

impl Output {
    /// Overlay plane bound to this output, once one has been claimed.
    pub fn overlay_plane(&self) -> Option<u32> {
        self.overlay
    }

    /// Buffer this output's overlay plane last accepted.
    pub fn overlay_buffer(&self) -> Option<BufferId> {
        self.overlay_buffer
    }

    /// Timed-out flips on this output that have not reported completion.
    pub fn abandoned_flips(&self) -> u64 {
        self.abandoned
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct FlipCounter {
    scheduled: u64,
    completed: u64,
}

/// Drives one or more outputs composed side by side.
///
/// Output `k` scans out its region starting at the cumulative width of
/// outputs `0..k`, so a single primary buffer of [`Display::width`] x
/// [`Display::height`] covers every output.
pub struct Display<S: Scanout> {
    backend: S,
    outputs: Vec<Output>,
    planes: Vec<OverlayPlane>,
    claimed: Vec<u32>,
    flips: FlipCounter,
    current: Option<BufferId>,
    current_overlay: Option<BufferId>,
    width: u32,
    height: u32,
    flip_timeout: Duration,
}

impl<S: Scanout> Display<S> {
    /// Resolve every mode selection into an output.
    ///
    /// Selections that cannot be resolved (unknown connector, mode or CRTC)
    /// are logged and left out; the remaining outputs are still driven.
    pub fn open(backend: S, selections: &[ModeSelection]) -> Result<Self> {
        let crtcs = backend.crtcs()?;
        let planes = match backend.overlay_planes() {
            Ok(planes) => planes,
            Err(e) => {
                warn!("{}: no overlay planes: {e}", backend.name());
                Vec::new()
            }
        };

        let mut outputs: Vec<Output> = Vec::with_capacity(selections.len());
        let mut width = 0;
        let mut height = 0;
        for selection in selections {
            if outputs.iter().any(|o| o.connector == selection.connector) {
                warn!("connector {} selected twice, ignoring {selection}", selection.connector);
                continue;
            }
            match resolve_output(&backend, &crtcs, selection) {
                Ok((crtc, pipe, mode)) => {
                    debug!(
                        "connector {} -> crtc {crtc} (pipe {pipe}) {mode} at x={width}",
                        selection.connector
                    );
                    outputs.push(Output {
                        connector: selection.connector,
                        crtc,
                        pipe,
                        x_offset: width,
                        overlay: None,
                        overlay_buffer: None,
                        pending: 0,
                        abandoned: 0,
                        mode: mode.clone(),
                    });
                    width += mode.width;
                    height = height.max(mode.height);
                }
                Err(e) => error!("could not set up output {selection}: {e}"),
            }
        }

        info!(
            "{}: using {} output(s), {width}x{height} display",
            backend.name(),
            outputs.len()
        );

        Ok(Self {
            backend,
            outputs,
            planes,
            claimed: Vec::new(),
            flips: FlipCounter::default(),
            current: None,
            current_overlay: None,
            width,
            height,
            flip_timeout: DEFAULT_FLIP_TIMEOUT,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut S {
        &mut self.backend
    }

    pub fn into_backend(self) -> S {
        self.backend
    }

    /// Buffer most recently handed to [`Display::present_primary`].
    pub fn current(&self) -> Option<BufferId> {
        self.current
    }

    pub fn current_overlay(&self) -> Option<BufferId> {
        self.current_overlay
    }

    /// Scheduled and completed flip counts since the display was opened.
    /// Late completions of timed-out flips count as completed.
    pub fn flip_counts(&self) -> (u64, u64) {
        (self.flips.scheduled, self.flips.completed)
    }

    pub fn flip_timeout(&self) -> Duration {
        self.flip_timeout
    }

    pub fn set_flip_timeout(&mut self, timeout: Duration) {
        self.flip_timeout = timeout;
    }

    /// Put `buffer` on every output's primary plane.
    ///
    /// The first call mode-sets each output synchronously; later calls
    /// schedule a page flip per output and block until all of them complete
    /// or the flip timeout expires. The buffer becomes current either way.
    /// Per-output failures do not stop the remaining outputs and are
    /// returned together as [`Error::Presentation`]; if the wait also timed
    /// out, every output still waiting is listed there with an
    /// [`Error::Timeout`]. A timeout alone is returned as is.
    ///
    /// Only completions on the CRTCs flipped by this call count towards the
    /// wait. Completions of flips abandoned by an earlier timeout are
    /// consumed first and never satisfy a later present.
    pub fn present_primary(&mut self, buffer: &Buffer) -> Result<()> {
        let fb = buffer.framebuffer();
        let modeset = self.current.is_none();
        let mut failures = Vec::new();

        for output in &mut self.outputs {
            let result = if modeset {
                info!(
                    "setting mode {} on connector {} crtc {} at x={}",
                    output.mode, output.connector, output.crtc, output.x_offset
                );
                self.backend.set_crtc(
                    output.crtc,
                    fb,
                    output.x_offset,
                    0,
                    output.connector,
                    &output.mode,
                )
            } else {
                self.backend.page_flip(output.crtc, fb).map(|()| {
                    output.pending += 1;
                    self.flips.scheduled += 1;
                })
            };

            if let Err(error) = result {
                error!(
                    "could not post {} {fb} on crtc {}: {error}",
                    buffer.id(),
                    output.crtc
                );
                failures.push(OutputFailure {
                    connector: output.connector,
                    crtc: output.crtc,
                    error,
                });
            }
        }

        let waited = self.wait_for_flips();
        self.current = Some(buffer.id());
        if let Err(error) = waited {
            let stalled = self.abandon_pending();
            match error {
                Error::Timeout { waited, .. } if !failures.is_empty() => {
                    failures.extend(stalled.into_iter().map(|(connector, crtc, outstanding)| {
                        OutputFailure {
                            connector,
                            crtc,
                            error: Error::Timeout {
                                waited,
                                outstanding,
                            },
                        }
                    }));
                }
                error => return Err(error),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Presentation { failures })
        }
    }

    /// Show the (`x`, `y`, `w`, `h`) region of `buffer` on an overlay plane
    /// of every output, scaled to the output's full mode.
    ///
    /// Each output claims an overlay plane the first time it needs one and
    /// keeps it. Outputs without a usable plane are skipped and reported in
    /// the returned [`Error::Presentation`] after the others are updated.
    /// The buffer becomes the current overlay once any output shows it;
    /// outputs that failed keep showing what they showed before.
    pub fn present_overlay(&mut self, buffer: &Buffer, x: u32, y: u32, w: u32, h: u32) -> Result<()> {
        let fb = buffer.framebuffer();
        let src = SourceRect::from_pixels(x, y, w, h);
        let mut failures = Vec::new();

        for i in 0..self.outputs.len() {
            if self.outputs[i].overlay.is_none() {
                let pipe = self.outputs[i].pipe;
                self.outputs[i].overlay = self.claim_plane(pipe);
            }
            let output = &self.outputs[i];

            let Some(plane) = output.overlay else {
                warn!("no overlay plane available for crtc {}", output.crtc);
                failures.push(OutputFailure {
                    connector: output.connector,
                    crtc: output.crtc,
                    error: Error::Unsupported(format!(
                        "no overlay plane for pipe {}",
                        output.pipe
                    )),
                });
                continue;
            };

            let dst = Rect {
                x: 0,
                y: 0,
                width: output.mode.width,
                height: output.mode.height,
            };
            match self.backend.set_plane(plane, output.crtc, fb, dst, src) {
                Ok(()) => self.outputs[i].overlay_buffer = Some(buffer.id()),
                Err(error) => {
                    error!(
                        "could not show {} {fb} on plane {plane} crtc {}: {error}",
                        buffer.id(),
                        output.crtc
                    );
                    failures.push(OutputFailure {
                        connector: output.connector,
                        crtc: output.crtc,
                        error,
                    });
                }
            }
        }

        if self.overlay_shows(buffer.id()) {
            self.current_overlay = Some(buffer.id());
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Presentation { failures })
        }
    }

    /// Whether any output's overlay plane still scans out `id`.
    pub fn overlay_shows(&self, id: BufferId) -> bool {
        self.outputs.iter().any(|o| o.overlay_buffer == Some(id))
    }

    fn claim_plane(&mut self, pipe: usize) -> Option<u32> {
        let plane = self
            .planes
            .iter()
            .find(|p| p.supports_pipe(pipe) && !self.claimed.contains(&p.id))?;
        self.claimed.push(plane.id);
        debug!("claimed overlay plane {} for pipe {pipe}", plane.id);
        Some(plane.id)
    }

    /// Block until every flip scheduled by the current call has completed,
    /// bounded by the flip timeout.
    fn wait_for_flips(&mut self) -> Result<()> {
        let start = Instant::now();
        let deadline = start + self.flip_timeout;
        let mut retries = 0;

        while self.outstanding() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.timed_out(start));
            }

            let ready = {
                let mut fds = [PollFd::new(self.backend.event_source(), PollFlags::POLLIN)];
                poll(&mut fds, PollTimeout::from(poll_millis(remaining)))
            };
            match ready {
                Ok(0) => return Err(self.timed_out(start)),
                Ok(_) => {}
                Err(e @ (Errno::EAGAIN | Errno::EINTR)) => {
                    retries += 1;
                    if retries > MAX_WAIT_RETRIES {
                        return Err(Error::os("display", "poll")(e));
                    }
                    debug!("poll interrupted ({e}), retry {retries}/{MAX_WAIT_RETRIES}");
                    continue;
                }
                Err(e) => return Err(Error::os("display", "poll")(e)),
            }

            for event in self.backend.dispatch_events()? {
                let Some(output) = self.outputs.iter_mut().find(|o| o.crtc == event.crtc) else {
                    warn!("flip completion on unknown crtc {}", event.crtc);
                    continue;
                };
                // Per-CRTC completions arrive in submission order, so the
                // abandoned flips are always the oldest.
                if output.abandoned > 0 {
                    output.abandoned -= 1;
                    self.flips.completed += 1;
                    debug!(
                        "late completion of a timed-out flip: crtc {} seq {}",
                        event.crtc, event.sequence
                    );
                } else if output.pending > 0 {
                    output.pending -= 1;
                    self.flips.completed += 1;
                    debug!(
                        "flip complete: crtc {} seq {} ({}/{})",
                        event.crtc, event.sequence, self.flips.completed, self.flips.scheduled
                    );
                } else {
                    warn!("unexpected flip completion on crtc {}", event.crtc);
                }
            }
        }
        Ok(())
    }

    fn outstanding(&self) -> u64 {
        self.outputs.iter().map(|o| o.pending).sum()
    }

    fn timed_out(&self, start: Instant) -> Error {
        let error = Error::Timeout {
            waited: start.elapsed(),
            outstanding: self.outstanding(),
        };
        warn!("{error}");
        error
    }

    /// Give up on the flips the current call is still waiting for. Their
    /// completions are skipped when they arrive. Returns the connector,
    /// CRTC and flip count of every output that was still waiting.
    fn abandon_pending(&mut self) -> Vec<(u32, u32, u64)> {
        let mut stalled = Vec::new();
        for output in &mut self.outputs {
            if output.pending > 0 {
                output.abandoned += output.pending;
                stalled.push((output.connector, output.crtc, output.pending));
                output.pending = 0;
            }
        }
        stalled
    }
}

fn resolve_output<S: Scanout>(
    backend: &S,
    crtcs: &[u32],
    selection: &ModeSelection,
) -> Result<(u32, usize, Mode)> {
    let connector = backend.connector(selection.connector)?;
    let mode = find_mode(&connector, &selection.mode)?;
    let crtc = match selection.crtc {
        Some(crtc) => crtc,
        None => connector
            .crtc
            .or_else(|| {
                crtcs
                    .iter()
                    .enumerate()
                    .find(|(pipe, _)| *pipe < 32 && connector.possible_crtcs & (1 << pipe) != 0)
                    .map(|(_, &id)| id)
            })
            .ok_or_else(|| {
                Error::InvalidArgument(format!("no crtc can drive connector {}", connector.id))
            })?,
    };
    let pipe = crtcs
        .iter()
        .position(|&id| id == crtc)
        .ok_or_else(|| Error::InvalidArgument(format!("unknown crtc {crtc}")))?;
    Ok((crtc, pipe, mode))
}

fn find_mode(connector: &Connector, name: &str) -> Result<Mode> {
    if connector.modes.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "connector {} has no modes",
            connector.id
        )));
    }
    connector
        .modes
        .iter()
        .find(|m| m.name == name)
        .cloned()
        .ok_or_else(|| {
            let available: Vec<&str> = connector.modes.iter().map(|m| m.name.as_str()).collect();
            Error::InvalidArgument(format!(
                "mode '{name}' not found on connector {} (available: {})",
                connector.id,
                available.join(", ")
            ))
        })
}

// Longer waits are split by the caller's loop.
fn poll_millis(remaining: Duration) -> u16 {
    remaining.as_millis().clamp(1, u16::MAX as u128) as u16
}
