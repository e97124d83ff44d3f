// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::mem::size_of;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::Arc;

use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::{
    Connector, FlipEvent, FramebufferDesc, FramebufferId, Mode, OverlayPlane, Rect, Scanout,
    SourceRect,
};
use crate::device::DrmDevice;
use crate::error::{Error, Result};
use crate::format::MAX_PLANES;
use crate::sys::drm;

/// Resource lists can change between the count query and the fetch; give up
/// after this many attempts.
const MAX_QUERY_ATTEMPTS: usize = 4;

/// Linux DRM/KMS scanout.
///
/// Buffers are imported by dma-buf descriptor through PRIME and registered
/// with `ADDFB2`. Flip completions are read from the device descriptor.
pub struct KmsScanout {
    device: Arc<DrmDevice>,
    crtcs: Vec<u32>,
    connectors: Vec<u32>,
    // GEM handles imported for each framebuffer, closed on removal.
    handles: HashMap<u32, Vec<u32>>,
}

impl KmsScanout {
    pub fn new(device: Arc<DrmDevice>) -> Result<Self> {
        let (crtcs, connectors) = query_resources(device.as_fd().as_raw_fd())?;
        debug!(
            "{}: crtcs {crtcs:?}, connectors {connectors:?}",
            device.path().display()
        );
        Ok(Self {
            device,
            crtcs,
            connectors,
            handles: HashMap::new(),
        })
    }

    pub fn device(&self) -> &Arc<DrmDevice> {
        &self.device
    }

    fn fd(&self) -> RawFd {
        self.device.as_fd().as_raw_fd()
    }

    fn encoder(&self, id: u32) -> Result<drm::drm_mode_get_encoder> {
        let mut enc = drm::drm_mode_get_encoder {
            encoder_id: id,
            ..Default::default()
        };
        // SAFETY: `enc` matches struct drm_mode_get_encoder.
        unsafe { drm::drm_mode_getencoder(self.fd(), &mut enc) }
            .map_err(Error::os("kms", "DRM_IOCTL_MODE_GETENCODER"))?;
        Ok(enc)
    }

    fn close_handles(&self, handles: &[u32]) {
        for &handle in handles {
            if let Err(e) = self.device.gem_close(handle) {
                warn!("failed to close GEM handle {handle}: {e}");
            }
        }
    }
}

/// CRTC and connector ids, retried while hotplug changes the counts.
fn query_resources(fd: RawFd) -> Result<(Vec<u32>, Vec<u32>)> {
    for _ in 0..MAX_QUERY_ATTEMPTS {
        let mut res = drm::drm_mode_card_res::default();
        // SAFETY: counts-only query, all array pointers are null.
        unsafe { drm::drm_mode_getresources(fd, &mut res) }
            .map_err(Error::os("kms", "DRM_IOCTL_MODE_GETRESOURCES"))?;

        let (n_crtcs, n_connectors) = (res.count_crtcs, res.count_connectors);
        let mut crtcs = vec![0u32; n_crtcs as usize];
        let mut connectors = vec![0u32; n_connectors as usize];
        let mut res = drm::drm_mode_card_res {
            crtc_id_ptr: crtcs.as_mut_ptr() as u64,
            count_crtcs: n_crtcs,
            connector_id_ptr: connectors.as_mut_ptr() as u64,
            count_connectors: n_connectors,
            ..Default::default()
        };
        // SAFETY: both arrays hold as many entries as their count fields and
        // outlive the call.
        unsafe { drm::drm_mode_getresources(fd, &mut res) }
            .map_err(Error::os("kms", "DRM_IOCTL_MODE_GETRESOURCES"))?;
        if res.count_crtcs == n_crtcs && res.count_connectors == n_connectors {
            return Ok((crtcs, connectors));
        }
    }
    Err(Error::os("kms", "DRM_IOCTL_MODE_GETRESOURCES")(Errno::EAGAIN))
}

impl Scanout for KmsScanout {
    fn name(&self) -> &'static str {
        "kms"
    }

    fn crtcs(&self) -> Result<Vec<u32>> {
        Ok(self.crtcs.clone())
    }

    fn connectors(&self) -> Result<Vec<u32>> {
        Ok(self.connectors.clone())
    }

    fn connector(&self, id: u32) -> Result<Connector> {
        for _ in 0..MAX_QUERY_ATTEMPTS {
            let mut conn = drm::drm_mode_get_connector {
                connector_id: id,
                ..Default::default()
            };
            // SAFETY: counts-only query, all array pointers are null.
            unsafe { drm::drm_mode_getconnector(self.fd(), &mut conn) }
                .map_err(Error::os("kms", "DRM_IOCTL_MODE_GETCONNECTOR"))?;

            let (n_modes, n_encoders, n_props) =
                (conn.count_modes, conn.count_encoders, conn.count_props);
            let mut modes = vec![drm::drm_mode_modeinfo::default(); n_modes as usize];
            let mut encoders = vec![0u32; n_encoders as usize];
            let mut props = vec![0u32; n_props as usize];
            let mut values = vec![0u64; n_props as usize];
            let mut conn = drm::drm_mode_get_connector {
                connector_id: id,
                modes_ptr: modes.as_mut_ptr() as u64,
                count_modes: n_modes,
                encoders_ptr: encoders.as_mut_ptr() as u64,
                count_encoders: n_encoders,
                props_ptr: props.as_mut_ptr() as u64,
                prop_values_ptr: values.as_mut_ptr() as u64,
                count_props: n_props,
                ..Default::default()
            };
            // SAFETY: every array holds as many entries as its count field
            // and outlives the call.
            unsafe { drm::drm_mode_getconnector(self.fd(), &mut conn) }
                .map_err(Error::os("kms", "DRM_IOCTL_MODE_GETCONNECTOR"))?;
            if conn.count_modes != n_modes
                || conn.count_encoders != n_encoders
                || conn.count_props != n_props
            {
                trace!("connector {id} changed while querying, retrying");
                continue;
            }

            let mut crtc = None;
            let mut possible_crtcs = 0;
            if conn.encoder_id != 0 {
                let enc = self.encoder(conn.encoder_id)?;
                crtc = (enc.crtc_id != 0).then_some(enc.crtc_id);
                possible_crtcs = enc.possible_crtcs;
            }
            if possible_crtcs == 0 {
                for &encoder in &encoders {
                    possible_crtcs |= self.encoder(encoder)?.possible_crtcs;
                }
            }

            return Ok(Connector {
                id,
                connected: conn.connection == drm::DRM_MODE_CONNECTED,
                crtc,
                possible_crtcs,
                modes: modes.into_iter().map(Mode::from_info).collect(),
            });
        }
        Err(Error::os("kms", "DRM_IOCTL_MODE_GETCONNECTOR")(Errno::EAGAIN))
    }

    fn overlay_planes(&self) -> Result<Vec<OverlayPlane>> {
        let mut ids = Vec::new();
        for attempt in 0..MAX_QUERY_ATTEMPTS {
            let mut res = drm::drm_mode_get_plane_res::default();
            // SAFETY: counts-only query.
            unsafe { drm::drm_mode_getplaneresources(self.fd(), &mut res) }
                .map_err(Error::os("kms", "DRM_IOCTL_MODE_GETPLANERESOURCES"))?;
            let count = res.count_planes;
            ids = vec![0u32; count as usize];
            let mut res = drm::drm_mode_get_plane_res {
                plane_id_ptr: ids.as_mut_ptr() as u64,
                count_planes: count,
            };
            // SAFETY: `ids` holds `count_planes` entries.
            unsafe { drm::drm_mode_getplaneresources(self.fd(), &mut res) }
                .map_err(Error::os("kms", "DRM_IOCTL_MODE_GETPLANERESOURCES"))?;
            if res.count_planes == count {
                break;
            }
            if attempt + 1 == MAX_QUERY_ATTEMPTS {
                return Err(Error::os("kms", "DRM_IOCTL_MODE_GETPLANERESOURCES")(Errno::EAGAIN));
            }
        }

        ids.into_iter()
            .map(|id| {
                let mut plane = drm::drm_mode_get_plane {
                    plane_id: id,
                    ..Default::default()
                };
                // SAFETY: format list not requested, pointer stays null.
                unsafe { drm::drm_mode_getplane(self.fd(), &mut plane) }
                    .map_err(Error::os("kms", "DRM_IOCTL_MODE_GETPLANE"))?;
                Ok(OverlayPlane {
                    id,
                    possible_crtcs: plane.possible_crtcs,
                })
            })
            .collect()
    }

    fn add_framebuffer(&mut self, desc: &FramebufferDesc<'_>) -> Result<FramebufferId> {
        if desc.planes.is_empty() || desc.planes.len() > MAX_PLANES {
            return Err(Error::InvalidArgument(format!(
                "framebuffer needs 1-{MAX_PLANES} planes, got {}",
                desc.planes.len()
            )));
        }

        let mut cmd = drm::drm_mode_fb_cmd2 {
            width: desc.width,
            height: desc.height,
            pixel_format: desc.format.device_fourcc(),
            ..Default::default()
        };
        let mut handles: Vec<u32> = Vec::with_capacity(desc.planes.len());
        for (i, plane) in desc.planes.iter().enumerate() {
            let handle = match self.device.prime_fd_to_handle(plane.fd) {
                Ok(handle) => handle,
                Err(e) => {
                    self.close_handles(&handles);
                    return Err(e);
                }
            };
            if !handles.contains(&handle) {
                handles.push(handle);
            }
            cmd.handles[i] = handle;
            cmd.pitches[i] = plane.pitch;
            cmd.offsets[i] = plane.offset;
        }

        // SAFETY: `cmd` matches struct drm_mode_fb_cmd2.
        if let Err(e) = unsafe { drm::drm_mode_addfb2(self.fd(), &mut cmd) } {
            self.close_handles(&handles);
            return Err(Error::os("kms", "DRM_IOCTL_MODE_ADDFB2")(e));
        }

        debug!(
            "kms: fb{} {}x{} {} handles {:?}",
            cmd.fb_id, desc.width, desc.height, desc.format, handles
        );
        self.handles.insert(cmd.fb_id, handles);
        Ok(FramebufferId(cmd.fb_id))
    }

    fn remove_framebuffer(&mut self, fb: FramebufferId) -> Result<()> {
        let mut id: libc::c_uint = fb.0;
        // SAFETY: DRM_IOCTL_MODE_RMFB takes a pointer to the framebuffer id.
        unsafe { drm::drm_mode_rmfb(self.fd(), &mut id) }
            .map_err(Error::os("kms", "DRM_IOCTL_MODE_RMFB"))?;

        if let Some(handles) = self.handles.remove(&fb.0) {
            // Planes shared with a still registered framebuffer keep their handle.
            let unused: Vec<u32> = handles
                .into_iter()
                .filter(|h| !self.handles.values().any(|other| other.contains(h)))
                .collect();
            self.close_handles(&unused);
        }
        Ok(())
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
        let connectors = [connector];
        let mut cmd = drm::drm_mode_crtc {
            set_connectors_ptr: connectors.as_ptr() as u64,
            count_connectors: 1,
            crtc_id: crtc,
            fb_id: fb.0,
            x,
            y,
            mode_valid: 1,
            mode: mode.info,
            ..Default::default()
        };
        // SAFETY: `connectors` outlives the call and holds one id.
        unsafe { drm::drm_mode_setcrtc(self.fd(), &mut cmd) }
            .map_err(Error::os("kms", "DRM_IOCTL_MODE_SETCRTC"))?;
        Ok(())
    }

    fn page_flip(&mut self, crtc: u32, fb: FramebufferId) -> Result<()> {
        let mut flip = drm::drm_mode_crtc_page_flip {
            crtc_id: crtc,
            fb_id: fb.0,
            flags: drm::DRM_MODE_PAGE_FLIP_EVENT,
            reserved: 0,
            user_data: crtc as u64,
        };
        // SAFETY: `flip` matches struct drm_mode_crtc_page_flip.
        unsafe { drm::drm_mode_page_flip(self.fd(), &mut flip) }
            .map_err(Error::os("kms", "DRM_IOCTL_MODE_PAGE_FLIP"))?;
        trace!("kms: flip crtc {crtc} -> {fb}");
        Ok(())
    }

    fn set_plane(
        &mut self,
        plane: u32,
        crtc: u32,
        fb: FramebufferId,
        dst: Rect,
        src: SourceRect,
    ) -> Result<()> {
        let mut cmd = drm::drm_mode_set_plane {
            plane_id: plane,
            crtc_id: crtc,
            fb_id: fb.0,
            flags: 0,
            crtc_x: dst.x,
            crtc_y: dst.y,
            crtc_w: dst.width,
            crtc_h: dst.height,
            src_x: src.x,
            src_y: src.y,
            src_h: src.height,
            src_w: src.width,
        };
        // SAFETY: `cmd` matches struct drm_mode_set_plane.
        unsafe { drm::drm_mode_setplane(self.fd(), &mut cmd) }
            .map_err(Error::os("kms", "DRM_IOCTL_MODE_SETPLANE"))?;
        Ok(())
    }

    fn event_source(&self) -> BorrowedFd<'_> {
        self.device.as_fd()
    }

    fn dispatch_events(&mut self) -> Result<Vec<FlipEvent>> {
        let mut fds = [PollFd::new(self.device.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(0) | Err(Errno::EINTR) => return Ok(Vec::new()),
            Ok(_) => {}
            Err(e) => return Err(Error::os("kms", "poll")(e)),
        }

        let mut buf = [0u8; 1024];
        // SAFETY: `buf` is valid for writes of its full length.
        let n = unsafe { libc::read(self.fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return match Errno::last() {
                Errno::EAGAIN | Errno::EINTR => Ok(Vec::new()),
                e => Err(Error::os("kms", "read events")(e)),
            };
        }
        Ok(parse_events(&buf[..n as usize]))
    }
}

/// Decode the flip-complete records in a buffer read from a DRM device.
fn parse_events(buf: &[u8]) -> Vec<FlipEvent> {
    let mut events = Vec::new();
    let mut offset = 0;
    while offset + size_of::<drm::drm_event>() <= buf.len() {
        // SAFETY: bounds checked above; the kernel does not align records.
        let header: drm::drm_event =
            unsafe { std::ptr::read_unaligned(buf[offset..].as_ptr().cast()) };
        let len = header.length as usize;
        if len < size_of::<drm::drm_event>() || offset + len > buf.len() {
            warn!("truncated DRM event ({len} bytes at {offset})");
            break;
        }
        if header.type_ == drm::DRM_EVENT_FLIP_COMPLETE && len >= size_of::<drm::drm_event_vblank>()
        {
            // SAFETY: the record is at least one drm_event_vblank long.
            let vblank: drm::drm_event_vblank =
                unsafe { std::ptr::read_unaligned(buf[offset..].as_ptr().cast()) };
            events.push(FlipEvent {
                crtc: if vblank.crtc_id != 0 {
                    vblank.crtc_id
                } else {
                    vblank.user_data as u32
                },
                sequence: vblank.sequence,
                tv_sec: vblank.tv_sec,
                tv_usec: vblank.tv_usec,
            });
        } else {
            trace!("ignoring DRM event type {}", header.type_);
        }
        offset += len;
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(type_: u32, crtc_id: u32, user_data: u64, sequence: u32) -> Vec<u8> {
        let event = drm::drm_event_vblank {
            base: drm::drm_event {
                type_,
                length: size_of::<drm::drm_event_vblank>() as u32,
            },
            user_data,
            tv_sec: 7,
            tv_usec: 500,
            sequence,
            crtc_id,
        };
        // SAFETY: plain-old-data struct viewed as bytes.
        let bytes = unsafe {
            std::slice::from_raw_parts(
                (&event as *const drm::drm_event_vblank).cast::<u8>(),
                size_of::<drm::drm_event_vblank>(),
            )
        };
        bytes.to_vec()
    }

    #[test]
    fn test_parse_flip_events() {
        let mut buf = record(drm::DRM_EVENT_FLIP_COMPLETE, 40, 0, 3);
        buf.extend(record(0x01, 41, 0, 4)); // vblank, not a flip
        buf.extend(record(drm::DRM_EVENT_FLIP_COMPLETE, 0, 41, 5));

        let events = parse_events(&buf);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].crtc, 40);
        assert_eq!(events[0].sequence, 3);
        assert_eq!(events[0].tv_sec, 7);
        // Older kernels leave crtc_id zero; the crtc travels in user_data.
        assert_eq!(events[1].crtc, 41);
        assert_eq!(events[1].sequence, 5);
    }

    #[test]
    fn test_parse_truncated_events() {
        let buf = record(drm::DRM_EVENT_FLIP_COMPLETE, 40, 0, 1);
        assert!(parse_events(&buf[..12]).is_empty());
        assert!(parse_events(&[]).is_empty());
    }

    #[test]
    #[ignore] // Requires DRM device
    fn test_kms_enumerates_crtcs() {
        let _ = env_logger::try_init();
        let device = Arc::new(DrmDevice::open_first_card().unwrap());
        let kms = KmsScanout::new(device).unwrap();
        assert!(!kms.crtcs().unwrap().is_empty());
        for id in kms.connectors().unwrap() {
            assert_eq!(kms.connector(id).unwrap().id, id);
        }
    }
}
