// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! DRM/KMS kernel ABI (include/uapi/drm/drm.h, drm_mode.h).

#![allow(non_camel_case_types)]

use nix::{ioctl_readwrite, ioctl_write_ptr};

const DRM_IOCTL_BASE: u8 = b'd';

pub const DRM_DISPLAY_MODE_LEN: usize = 32;
pub const DRM_MODE_PAGE_FLIP_EVENT: u32 = 0x01;
pub const DRM_EVENT_FLIP_COMPLETE: u32 = 0x02;
pub const DRM_MODE_CONNECTED: u32 = 1;
pub const DRM_CLOEXEC: u32 = libc::O_CLOEXEC as u32;
pub const DRM_RDWR: u32 = libc::O_RDWR as u32;

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_card_res {
    pub fb_id_ptr: u64,
    pub crtc_id_ptr: u64,
    pub connector_id_ptr: u64,
    pub encoder_id_ptr: u64,
    pub count_fbs: u32,
    pub count_crtcs: u32,
    pub count_connectors: u32,
    pub count_encoders: u32,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct drm_mode_modeinfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub type_: u32,
    pub name: [u8; DRM_DISPLAY_MODE_LEN],
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_get_connector {
    pub encoders_ptr: u64,
    pub modes_ptr: u64,
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub count_modes: u32,
    pub count_props: u32,
    pub count_encoders: u32,
    pub encoder_id: u32,
    pub connector_id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: u32,
    pub mm_width: u32,
    pub mm_height: u32,
    pub subpixel: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_get_encoder {
    pub encoder_id: u32,
    pub encoder_type: u32,
    pub crtc_id: u32,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_crtc {
    pub set_connectors_ptr: u64,
    pub count_connectors: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub gamma_size: u32,
    pub mode_valid: u32,
    pub mode: drm_mode_modeinfo,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_fb_cmd2 {
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub flags: u32,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub modifier: [u64; 4],
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_crtc_page_flip {
    pub crtc_id: u32,
    pub fb_id: u32,
    pub flags: u32,
    pub reserved: u32,
    pub user_data: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_get_plane_res {
    pub plane_id_ptr: u64,
    pub count_planes: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_get_plane {
    pub plane_id: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub possible_crtcs: u32,
    pub gamma_size: u32,
    pub count_format_types: u32,
    pub format_type_ptr: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_set_plane {
    pub plane_id: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub flags: u32,
    pub crtc_x: i32,
    pub crtc_y: i32,
    pub crtc_w: u32,
    pub crtc_h: u32,
    // Q16 source rectangle; note src_h precedes src_w in the ABI.
    pub src_x: u32,
    pub src_y: u32,
    pub src_h: u32,
    pub src_w: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_create_dumb {
    pub height: u32,
    pub width: u32,
    pub bpp: u32,
    pub flags: u32,
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_map_dumb {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_destroy_dumb {
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_prime_handle {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_gem_close {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_event {
    pub type_: u32,
    pub length: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_event_vblank {
    pub base: drm_event,
    pub user_data: u64,
    pub tv_sec: u32,
    pub tv_usec: u32,
    pub sequence: u32,
    pub crtc_id: u32,
}

ioctl_write_ptr!(drm_gem_close_ioctl, DRM_IOCTL_BASE, 0x09, drm_gem_close);
ioctl_readwrite!(drm_prime_handle_to_fd, DRM_IOCTL_BASE, 0x2d, drm_prime_handle);
ioctl_readwrite!(drm_prime_fd_to_handle, DRM_IOCTL_BASE, 0x2e, drm_prime_handle);
ioctl_readwrite!(drm_mode_getresources, DRM_IOCTL_BASE, 0xa0, drm_mode_card_res);
ioctl_readwrite!(drm_mode_setcrtc, DRM_IOCTL_BASE, 0xa2, drm_mode_crtc);
ioctl_readwrite!(drm_mode_getencoder, DRM_IOCTL_BASE, 0xa6, drm_mode_get_encoder);
ioctl_readwrite!(drm_mode_getconnector, DRM_IOCTL_BASE, 0xa7, drm_mode_get_connector);
ioctl_readwrite!(drm_mode_rmfb, DRM_IOCTL_BASE, 0xaf, libc::c_uint);
ioctl_readwrite!(drm_mode_page_flip, DRM_IOCTL_BASE, 0xb0, drm_mode_crtc_page_flip);
ioctl_readwrite!(drm_mode_create_dumb_ioctl, DRM_IOCTL_BASE, 0xb2, drm_mode_create_dumb);
ioctl_readwrite!(drm_mode_map_dumb_ioctl, DRM_IOCTL_BASE, 0xb3, drm_mode_map_dumb);
ioctl_readwrite!(drm_mode_destroy_dumb_ioctl, DRM_IOCTL_BASE, 0xb4, drm_mode_destroy_dumb);
ioctl_readwrite!(drm_mode_getplaneresources, DRM_IOCTL_BASE, 0xb5, drm_mode_get_plane_res);
ioctl_readwrite!(drm_mode_getplane, DRM_IOCTL_BASE, 0xb6, drm_mode_get_plane);
ioctl_readwrite!(drm_mode_setplane, DRM_IOCTL_BASE, 0xb7, drm_mode_set_plane);
ioctl_readwrite!(drm_mode_addfb2, DRM_IOCTL_BASE, 0xb8, drm_mode_fb_cmd2);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_abi_sizes() {
        assert_eq!(size_of::<drm_mode_modeinfo>(), 68);
        assert_eq!(size_of::<drm_mode_card_res>(), 64);
        assert_eq!(size_of::<drm_mode_get_connector>(), 80);
        assert_eq!(size_of::<drm_mode_crtc>(), 104);
        assert_eq!(size_of::<drm_mode_fb_cmd2>(), 104);
        assert_eq!(size_of::<drm_mode_set_plane>(), 48);
        assert_eq!(size_of::<drm_mode_get_plane>(), 32);
        assert_eq!(size_of::<drm_mode_crtc_page_flip>(), 24);
        assert_eq!(size_of::<drm_event_vblank>(), 32);
        assert_eq!(size_of::<drm_mode_create_dumb>(), 32);
    }
}
