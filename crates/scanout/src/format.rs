// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Pixel formats and their memory-plane layout.
//!
//! Formats are tagged with [`FourCharCode`] constants the same way capture
//! and conversion code across the stack does. The DRM/V4L2 wire value is
//! the little-endian packing of the same four characters and is derived on
//! demand with [`PixelFormat::fourcc`].

use std::fmt;
use std::str::FromStr;

use four_char_code::{four_char_code, FourCharCode};

use crate::error::{Error, Result};

/// Packed 32-bit ARGB.
pub const AR24: FourCharCode = four_char_code!("AR24");
/// Packed 32-bit XRGB.
pub const XR24: FourCharCode = four_char_code!("XR24");
/// Packed 4:2:2, Y0 U Y1 V.
pub const YUYV: FourCharCode = four_char_code!("YUYV");
/// Packed 4:2:2, U Y0 V Y1.
pub const UYVY: FourCharCode = four_char_code!("UYVY");
/// Semi-planar 4:2:0, luma plane plus interleaved CbCr plane.
pub const NV12: FourCharCode = four_char_code!("NV12");
/// Planar 4:2:0, luma plus separate Cb and Cr planes.
pub const I420: FourCharCode = four_char_code!("I420");

/// Maximum number of memory planes a buffer may carry.
pub const MAX_PLANES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Argb8888,
    Xrgb8888,
    Yuyv,
    Uyvy,
    Nv12,
    I420,
}

/// Geometry of one memory plane relative to the full image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Bits per pixel *of this plane's own pixel grid*.
    pub bpp: u32,
    /// Horizontal subsampling divisor.
    pub x_sub: u32,
    /// Vertical subsampling divisor.
    pub y_sub: u32,
}

impl PlaneLayout {
    const fn new(bpp: u32, x_sub: u32, y_sub: u32) -> Self {
        Self { bpp, x_sub, y_sub }
    }

    /// Plane dimensions for an image of `width` x `height`.
    pub fn dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        (width / self.x_sub, height / self.y_sub)
    }
}

const PACKED_32: &[PlaneLayout] = &[PlaneLayout::new(32, 1, 1)];
const PACKED_16: &[PlaneLayout] = &[PlaneLayout::new(16, 1, 1)];
// CbCr pairs are 16 bits wide on a half-resolution grid.
const SEMI_PLANAR_420: &[PlaneLayout] = &[PlaneLayout::new(8, 1, 1), PlaneLayout::new(16, 2, 2)];
const PLANAR_420: &[PlaneLayout] = &[
    PlaneLayout::new(8, 1, 1),
    PlaneLayout::new(8, 2, 2),
    PlaneLayout::new(8, 2, 2),
];

impl PixelFormat {
    pub const ALL: [PixelFormat; 6] = [
        PixelFormat::Argb8888,
        PixelFormat::Xrgb8888,
        PixelFormat::Yuyv,
        PixelFormat::Uyvy,
        PixelFormat::Nv12,
        PixelFormat::I420,
    ];

    pub fn code(&self) -> FourCharCode {
        match self {
            PixelFormat::Argb8888 => AR24,
            PixelFormat::Xrgb8888 => XR24,
            PixelFormat::Yuyv => YUYV,
            PixelFormat::Uyvy => UYVY,
            PixelFormat::Nv12 => NV12,
            PixelFormat::I420 => I420,
        }
    }

    fn chars(&self) -> [u8; 4] {
        match self {
            PixelFormat::Argb8888 => *b"AR24",
            PixelFormat::Xrgb8888 => *b"XR24",
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Uyvy => *b"UYVY",
            PixelFormat::Nv12 => *b"NV12",
            PixelFormat::I420 => *b"I420",
        }
    }

    /// The little-endian fourcc used by DRM and V4L2.
    pub fn fourcc(&self) -> u32 {
        u32::from_le_bytes(self.chars())
    }

    /// The code DRM and V4L2 drivers expect. Planar 4:2:0 is registered
    /// there as `YU12` rather than `I420`.
    pub fn device_fourcc(&self) -> u32 {
        match self {
            PixelFormat::I420 => u32::from_le_bytes(*b"YU12"),
            _ => self.fourcc(),
        }
    }

    /// Reverse of [`PixelFormat::fourcc`].
    pub fn from_fourcc(value: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.fourcc() == value)
            .ok_or_else(|| Error::UnsupportedFormat(format!("0x{value:08x}")))
    }

    pub fn planes(&self) -> &'static [PlaneLayout] {
        match self {
            PixelFormat::Argb8888 | PixelFormat::Xrgb8888 => PACKED_32,
            PixelFormat::Yuyv | PixelFormat::Uyvy => PACKED_16,
            PixelFormat::Nv12 => SEMI_PLANAR_420,
            PixelFormat::I420 => PLANAR_420,
        }
    }

    pub fn plane_count(&self) -> usize {
        self.planes().len()
    }

    pub fn is_yuv(&self) -> bool {
        !matches!(self, PixelFormat::Argb8888 | PixelFormat::Xrgb8888)
    }

    /// Checks that `width` x `height` is representable in this format.
    pub fn validate(&self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(format!(
                "zero-sized {self} buffer {width}x{height}"
            )));
        }
        let needs_even = self.planes().iter().any(|p| p.x_sub > 1 || p.y_sub > 1)
            || matches!(self, PixelFormat::Yuyv | PixelFormat::Uyvy);
        if needs_even && (width % 2 != 0 || (self.plane_count() > 1 && height % 2 != 0)) {
            return Err(Error::InvalidArgument(format!(
                "{self} requires even dimensions, got {width}x{height}"
            )));
        }
        Ok(())
    }
}

impl TryFrom<FourCharCode> for PixelFormat {
    type Error = Error;

    fn try_from(code: FourCharCode) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.code() == code)
            .ok_or_else(|| Error::UnsupportedFormat(code.to_string()))
    }
}

impl FromStr for PixelFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.chars().eq_ignore_ascii_case(s.as_bytes()))
            .ok_or_else(|| Error::UnsupportedFormat(s.to_string()))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(std::str::from_utf8(&self.chars()).unwrap_or("????"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_is_little_endian() {
        assert_eq!(
            PixelFormat::Nv12.fourcc(),
            b'N' as u32 | (b'V' as u32) << 8 | (b'1' as u32) << 16 | (b'2' as u32) << 24
        );
        for format in PixelFormat::ALL {
            assert_eq!(PixelFormat::from_fourcc(format.fourcc()).unwrap(), format);
        }
    }

    #[test]
    fn test_four_char_code_conversion() {
        assert_eq!(PixelFormat::try_from(NV12).unwrap(), PixelFormat::Nv12);
        assert_eq!(PixelFormat::try_from(YUYV).unwrap(), PixelFormat::Yuyv);
        assert_eq!(PixelFormat::try_from(AR24).unwrap(), PixelFormat::Argb8888);
        assert!(PixelFormat::try_from(four_char_code!("XXXX")).is_err());
    }

    #[test]
    fn test_parse_from_str() {
        assert_eq!("NV12".parse::<PixelFormat>().unwrap(), PixelFormat::Nv12);
        assert_eq!("uyvy".parse::<PixelFormat>().unwrap(), PixelFormat::Uyvy);
        assert!("RGB3".parse::<PixelFormat>().is_err());
        assert!("NV1".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_plane_policy() {
        assert_eq!(PixelFormat::Xrgb8888.plane_count(), 1);
        assert_eq!(PixelFormat::Yuyv.plane_count(), 1);

        // semi-planar: full-res luma plus half-res interleaved chroma
        let nv12 = PixelFormat::Nv12.planes();
        assert_eq!(nv12.len(), 2);
        assert_eq!(nv12[0].dimensions(1280, 720), (1280, 720));
        assert_eq!(nv12[1].dimensions(1280, 720), (640, 360));
        assert_eq!(nv12[1].bpp, 16);

        // planar: full-res luma plus two quarter-area chroma planes
        let i420 = PixelFormat::I420.planes();
        assert_eq!(i420.len(), 3);
        assert_eq!(i420[1].dimensions(640, 480), (320, 240));
        assert_eq!(i420[2].dimensions(640, 480), (320, 240));
        assert!(i420.iter().all(|p| p.bpp == 8));
    }

    #[test]
    fn test_validate() {
        assert!(PixelFormat::Nv12.validate(1280, 720).is_ok());
        assert!(PixelFormat::Nv12.validate(1279, 720).is_err());
        assert!(PixelFormat::Xrgb8888.validate(0, 720).is_err());
        assert!(PixelFormat::Xrgb8888.validate(1279, 721).is_ok());
    }

    #[test]
    fn test_device_fourcc() {
        assert_eq!(PixelFormat::I420.device_fourcc(), u32::from_le_bytes(*b"YU12"));
        assert_eq!(PixelFormat::Nv12.device_fourcc(), PixelFormat::Nv12.fourcc());
        assert_eq!(PixelFormat::Xrgb8888.device_fourcc(), 0x3432_5258);
    }

    #[test]
    fn test_display() {
        assert_eq!(PixelFormat::I420.to_string(), "I420");
        assert_eq!(PixelFormat::Argb8888.to_string(), "AR24");
    }
}
