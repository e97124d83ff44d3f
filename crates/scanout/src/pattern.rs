// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Moving test pattern of coloured tiles.
//!
//! The pattern is a ramp of 64 pixel tiles whose colour depends on
//! `(n + x + y) / width` and `(n + x + y) % width`; advancing `n` each frame
//! scrolls it diagonally, which makes tearing and dropped flips easy to see.

use log::warn;

use crate::buffer::{Buffer, Plane};
use crate::error::Result;
use crate::format::PixelFormat;

/// Paint frame `n` of the pattern into every plane of `buffer`, inside a CPU
/// write window.
pub fn fill(buffer: &mut Buffer, n: u32) -> Result<()> {
    let format = buffer.format();
    let (width, height) = (buffer.width(), buffer.height());
    buffer.write_with(|planes| match (format, planes) {
        (PixelFormat::Argb8888 | PixelFormat::Xrgb8888, [rgb]) => {
            fill_rgb32(rgb, n, width, height)
        }
        (PixelFormat::Yuyv, [packed]) => fill_422(packed, n, width, height, [0, 1, 2, 3]),
        (PixelFormat::Uyvy, [packed]) => fill_422(packed, n, width, height, [1, 0, 3, 2]),
        (PixelFormat::Nv12, [luma, chroma]) => fill_nv12(luma, chroma, n, width, height),
        (PixelFormat::I420, [luma, cb, cr]) => fill_i420(luma, cb, cr, n, width, height),
        (_, other) => warn!("no pattern for {format} with {} plane(s)", other.len()),
    })
}

fn color(n: u32, x: u32, y: u32, width: u32) -> u32 {
    let t = n.wrapping_add(x).wrapping_add(y);
    let (quot, rem) = (t / width, t % width);
    0x0013_0502u32
        .wrapping_mul(quot >> 6)
        .wrapping_add(0x000a_1120u32.wrapping_mul(rem >> 6))
}

/// BT.601 luma and chroma of a packed 0x00RRGGBB colour.
fn to_yuv(rgb: u32) -> (u8, u8, u8) {
    let [b, g, r, _] = rgb.to_le_bytes();
    let (r, g, b) = (f64::from(r), f64::from(g), f64::from(b));
    let y = (0.299 * r + 0.587 * g + 0.114 * b) as u8;
    let u = ((b - f64::from(y)) * 0.565 + 128.0) as u8;
    let v = ((r - f64::from(y)) * 0.713 + 128.0) as u8;
    (y, u, v)
}

fn fill_rgb32(plane: &mut Plane, n: u32, width: u32, height: u32) {
    let pitch = plane.pitch() as usize;
    let data = plane.as_mut_slice();
    for y in 0..height {
        let row = &mut data[y as usize * pitch..][..width as usize * 4];
        for (x, px) in row.chunks_exact_mut(4).enumerate() {
            px.copy_from_slice(&color(n, x as u32, y, width).to_le_bytes());
        }
    }
}

/// Packed 4:2:2; `order` gives the byte positions of Y0, U, Y1, V.
fn fill_422(plane: &mut Plane, n: u32, width: u32, height: u32, order: [usize; 4]) {
    let pitch = plane.pitch() as usize;
    let data = plane.as_mut_slice();
    for y in 0..height {
        let row = &mut data[y as usize * pitch..][..width as usize * 2];
        for (pair, px) in row.chunks_exact_mut(4).enumerate() {
            let (luma, u, v) = to_yuv(color(n, pair as u32 * 2, y, width));
            px[order[0]] = luma;
            px[order[1]] = u;
            px[order[2]] = luma;
            px[order[3]] = v;
        }
    }
}

/// Fills the luma plane in 2x2 blocks and calls `chroma(x, y, u, v)` once per
/// block with the block's chroma-plane coordinates.
fn fill_420<F>(luma: &mut Plane, n: u32, width: u32, height: u32, mut chroma: F)
where
    F: FnMut(usize, usize, u8, u8),
{
    let pitch = luma.pitch() as usize;
    let data = luma.as_mut_slice();
    for y in (0..height as usize).step_by(2) {
        for x in (0..width as usize).step_by(2) {
            let (l, u, v) = to_yuv(color(n, x as u32, y as u32, width));
            for row in [y, y + 1] {
                data[row * pitch + x] = l;
                data[row * pitch + x + 1] = l;
            }
            chroma(x / 2, y / 2, u, v);
        }
    }
}

fn fill_nv12(luma: &mut Plane, chroma: &mut Plane, n: u32, width: u32, height: u32) {
    let pitch = chroma.pitch() as usize;
    let uv = chroma.as_mut_slice();
    fill_420(luma, n, width, height, |x, y, u, v| {
        uv[y * pitch + x * 2] = u;
        uv[y * pitch + x * 2 + 1] = v;
    });
}

fn fill_i420(luma: &mut Plane, cb: &mut Plane, cr: &mut Plane, n: u32, width: u32, height: u32) {
    let (cb_pitch, cr_pitch) = (cb.pitch() as usize, cr.pitch() as usize);
    let (cb, cr) = (cb.as_mut_slice(), cr.as_mut_slice());
    fill_420(luma, n, width, height, |x, y, u, v| {
        cb[y * cb_pitch + x] = u;
        cr[y * cr_pitch + x] = v;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{HostAllocator, TilingMode};
    use crate::buffer::BufferId;
    use crate::display::{HeadlessScanout, Mode};
    use crate::pool::BufferPool;

    fn single(format: PixelFormat, width: u32, height: u32) -> (HeadlessScanout, BufferPool) {
        let mut scanout = HeadlessScanout::new()
            .unwrap()
            .with_output(1, 1, vec![Mode::new("m", 64, 64, 60)]);
        let pool = BufferPool::allocate(
            &HostAllocator::new(),
            &mut scanout,
            1,
            format,
            width,
            height,
            TilingMode::Linear,
        )
        .unwrap();
        (scanout, pool)
    }

    #[test]
    fn test_color_ramp() {
        assert_eq!(color(0, 0, 0, 128), 0);
        assert_eq!(color(0, 64, 0, 128), 0x000a_1120);
        assert_eq!(color(0, 0, 128, 128), 0);
        assert_eq!(color(64 * 128, 0, 0, 128), 0x0013_0502);
    }

    #[test]
    fn test_grey_has_neutral_chroma() {
        let (y, u, v) = to_yuv(0x0080_8080);
        assert!(y.abs_diff(128) <= 1, "{y}");
        assert!(u.abs_diff(128) <= 1, "{u}");
        assert!(v.abs_diff(128) <= 1, "{v}");
    }

    #[test]
    fn test_rgb_fill() {
        let (_s, mut pool) = single(PixelFormat::Xrgb8888, 128, 4);
        let buffer = pool.get_mut(BufferId(0)).unwrap();
        fill(buffer, 0).unwrap();
        let data = buffer.planes()[0].as_slice();
        assert_eq!(&data[0..4], &[0, 0, 0, 0]);
        assert_eq!(&data[64 * 4..64 * 4 + 4], &0x000a_1120u32.to_le_bytes());
    }

    #[test]
    fn test_packed_422_byte_order() {
        let (_s, mut pool) = single(PixelFormat::Uyvy, 128, 2);
        let buffer = pool.get_mut(BufferId(0)).unwrap();
        fill(buffer, 0).unwrap();
        let (y, u, v) = to_yuv(color(0, 64, 0, 128));
        let px = &buffer.planes()[0].as_slice()[64 * 2..64 * 2 + 4];
        assert_eq!(px, &[u, y, v, y]);
    }

    #[test]
    fn test_planar_420_chroma_placement() {
        let (_s, mut pool) = single(PixelFormat::I420, 128, 4);
        let buffer = pool.get_mut(BufferId(0)).unwrap();
        fill(buffer, 0).unwrap();
        let (y, u, v) = to_yuv(color(0, 64, 2, 128));
        let planes = buffer.planes();
        assert_eq!(planes[0].as_slice()[3 * 128 + 65], y);
        assert_eq!(planes[1].as_slice()[64 + 32], u);
        assert_eq!(planes[2].as_slice()[64 + 32], v);
    }

    #[test]
    fn test_nv12_interleaves_chroma() {
        let (_s, mut pool) = single(PixelFormat::Nv12, 128, 2);
        let buffer = pool.get_mut(BufferId(0)).unwrap();
        fill(buffer, 5).unwrap();
        let (_, u, v) = to_yuv(color(5, 64, 0, 128));
        let uv = buffer.planes()[1].as_slice();
        assert_eq!(&uv[64..66], &[u, v]);
    }
}
