// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Pixel format copy/convert between two arbitrary framebuffers.
//!
//! Takes both the source and destination [`PixelFormat`] as parameters, so
//! it can convert between any two formats rather than always converting
//! out of one fixed server format.

use crate::geometry::Rectangle;
use crate::protocol::PixelFormat;
use bytes::BytesMut;

/// Copies `rect` from `src` (with the given stride and format) into `dst`
/// (with its own stride and format) at destination offset `(dst_x, dst_y)`,
/// converting pixel format along the way.
///
/// `rect` is in source-buffer coordinates; it is not clipped here — callers
/// clip against both buffers' bounds first (see
/// [`Rectangle::clip_to_bounds`]).
///
/// Takes the fast path (a straight `memcpy` per scanline) when `src_format
/// == dst_format`; otherwise extracts and repacks each pixel.
///
/// # Panics
/// Panics if `rect` extends past either buffer given the supplied strides,
/// or if a format's `bytes_per_pixel` doesn't evenly divide its stride
/// region (caller error, not a runtime condition to recover from).
#[allow(clippy::too_many_arguments)]
pub fn copy_rect(
    src: &[u8],
    src_stride: usize,
    src_format: &PixelFormat,
    rect: Rectangle,
    dst: &mut [u8],
    dst_stride: usize,
    dst_format: &PixelFormat,
    dst_x: i32,
    dst_y: i32,
) {
    if rect.is_empty() {
        return;
    }
    let src_bpp = src_format.bytes_per_pixel();
    let dst_bpp = dst_format.bytes_per_pixel();
    let width = rect.width as usize;
    let height = rect.height as usize;
    let fast_path = pixel_formats_equal(src_format, dst_format);

    for row in 0..height {
        let src_y = rect.y as usize + row;
        let dst_row = dst_y as usize + row;
        let src_row_start = src_y * src_stride + rect.x as usize * src_bpp;
        let dst_row_start = dst_row * dst_stride + dst_x as usize * dst_bpp;

        if fast_path {
            let len = width * src_bpp;
            dst[dst_row_start..dst_row_start + len]
                .copy_from_slice(&src[src_row_start..src_row_start + len]);
            continue;
        }

        for col in 0..width {
            let src_off = src_row_start + col * src_bpp;
            let dst_off = dst_row_start + col * dst_bpp;
            let (r, g, b) = extract_rgb(&src[src_off..src_off + src_bpp], src_format);
            pack_pixel_into(&mut dst[dst_off..dst_off + dst_bpp], r, g, b, dst_format);
        }
    }
}

/// Converts a full buffer of packed `src_format` pixels into a freshly
/// allocated buffer of `dst_format` pixels. Used for whole-rectangle
/// encoding where callers already have a tightly-packed slice (no
/// stride gaps), e.g. rectangle contents about to be handed to an
/// `Encoding`.
#[must_use]
pub fn convert_packed(src: &[u8], src_format: &PixelFormat, dst_format: &PixelFormat) -> BytesMut {
    if pixel_formats_equal(src_format, dst_format) {
        return BytesMut::from(src);
    }
    let src_bpp = src_format.bytes_per_pixel();
    let dst_bpp = dst_format.bytes_per_pixel();
    assert_eq!(src.len() % src_bpp, 0, "source buffer not a whole number of pixels");
    let pixel_count = src.len() / src_bpp;
    let mut dst = BytesMut::with_capacity(pixel_count * dst_bpp);
    let mut scratch = [0u8; 4];
    for i in 0..pixel_count {
        let off = i * src_bpp;
        let (r, g, b) = extract_rgb(&src[off..off + src_bpp], src_format);
        pack_pixel_into(&mut scratch[..dst_bpp], r, g, b, dst_format);
        dst.extend_from_slice(&scratch[..dst_bpp]);
    }
    dst
}

fn extract_rgb(pixel: &[u8], format: &PixelFormat) -> (u8, u8, u8) {
    let pixel_value = match format.bits_per_pixel {
        8 => u32::from(pixel[0]),
        16 => {
            if format.big_endian {
                u32::from(u16::from_be_bytes([pixel[0], pixel[1]]))
            } else {
                u32::from(u16::from_le_bytes([pixel[0], pixel[1]]))
            }
        }
        24 => {
            if format.big_endian {
                (u32::from(pixel[0]) << 16) | (u32::from(pixel[1]) << 8) | u32::from(pixel[2])
            } else {
                (u32::from(pixel[2]) << 16) | (u32::from(pixel[1]) << 8) | u32::from(pixel[0])
            }
        }
        32 => {
            if format.big_endian {
                u32::from_be_bytes([pixel[0], pixel[1], pixel[2], pixel[3]])
            } else {
                u32::from_le_bytes([pixel[0], pixel[1], pixel[2], pixel[3]])
            }
        }
        _ => u32::from(pixel[0]),
    };

    let r_raw = (pixel_value >> format.red_shift) & u32::from(format.red_max);
    let g_raw = (pixel_value >> format.green_shift) & u32::from(format.green_max);
    let b_raw = (pixel_value >> format.blue_shift) & u32::from(format.blue_max);

    (
        scale_component(r_raw, format.red_max),
        scale_component(g_raw, format.green_max),
        scale_component(b_raw, format.blue_max),
    )
}

fn pack_pixel_into(dst: &mut [u8], r: u8, g: u8, b: u8, format: &PixelFormat) {
    let r_scaled = u32::from(downscale_component(r, format.red_max));
    let g_scaled = u32::from(downscale_component(g, format.green_max));
    let b_scaled = u32::from(downscale_component(b, format.blue_max));

    let pixel_value = (r_scaled << format.red_shift) | (g_scaled << format.green_shift) | (b_scaled << format.blue_shift);

    match format.bits_per_pixel {
        8 => dst[0] = pixel_value as u8,
        16 => {
            let bytes = if format.big_endian {
                (pixel_value as u16).to_be_bytes()
            } else {
                (pixel_value as u16).to_le_bytes()
            };
            dst[..2].copy_from_slice(&bytes);
        }
        24 => {
            let bytes = if format.big_endian {
                [(pixel_value >> 16) as u8, (pixel_value >> 8) as u8, pixel_value as u8]
            } else {
                [pixel_value as u8, (pixel_value >> 8) as u8, (pixel_value >> 16) as u8]
            };
            dst[..3].copy_from_slice(&bytes);
        }
        32 => {
            let bytes = if format.big_endian { pixel_value.to_be_bytes() } else { pixel_value.to_le_bytes() };
            dst[..4].copy_from_slice(&bytes);
        }
        _ => dst[0] = pixel_value as u8,
    }
}

#[inline]
fn scale_component(value: u32, max: u16) -> u8 {
    if max == 0 {
        return 0;
    }
    if max == 255 {
        return value as u8;
    }
    ((u64::from(value) * 255) / u64::from(max)) as u8
}

#[inline]
fn downscale_component(value: u8, max: u16) -> u16 {
    if max == 0 {
        return 0;
    }
    if max == 255 {
        return u16::from(value);
    }
    ((u32::from(value) * u32::from(max)) / 255) as u16
}

fn pixel_formats_equal(a: &PixelFormat, b: &PixelFormat) -> bool {
    a.bits_per_pixel == b.bits_per_pixel
        && a.depth == b.depth
        && (a.big_endian == b.big_endian || a.bits_per_pixel == 8)
        && a.true_colour == b.true_colour
        && (!a.true_colour
            || (a.red_max == b.red_max
                && a.green_max == b.green_max
                && a.blue_max == b.blue_max
                && a.red_shift == b.red_shift
                && a.green_shift == b.green_shift
                && a.blue_shift == b.blue_shift))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_formats_take_fast_path() {
        let fmt = PixelFormat::rgbx8888();
        let src = vec![10u8, 20, 30, 0, 40, 50, 60, 0];
        let mut dst = vec![0u8; 8];
        copy_rect(&src, 8, &fmt, Rectangle::new(0, 0, 2, 1), &mut dst, 8, &fmt, 0, 0);
        assert_eq!(dst, src);
    }

    #[test]
    fn converts_rgbx8888_to_rgb565() {
        let src_fmt = PixelFormat::rgbx8888();
        let dst_fmt = PixelFormat::rgb565();
        // pure red pixel: R=255 at shift 0
        let src = vec![255u8, 0, 0, 0];
        let mut dst = vec![0u8; 2];
        copy_rect(&src, 4, &src_fmt, Rectangle::new(0, 0, 1, 1), &mut dst, 2, &dst_fmt, 0, 0);
        let value = u16::from_le_bytes([dst[0], dst[1]]);
        assert_eq!(value, 0xF800);
    }

    #[test]
    fn convert_packed_round_trips_identity() {
        let fmt = PixelFormat::rgbx8888();
        let src = vec![1u8, 2, 3, 0, 4, 5, 6, 0];
        let dst = convert_packed(&src, &fmt, &fmt);
        assert_eq!(&dst[..], &src[..]);
    }

    #[test]
    fn copy_rect_offsets_into_larger_destination() {
        let fmt = PixelFormat::rgbx8888();
        let src = vec![7u8, 8, 9, 0];
        let mut dst = vec![0u8; 4 * 4]; // 2x2 buffer, 4bpp, stride 8
        copy_rect(&src, 4, &fmt, Rectangle::new(0, 0, 1, 1), &mut dst, 8, &fmt, 1, 1);
        assert_eq!(&dst[12..16], &[7, 8, 9, 0]);
    }
}
