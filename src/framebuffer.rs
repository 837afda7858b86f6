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

//! The server-side framebuffer: a named, pixel-format-tagged pixel buffer
//! guarded by a `sync_root` lock, plus the `CapturedFramebuffer` a
//! [`crate::capture::CaptureSource`] hands back on every capture.

use crate::convert::copy_rect;
use crate::geometry::Rectangle;
use crate::protocol::PixelFormat;
use bytes::Bytes;
use tokio::sync::RwLock;

/// A rectangle that moved within the framebuffer without changing content —
/// e.g. a window drag. `src` is the prior location; `dst_x`/`dst_y` is
/// where it now sits. Lets the cache emit a cheap `CopyRect` rather than
/// re-encoding pixels the client already has.
#[derive(Debug, Clone, Copy)]
pub struct MoveRect {
    /// The rectangle's previous location.
    pub src: Rectangle,
    /// New X position.
    pub dst_x: i32,
    /// New Y position.
    pub dst_y: i32,
}

/// Cursor position/visibility, reported alongside a capture so the cache
/// can decide whether a `Cursor` pseudo-rectangle needs to go out.
#[derive(Debug, Clone, Copy)]
pub struct PointerHint {
    /// Cursor X position in framebuffer coordinates.
    pub x: u16,
    /// Cursor Y position in framebuffer coordinates.
    pub y: u16,
    /// Whether the cursor is currently visible on this surface.
    pub visible: bool,
}

/// Hints a [`crate::capture::CaptureSource`] can optionally attach to a
/// capture to avoid a full diff. A plain `Option` field on
/// `CapturedFramebuffer` — the cache discovers it by checking whether the
/// field is `Some`, a capability query rather than a trait object or
/// subtype.
#[derive(Debug, Clone, Default)]
pub struct CaptureHints {
    /// Regions that moved without changing content.
    pub moved_rects: Vec<MoveRect>,
    /// Regions whose content changed and must be re-encoded.
    pub dirty_rects: Vec<Rectangle>,
    /// Current pointer position/visibility, if known.
    pub pointer: Option<PointerHint>,
}

/// One frame produced by a [`crate::capture::CaptureSource`].
#[derive(Debug, Clone)]
pub struct CapturedFramebuffer {
    /// Frame width in pixels.
    pub width: u16,
    /// Frame height in pixels.
    pub height: u16,
    /// The pixel format `data` is packed in.
    pub pixel_format: PixelFormat,
    /// Row stride in bytes; may exceed `width * bytes_per_pixel` for
    /// padded capture buffers.
    pub stride: usize,
    /// Tightly-addressable pixel data, `stride * height` bytes.
    pub data: Bytes,
    /// Optional hints the cache can use instead of a full diff.
    pub hints: Option<CaptureHints>,
}

struct Inner {
    width: u16,
    height: u16,
    pixel_format: PixelFormat,
    stride: usize,
    buffer: Vec<u8>,
}

/// The server's own copy of the framebuffer: the pixels last sent to (or
/// about to be sent to) clients, independent of whatever format the
/// capture source produced them in.
///
/// All mutable state lives behind `sync_root`; the lock order is
/// `FramebufferUpdateRequestLock` → `sync_root` → `streamLock` — code
/// that holds the update-request lock is the only code allowed to also
/// take `sync_root`.
pub struct Framebuffer {
    /// Desktop/session name (immutable after construction).
    pub name: String,
    sync_root: RwLock<Inner>,
}

impl Framebuffer {
    /// Creates an empty framebuffer of the given dimensions and format,
    /// zero-filled.
    #[must_use]
    pub fn new(name: impl Into<String>, width: u16, height: u16, pixel_format: PixelFormat) -> Self {
        let stride = usize::from(width) * pixel_format.bytes_per_pixel();
        Self {
            name: name.into(),
            sync_root: RwLock::new(Inner {
                width,
                height,
                pixel_format,
                stride,
                buffer: vec![0u8; stride * usize::from(height)],
            }),
        }
    }

    /// Current dimensions.
    pub async fn dimensions(&self) -> (u16, u16) {
        let inner = self.sync_root.read().await;
        (inner.width, inner.height)
    }

    /// The framebuffer's own pixel format.
    pub async fn pixel_format(&self) -> PixelFormat {
        self.sync_root.read().await.pixel_format.clone()
    }

    /// Applies a captured frame to this framebuffer, converting pixel
    /// format as needed, and returns the region actually written (clipped
    /// to this framebuffer's bounds).
    pub async fn apply_capture(&self, captured: &CapturedFramebuffer) -> Rectangle {
        let mut inner = self.sync_root.write().await;
        let full = Rectangle::new(0, 0, i32::from(captured.width), i32::from(captured.height))
            .clip_to_bounds(inner.width, inner.height);
        if full.is_empty() {
            return full;
        }
        let dst_format = inner.pixel_format.clone();
        let dst_stride = inner.stride;
        copy_rect(
            &captured.data,
            captured.stride,
            &captured.pixel_format,
            full,
            &mut inner.buffer,
            dst_stride,
            &dst_format,
            full.x,
            full.y,
        );
        full
    }

    /// Extracts a rectangle's pixels in the framebuffer's native format,
    /// for handing to an encoder.
    pub async fn get_rect(&self, rect: Rectangle) -> Vec<u8> {
        let inner = self.sync_root.read().await;
        let clipped = rect.clip_to_bounds(inner.width, inner.height);
        if clipped.is_empty() {
            return Vec::new();
        }
        let bpp = inner.pixel_format.bytes_per_pixel();
        let row_len = clipped.width as usize * bpp;
        let mut out = Vec::with_capacity(row_len * clipped.height as usize);
        for row in 0..clipped.height as usize {
            let y = clipped.y as usize + row;
            let start = y * inner.stride + clipped.x as usize * bpp;
            out.extend_from_slice(&inner.buffer[start..start + row_len]);
        }
        out
    }

    /// Extracts a rectangle's pixels converted into `dst_format`, for
    /// clients that negotiated a different pixel format than the
    /// framebuffer's own.
    pub async fn get_rect_as(&self, rect: Rectangle, dst_format: &PixelFormat) -> Vec<u8> {
        let inner = self.sync_root.read().await;
        let clipped = rect.clip_to_bounds(inner.width, inner.height);
        if clipped.is_empty() {
            return Vec::new();
        }
        let dst_bpp = dst_format.bytes_per_pixel();
        let mut out = vec![0u8; clipped.width as usize * clipped.height as usize * dst_bpp];
        copy_rect(
            &inner.buffer,
            inner.stride,
            &inner.pixel_format,
            clipped,
            &mut out,
            clipped.width as usize * dst_bpp,
            dst_format,
            0,
            0,
        );
        out
    }

    /// Resizes the framebuffer in place, zero-filling new pixels. Used
    /// when a `CaptureSource` honors `SetDesktopSize`.
    pub async fn resize(&self, width: u16, height: u16) {
        let mut inner = self.sync_root.write().await;
        let stride = usize::from(width) * inner.pixel_format.bytes_per_pixel();
        inner.width = width;
        inner.height = height;
        inner.stride = stride;
        inner.buffer = vec![0u8; stride * usize::from(height)];
    }

    /// Updates the negotiated client pixel format used by `get_rect_as`
    /// callers (the framebuffer's own storage format is unaffected; this
    /// only matters to callers that pass it through).
    pub async fn set_pixel_format(&self, pixel_format: PixelFormat) {
        self.sync_root.write().await.pixel_format = pixel_format;
    }
}
