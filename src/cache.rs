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

//! The framebuffer cache / diff engine: given a captured frame and the
//! pending update request, decides which rectangles need to go to the
//! client.
//!
//! Two modes, chosen per capture by whether [`CapturedFramebuffer::hints`]
//! is populated:
//!
//! - **Hint-driven**: trust the capture source's move/dirty rectangles.
//! - **Diff-driven**: byte-compare scanlines against a cached prior
//!   snapshot — a second framebuffer of identical dimensions held just for
//!   this comparison.
//!
//! Non-incremental requests bypass both and invalidate the whole requested
//! region.

use crate::framebuffer::CapturedFramebuffer;
use crate::geometry::Rectangle;
use crate::protocol::PixelFormat;

/// One action the session must take to satisfy an update request.
#[derive(Debug, Clone)]
pub enum CacheAction {
    /// The client already has these pixels elsewhere in its framebuffer;
    /// tell it to copy them rather than resending.
    CopyRect {
        /// Destination region in the client's framebuffer.
        dest: Rectangle,
        /// Source X in the client's framebuffer.
        src_x: u16,
        /// Source Y in the client's framebuffer.
        src_y: u16,
    },
    /// This region's pixels changed (or are being sent for the first
    /// time) and must be re-encoded from the current framebuffer content.
    Invalidate(Rectangle),
}

struct Snapshot {
    width: u16,
    height: u16,
    format: PixelFormat,
    stride: usize,
    buffer: Vec<u8>,
}

impl Snapshot {
    fn blank(width: u16, height: u16, format: PixelFormat) -> Self {
        let stride = usize::from(width) * format.bytes_per_pixel();
        Snapshot { width, height, format, stride, buffer: vec![0u8; stride * usize::from(height)] }
    }

    fn matches(&self, width: u16, height: u16, format: &PixelFormat) -> bool {
        self.width == width && self.height == height && &self.format == format
    }
}

/// Diffs successive captures against a cached snapshot and turns hints or
/// pixel differences into a rectangle list.
///
/// Holds no session state beyond the snapshot itself: it is driven
/// entirely by the captured frame and the request region passed in.
#[derive(Default)]
pub struct FramebufferCache {
    snapshot: Option<Snapshot>,
}

impl FramebufferCache {
    /// A cache with no prior snapshot; the first diff-driven call will
    /// therefore compare against an all-zero frame.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the cached snapshot to a blank frame of the given dimensions
    /// and format. Callers invoke this whenever the framebuffer's instance
    /// identity, dimensions, or pixel format change.
    pub fn reset(&mut self, width: u16, height: u16, format: PixelFormat) {
        self.snapshot = Some(Snapshot::blank(width, height, format));
    }

    /// Produces the rectangle list for one pending [`crate::UpdateRequest`].
    ///
    /// `request_region` is assumed already clipped to the framebuffer's
    /// bounds by the caller. `supports_copyrect` reflects
    /// whether the client's negotiated encodings include `CopyRect`.
    pub fn respond_to_update_request(
        &mut self,
        incremental: bool,
        request_region: Rectangle,
        captured: &CapturedFramebuffer,
        supports_copyrect: bool,
    ) -> Vec<CacheAction> {
        let needs_reset = match &self.snapshot {
            Some(s) => !s.matches(captured.width, captured.height, &captured.pixel_format),
            None => true,
        };
        if needs_reset {
            self.reset(captured.width, captured.height, captured.pixel_format.clone());
        }

        let bounds = Rectangle::new(0, 0, i32::from(captured.width), i32::from(captured.height));
        let region = request_region.intersect(&bounds);
        let actions = if region.is_empty() {
            Vec::new()
        } else if !incremental {
            vec![CacheAction::Invalidate(region)]
        } else if let Some(hints) = &captured.hints {
            self.hint_driven(region, hints, supports_copyrect)
        } else {
            self.diff_driven(region, captured)
        };

        self.refresh_snapshot(captured);
        actions
    }

    fn hint_driven(&self, region: Rectangle, hints: &crate::framebuffer::CaptureHints, supports_copyrect: bool) -> Vec<CacheAction> {
        let mut actions = Vec::new();
        for mv in &hints.moved_rects {
            let dest = Rectangle::new(mv.dst_x, mv.dst_y, mv.src.width, mv.src.height).intersect(&region);
            if dest.is_empty() {
                continue;
            }
            if supports_copyrect {
                let src_x = (mv.src.x + (dest.x - mv.dst_x)).max(0) as u16;
                let src_y = (mv.src.y + (dest.y - mv.dst_y)).max(0) as u16;
                actions.push(CacheAction::CopyRect { dest, src_x, src_y });
            } else {
                actions.push(CacheAction::Invalidate(dest));
            }
        }
        for dirty in &hints.dirty_rects {
            let clipped = dirty.intersect(&region);
            if !clipped.is_empty() {
                actions.push(CacheAction::Invalidate(clipped));
            }
        }
        // Cursor pseudo-rectangle emission is not implemented: rendering a
        // cursor shape is an encoding of its own (RichCursor), and this
        // core only ships Raw/CopyRect.
        actions
    }

    fn diff_driven(&self, region: Rectangle, captured: &CapturedFramebuffer) -> Vec<CacheAction> {
        let Some(snapshot) = &self.snapshot else { return Vec::new() };
        let bpp = captured.pixel_format.bytes_per_pixel();
        let row_len = region.width as usize * bpp;
        let mut actions = Vec::new();
        let mut run_start: Option<i32> = None;

        let mut flush = |start: i32, end_exclusive: i32, actions: &mut Vec<CacheAction>| {
            actions.push(CacheAction::Invalidate(Rectangle::new(region.x, start, region.width, end_exclusive - start)));
        };

        for row in 0..region.height {
            let y = region.y + row;
            let src_off = y as usize * captured.stride + region.x as usize * bpp;
            let snap_off = y as usize * snapshot.stride + region.x as usize * bpp;
            let differs = captured.data[src_off..src_off + row_len] != snapshot.buffer[snap_off..snap_off + row_len];

            match (differs, run_start) {
                (true, None) => run_start = Some(y),
                (false, Some(start)) => {
                    flush(start, y, &mut actions);
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            flush(start, region.y + region.height, &mut actions);
        }
        actions
    }

    fn refresh_snapshot(&mut self, captured: &CapturedFramebuffer) {
        let Some(snapshot) = &mut self.snapshot else { return };
        let bpp = captured.pixel_format.bytes_per_pixel();
        let row_len = usize::from(captured.width) * bpp;
        for row in 0..usize::from(captured.height) {
            let src_off = row * captured.stride;
            let dst_off = row * snapshot.stride;
            snapshot.buffer[dst_off..dst_off + row_len].copy_from_slice(&captured.data[src_off..src_off + row_len]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::{CaptureHints, MoveRect};
    use bytes::Bytes;

    fn captured(width: u16, height: u16, fill: u8) -> CapturedFramebuffer {
        let format = PixelFormat::rgbx8888();
        let stride = usize::from(width) * format.bytes_per_pixel();
        CapturedFramebuffer {
            width,
            height,
            pixel_format: format,
            stride,
            data: Bytes::from(vec![fill; stride * usize::from(height)]),
            hints: None,
        }
    }

    #[test]
    fn incremental_with_no_change_emits_nothing() {
        let mut cache = FramebufferCache::new();
        let frame = captured(4, 4, 7);
        let region = Rectangle::new(0, 0, 4, 4);
        let first = cache.respond_to_update_request(true, region, &frame, false);
        assert!(!first.is_empty()); // first diff against blank snapshot is dirty
        let second = cache.respond_to_update_request(true, region, &frame, false);
        assert!(second.is_empty());
    }

    #[test]
    fn non_incremental_covers_whole_region() {
        let mut cache = FramebufferCache::new();
        let frame = captured(4, 4, 1);
        let region = Rectangle::new(0, 0, 4, 4);
        let actions = cache.respond_to_update_request(false, region, &frame, false);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            CacheAction::Invalidate(r) => assert_eq!(*r, region),
            _ => panic!("expected Invalidate"),
        }
    }

    #[test]
    fn diff_driven_coalesces_consecutive_dirty_rows() {
        let mut cache = FramebufferCache::new();
        let region = Rectangle::new(0, 0, 2, 4);
        let base = captured(2, 4, 0);
        cache.respond_to_update_request(true, region, &base, false);

        let format = PixelFormat::rgbx8888();
        let stride = 2 * format.bytes_per_pixel();
        let mut data = vec![0u8; stride * 4];
        data[stride..stride * 3].fill(9); // rows 1 and 2 differ
        let changed = CapturedFramebuffer { width: 2, height: 4, pixel_format: format, stride, data: Bytes::from(data), hints: None };

        let actions = cache.respond_to_update_request(true, region, &changed, false);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            CacheAction::Invalidate(r) => assert_eq!(*r, Rectangle::new(0, 1, 2, 2)),
            _ => panic!("expected Invalidate"),
        }
    }

    #[test]
    fn move_rect_becomes_copyrect_when_supported() {
        let mut cache = FramebufferCache::new();
        let region = Rectangle::new(0, 0, 4, 4);
        let hints = CaptureHints {
            moved_rects: vec![MoveRect { src: Rectangle::new(0, 0, 2, 2), dst_x: 2, dst_y: 2 }],
            dirty_rects: vec![],
            pointer: None,
        };
        let mut frame = captured(4, 4, 0);
        frame.hints = Some(hints);
        let actions = cache.respond_to_update_request(true, region, &frame, true);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            CacheAction::CopyRect { dest, src_x, src_y } => {
                assert_eq!(*dest, Rectangle::new(2, 2, 2, 2));
                assert_eq!(*src_x, 0);
                assert_eq!(*src_y, 0);
            }
            _ => panic!("expected CopyRect"),
        }
    }

    #[test]
    fn move_rect_falls_back_to_invalidate_without_copyrect_support() {
        let mut cache = FramebufferCache::new();
        let region = Rectangle::new(0, 0, 4, 4);
        let hints = CaptureHints {
            moved_rects: vec![MoveRect { src: Rectangle::new(0, 0, 2, 2), dst_x: 2, dst_y: 2 }],
            dirty_rects: vec![],
            pointer: None,
        };
        let mut frame = captured(4, 4, 0);
        frame.hints = Some(hints);
        let actions = cache.respond_to_update_request(true, region, &frame, false);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], CacheAction::Invalidate(_)));
    }

    #[test]
    fn dimension_change_resets_cache() {
        let mut cache = FramebufferCache::new();
        let small = captured(2, 2, 5);
        cache.respond_to_update_request(true, Rectangle::new(0, 0, 2, 2), &small, false);
        let big = captured(4, 4, 5);
        let actions = cache.respond_to_update_request(true, Rectangle::new(0, 0, 4, 4), &big, false);
        assert!(!actions.is_empty()); // reset snapshot is blank, so the filled frame is all dirty
    }
}
