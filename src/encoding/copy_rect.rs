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

//! CopyRect encoding: the rectangle header followed by 4 bytes — `u16
//! src_x, u16 src_y` — telling the client to copy a region from elsewhere
//! in its own framebuffer. Carries no pixel data.

use super::Encoding;
use crate::protocol::{PixelFormat, RectangleHeader, ENCODING_COPYRECT};
use bytes::BytesMut;

/// Instructs the client to copy pixels it already has, rather than
/// retransmitting them.
pub struct CopyRectEncoding;

impl CopyRectEncoding {
    /// Builds the 4-byte `(src_x, src_y)` body this encoding's `content`
    /// parameter expects.
    #[must_use]
    pub fn body(src_x: u16, src_y: u16) -> [u8; 4] {
        let mut body = [0u8; 4];
        body[0..2].copy_from_slice(&src_x.to_be_bytes());
        body[2..4].copy_from_slice(&src_y.to_be_bytes());
        body
    }
}

impl Encoding for CopyRectEncoding {
    fn encoding(&self) -> i32 {
        ENCODING_COPYRECT
    }

    fn send(&self, buf: &mut BytesMut, _client_format: &PixelFormat, region: RectangleHeader, content: &[u8]) -> usize {
        debug_assert_eq!(content.len(), 4, "CopyRect content must be the 4-byte (src_x, src_y) body");
        region.write_to(buf);
        buf.extend_from_slice(content);
        content.len()
    }
}
