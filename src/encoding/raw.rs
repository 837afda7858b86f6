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

//! Raw encoding: the rectangle header followed by `width * height *
//! client_bpp` bytes of pixel data, already converted to the client's
//! pixel format by the session before `send` is called.

use super::Encoding;
use crate::protocol::{PixelFormat, RectangleHeader, ENCODING_RAW};
use bytes::BytesMut;

/// The universally-supported fallback encoding: pixel data, uncompressed.
pub struct RawEncoding;

impl Encoding for RawEncoding {
    fn encoding(&self) -> i32 {
        ENCODING_RAW
    }

    fn send(&self, buf: &mut BytesMut, _client_format: &PixelFormat, region: RectangleHeader, content: &[u8]) -> usize {
        region.write_to(buf);
        buf.extend_from_slice(content);
        content.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_writes_header_then_pixels() {
        let encoder = RawEncoding;
        let region = RectangleHeader { x: 1, y: 2, width: 3, height: 4, encoding: ENCODING_RAW };
        let pixels = vec![9u8; 3 * 4 * 4];
        let mut buf = BytesMut::new();
        let written = encoder.send(&mut buf, &PixelFormat::rgbx8888(), region, &pixels);
        assert_eq!(written, pixels.len());
        assert_eq!(buf.len(), 12 + pixels.len());
        assert_eq!(&buf[12..], &pixels[..]);
    }
}
