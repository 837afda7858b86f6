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

//! The pluggable `Encoding` interface plus the two encodings this core
//! ships: `Raw` and `CopyRect`.
//!
//! Advanced encodings (Tight, ZRLE, Hextile, ...) are out of scope beyond
//! this interface — a host crate registers its own `Encoding`
//! implementations against the same trait and `get_encoder` dispatch
//! shape.

pub mod copy_rect;
pub mod raw;

pub use copy_rect::CopyRectEncoding;
pub use raw::RawEncoding;

use crate::protocol::{PixelFormat, RectangleHeader, ENCODING_COPYRECT, ENCODING_RAW};
use bytes::BytesMut;

/// A server-to-client rectangle encoder.
///
/// A pure function over the rectangle's content — it never touches
/// session state other than the buffer it's handed. Pixel-format
/// conversion happens before `send` is called; `raw` already matches
/// `client_format` for pixel-carrying encodings.
pub trait Encoding: Send + Sync {
    /// The RFB wire encoding number this encoder produces.
    fn encoding(&self) -> i32;

    /// Appends this rectangle's header and encoded body to `buf`, and
    /// returns the number of encoded bytes written (the body only, not the
    /// 12-byte header — this is what feeds `EncoderStats::encoded_bytes`).
    fn send(&self, buf: &mut BytesMut, client_format: &PixelFormat, region: RectangleHeader, content: &[u8]) -> usize;
}

/// Looks up the built-in encoder for an RFB encoding number.
#[must_use]
pub fn get_encoder(encoding_type: i32) -> Option<Box<dyn Encoding>> {
    match encoding_type {
        ENCODING_RAW => Some(Box::new(RawEncoding)),
        ENCODING_COPYRECT => Some(Box::new(CopyRectEncoding)),
        _ => None,
    }
}

/// Whether `encoding_type` can serve as the generic pixel-content encoder
/// used for arbitrary invalidated rectangles.
///
/// `CopyRect` resolves via [`get_encoder`] too, since a cache-driven
/// `CacheAction::CopyRect` action still needs to dispatch through it, but
/// it only ever carries a 4-byte source-point body and must never be
/// picked as a client's general encoder for pixel content.
#[must_use]
pub fn is_generic_pixel_encoder(encoding_type: i32) -> bool {
    encoding_type != ENCODING_COPYRECT && get_encoder(encoding_type).is_some()
}

/// Per-encoding transmission counters. Monotone for the life of a
/// session; reset only when the session itself is recreated.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderStats {
    /// Number of rectangles sent with this encoding.
    pub rectangles: u64,
    /// Total bytes the encoded content represented before encoding.
    pub raw_bytes: u64,
    /// Total bytes actually written to the wire for this encoding's body.
    pub encoded_bytes: u64,
}

impl EncoderStats {
    /// Records one `Encoding::send` call's contribution.
    pub fn record(&mut self, raw_bytes: usize, encoded_bytes: usize) {
        self.rectangles += 1;
        self.raw_bytes += raw_bytes as u64;
        self.encoded_bytes += encoded_bytes as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_encoder_resolves_raw_and_copyrect() {
        assert!(get_encoder(ENCODING_RAW).is_some());
        assert!(get_encoder(ENCODING_COPYRECT).is_some());
    }

    #[test]
    fn get_encoder_rejects_unregistered_encodings() {
        assert!(get_encoder(7).is_none()); // Tight: interface-compatible, not built in
        assert!(get_encoder(16).is_none()); // ZRLE: same
    }

    #[test]
    fn is_generic_pixel_encoder_excludes_copyrect() {
        assert!(is_generic_pixel_encoder(ENCODING_RAW));
        assert!(!is_generic_pixel_encoder(ENCODING_COPYRECT));
        assert!(!is_generic_pixel_encoder(7)); // unregistered, also not generic
    }

    #[test]
    fn encoder_stats_accumulate() {
        let mut stats = EncoderStats::default();
        stats.record(100, 40);
        stats.record(50, 20);
        assert_eq!(stats.rectangles, 2);
        assert_eq!(stats.raw_bytes, 150);
        assert_eq!(stats.encoded_bytes, 60);
    }
}
