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

//! VNC Remote Framebuffer (RFB) protocol constants and wire structures.
//!
//! This module provides the fundamental building blocks for RFB protocol
//! communication: the version banner, message opcodes, security types,
//! encoding numbers, and the `PixelFormat` wire layout. It implements RFB
//! 3.8 as specified in RFC 6143.

use bytes::{Buf, BufMut, BytesMut};
use std::io;

/// The RFB protocol version string advertised by the server.
///
/// This server implements RFB protocol version 3.8. The version string is
/// exactly 12 bytes including the trailing newline.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

// Client-to-Server Message Types

/// Client requests to change the pixel format.
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;
/// Client specifies supported encodings, ordered by preference.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;
/// Client requests a framebuffer update.
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
/// Client sends a keyboard event.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;
/// Client sends a pointer (mouse) event.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;
/// Client sends cut text (clipboard data).
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;
/// Client requests a desktop size change (ExtendedDesktopSize extension).
pub const CLIENT_MSG_SET_DESKTOP_SIZE: u8 = 251;

// Server-to-Client Message Types

/// Server sends a framebuffer update.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;
/// Server sets colour map entries (unused in this true-color core).
#[allow(dead_code)]
pub const SERVER_MSG_SET_COLOUR_MAP_ENTRIES: u8 = 1;
/// Server sends a bell (beep) notification.
pub const SERVER_MSG_BELL: u8 = 2;
/// Server sends cut text (clipboard data).
pub const SERVER_MSG_SERVER_CUT_TEXT: u8 = 3;

// Encoding Types

/// Raw pixel data.
pub const ENCODING_RAW: i32 = 0;
/// Copy Rectangle: instructs the client to copy a region from elsewhere in
/// its own framebuffer.
pub const ENCODING_COPYRECT: i32 = 1;
/// Rise-and-Run-length Encoding (not implemented by this core; interface
/// compatible via the `Encoding` trait).
#[allow(dead_code)]
pub const ENCODING_RRE: i32 = 2;
/// Compact RRE (not implemented by this core).
#[allow(dead_code)]
pub const ENCODING_CORRE: i32 = 4;
/// Hextile (not implemented by this core).
#[allow(dead_code)]
pub const ENCODING_HEXTILE: i32 = 5;
/// Zlib-compressed raw (not implemented by this core).
#[allow(dead_code)]
pub const ENCODING_ZLIB: i32 = 6;
/// Tight (not implemented by this core).
#[allow(dead_code)]
pub const ENCODING_TIGHT: i32 = 7;
/// TightPng (not implemented by this core).
#[allow(dead_code)]
pub const ENCODING_TIGHTPNG: i32 = -260;
/// ZlibHex (not implemented by this core).
#[allow(dead_code)]
pub const ENCODING_ZLIBHEX: i32 = 8;
/// ZRLE (not implemented by this core).
#[allow(dead_code)]
pub const ENCODING_ZRLE: i32 = 16;

/// Pseudo-encoding: Rich Cursor. Carries cursor shape and hotspot.
pub const ENCODING_CURSOR: i32 = -239;
/// Pseudo-encoding: Desktop Size. Notifies the client of a dimension change.
pub const ENCODING_DESKTOP_SIZE: i32 = -223;
/// Pseudo-encoding: Extended Desktop Size. Carries a reason/status and a
/// list of screen layouts.
pub const ENCODING_EXTENDED_DESKTOP_SIZE: i32 = -308;

// Security Types

/// Invalid/unknown security type.
#[allow(dead_code)]
pub const SECURITY_TYPE_INVALID: u8 = 0;
/// No authentication required.
pub const SECURITY_TYPE_NONE: u8 = 1;
/// Standard VNC Authentication (DES challenge/response).
pub const SECURITY_TYPE_VNC_AUTH: u8 = 2;

// Security Results

/// Authentication (or security handshake) succeeded.
pub const SECURITY_RESULT_OK: u32 = 0;
/// Authentication (or security handshake) failed.
pub const SECURITY_RESULT_FAILED: u32 = 1;

/// `ExtendedDesktopSize` reason codes, carried in the pseudo-rectangle's
/// x-position field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DesktopSizeReason {
    /// Sent in response to a non-incremental `FramebufferUpdateRequest` or
    /// an out-of-band resize, not caused by any client request.
    Server = 0,
    /// Sent in response to a client `SetDesktopSize` request.
    Client = 1,
    /// Sent because another client changed the desktop size.
    OtherClient = 2,
}

/// `ExtendedDesktopSize` status codes, carried in the pseudo-rectangle's
/// y-position field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DesktopSizeStatus {
    /// The resize succeeded.
    Success = 0,
    /// Resizing is administratively prohibited.
    Prohibited = 1,
    /// The resize failed for an unspecified reason.
    ResizeFailed = 2,
    /// The requested screen layout was invalid.
    InvalidScreenLayout = 3,
}

/// A single screen entry in an `ExtendedDesktopSize` rectangle body.
#[derive(Debug, Clone, Copy)]
pub struct ScreenLayout {
    /// Server-assigned screen identifier.
    pub id: u32,
    /// X offset of this screen within the framebuffer.
    pub x: u16,
    /// Y offset of this screen within the framebuffer.
    pub y: u16,
    /// Screen width.
    pub width: u16,
    /// Screen height.
    pub height: u16,
    /// Screen-specific flags (opaque to this implementation).
    pub flags: u32,
}

impl ScreenLayout {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.id);
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_u32(self.flags);
    }
}

/// Writes the basic `DesktopSize` pseudo-rectangle: just a rectangle header
/// carrying the new dimensions in its width/height fields, no body. Used
/// for clients that advertise `-223` but not `-308`/`ExtendedDesktopSize`.
pub fn write_desktop_size(buf: &mut BytesMut, width: u16, height: u16) {
    RectangleHeader { x: 0, y: 0, width, height, encoding: ENCODING_DESKTOP_SIZE }.write_to(buf);
}

/// Writes a full `ExtendedDesktopSize` pseudo-rectangle (header + body) to
/// `buf`: a one-screen layout describing the current framebuffer
/// dimensions.
pub fn write_extended_desktop_size(
    buf: &mut BytesMut,
    reason: DesktopSizeReason,
    status: DesktopSizeStatus,
    width: u16,
    height: u16,
) {
    let header = RectangleHeader {
        x: reason as u16,
        y: status as u16,
        width,
        height,
        encoding: ENCODING_EXTENDED_DESKTOP_SIZE,
    };
    header.write_to(buf);
    buf.put_u8(1); // number of screens
    buf.put_bytes(0, 3); // padding
    ScreenLayout { id: 0, x: 0, y: 0, width, height, flags: 0 }.write_to(buf);
}

/// The pixel format of a framebuffer or a client's requested display
/// format.
///
/// Invariant: `bytes_per_pixel() * 8 >= bits_per_pixel`, and the channel
/// shifts/max values must fit inside `bits_per_pixel` — enforced by
/// [`PixelFormat::is_valid`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    /// Number of bits occupied by a pixel on the wire.
    pub bits_per_pixel: u8,
    /// Number of significant bits (depth ≤ `bits_per_pixel`).
    pub depth: u8,
    /// `true` if multi-byte pixels are big-endian.
    pub big_endian: bool,
    /// `true` if this is a true-color format; `false` for palette/indexed.
    pub true_colour: bool,
    /// Maximum red channel value (e.g. 31 for 5 bits).
    pub red_max: u16,
    /// Maximum green channel value.
    pub green_max: u16,
    /// Maximum blue channel value.
    pub blue_max: u16,
    /// Bit shift to the red channel's LSB.
    pub red_shift: u8,
    /// Bit shift to the green channel's LSB.
    pub green_shift: u8,
    /// Bit shift to the blue channel's LSB.
    pub blue_shift: u8,
    /// Palette entries, populated only for non-true-color formats.
    /// Cross-palette conversion is out of scope; the palette is carried
    /// through unchanged when source and destination formats match.
    pub palette: Option<Vec<(u8, u8, u8)>>,
}

impl PixelFormat {
    /// Bytes occupied by one pixel on the wire.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> usize {
        usize::from(self.bits_per_pixel.div_ceil(8))
    }

    /// The standard 32-bit RGBX true-color format this crate uses
    /// internally as its default framebuffer format.
    #[must_use]
    pub fn rgbx8888() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: false,
            true_colour: true,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 0,
            green_shift: 8,
            blue_shift: 16,
            palette: None,
        }
    }

    /// A 16-bit RGB565 format: common for bandwidth-constrained clients.
    #[must_use]
    pub fn rgb565() -> Self {
        Self {
            bits_per_pixel: 16,
            depth: 16,
            big_endian: false,
            true_colour: true,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
            palette: None,
        }
    }

    /// Checks every invariant this format must hold: `bytes_per_pixel * 8
    /// >= bits_per_pixel`, a valid bit depth, and shifts/max values that
    /// fit inside `bits_per_pixel`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if ![8, 16, 24, 32].contains(&self.bits_per_pixel) {
            return false;
        }
        if self.bytes_per_pixel() * 8 < usize::from(self.bits_per_pixel) {
            return false;
        }
        if self.depth == 0 || self.depth > 32 {
            return false;
        }
        if !self.true_colour {
            // Palette formats are only supported at 8bpp in this core.
            return self.bits_per_pixel == 8;
        }

        let bits_needed = |max: u16| -> u32 {
            if max == 0 { 0 } else { 16 - max.leading_zeros() }
        };
        let total_bits = bits_needed(self.red_max) + bits_needed(self.green_max) + bits_needed(self.blue_max);
        if total_bits > u32::from(self.depth) {
            return false;
        }
        let bpp = u32::from(self.bits_per_pixel);
        u32::from(self.red_shift) < bpp && u32::from(self.green_shift) < bpp && u32::from(self.blue_shift) < bpp
    }

    /// Serializes the 16-byte wire layout: bpp, depth, big-endian,
    /// true-color, maxR/G/B, shiftR/G/B, 3 padding bytes.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(u8::from(self.big_endian));
        buf.put_u8(u8::from(self.true_colour));
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3);
    }

    /// Parses the 16-byte wire layout. The palette field is never
    /// populated from the wire (RFB carries palette entries via a
    /// separate `SetColourMapEntries` message, out of scope here).
    ///
    /// # Errors
    /// Returns an `UnexpectedEof` error if fewer than 16 bytes remain.
    pub fn from_bytes(buf: &mut BytesMut) -> io::Result<Self> {
        if buf.len() < 16 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "not enough bytes for PixelFormat"));
        }
        let pf = Self {
            bits_per_pixel: buf.get_u8(),
            depth: buf.get_u8(),
            big_endian: buf.get_u8() != 0,
            true_colour: buf.get_u8() != 0,
            red_max: buf.get_u16(),
            green_max: buf.get_u16(),
            blue_max: buf.get_u16(),
            red_shift: buf.get_u8(),
            green_shift: buf.get_u8(),
            blue_shift: buf.get_u8(),
            palette: None,
        };
        buf.advance(3);
        Ok(pf)
    }
}

/// The `ServerInit` message sent once, right after security negotiation.
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// Framebuffer width.
    pub framebuffer_width: u16,
    /// Framebuffer height.
    pub framebuffer_height: u16,
    /// The server's native pixel format.
    pub pixel_format: PixelFormat,
    /// Desktop/session name, shown in the client's title bar.
    pub name: String,
}

impl ServerInit {
    /// Serializes: `u16 w, u16 h, 16-byte pixel format, u32 name-length,
    /// name bytes`.
    #[allow(clippy::cast_possible_truncation)] // name length bounded well under u32::MAX in practice
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.framebuffer_width);
        buf.put_u16(self.framebuffer_height);
        self.pixel_format.write_to(buf);
        let name_bytes = self.name.as_bytes();
        buf.put_u32(name_bytes.len() as u32);
        buf.put_slice(name_bytes);
    }
}

/// A rectangle header as it appears on the wire: `u16 x, y, w, h, s32
/// encoding`, immediately followed by encoding-specific bytes. Distinct
/// from the geometric [`crate::geometry::Rectangle`], which carries no
/// encoding.
#[derive(Debug, Clone, Copy)]
pub struct RectangleHeader {
    /// X coordinate.
    pub x: u16,
    /// Y coordinate.
    pub y: u16,
    /// Width.
    pub width: u16,
    /// Height.
    pub height: u16,
    /// The RFB encoding number for the bytes that follow.
    pub encoding: i32,
}

impl RectangleHeader {
    /// Writes the 12-byte rectangle header.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_i32(self.encoding);
    }
}
