//! Error types for the RFB session library.

use std::io;
use thiserror::Error;

/// Result type for RFB session operations.
pub type Result<T> = std::result::Result<T, VncError>;

/// Errors that can occur while driving an RFB session.
///
/// The propagation policy is: `CaptureError` is recovered locally
/// by the update pump and never closes the session; `EncoderError` always
/// closes the session, since the stream may contain a partially-written
/// rectangle; `ProtocolViolation`, `SanityCheck`, and `Transport` close the
/// session with a logged reason; `AuthFailure` is written to the client as
/// a failure reason string before the session closes.
#[derive(Debug, Error)]
pub enum VncError {
    /// Transport-level read/write failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The client violated the protocol: an unexpected opcode, an
    /// out-of-bounds operand size, or an unsupported version.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An internal invariant was violated (e.g. no framebuffer available at
    /// `AwaitingClientInit`). Distinct from `ProtocolViolation` because the
    /// client did nothing wrong.
    #[error("internal invariant violated: {0}")]
    SanityCheck(String),

    /// VNC authentication failed.
    #[error("authentication failed")]
    AuthFailure,

    /// The pixel format offered or requested is not well-formed.
    #[error("invalid pixel format: {0}")]
    InvalidPixelFormat(String),

    /// The capture source failed to produce a framebuffer. Recovered
    /// locally; never propagated out of the update pump.
    #[error("capture error: {0}")]
    CaptureError(String),

    /// An encoder failed mid-rectangle. Always fatal to the session.
    #[error("encoder error: {0}")]
    EncoderError(String),

    /// The peer closed the connection, or the session was closed locally.
    #[error("connection closed")]
    ConnectionClosed,
}

impl VncError {
    /// Whether this error should close the session per the propagation
    /// policy above. `CaptureError` is the sole exception.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, VncError::CaptureError(_))
    }
}
