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

//! # rfb-session
//!
//! Core RFB/VNC server session: version and security handshake, framebuffer
//! tracking, the client message dispatch loop, and the periodic update pump
//! that turns framebuffer changes into `FramebufferUpdate` messages.
//!
//! This crate does not open sockets or grab pixels itself. A host
//! application supplies a transport (anything `AsyncRead + AsyncWrite`) and
//! a [`capture::CaptureSource`] (wherever frames come from), and drives the
//! connection with [`session::Session::run`].
//!
//! ## Quick start
//!
//! ```no_run
//! use rfb_session::{CaptureSource, Listeners, Session, SessionOptions};
//! use rfb_session::framebuffer::CapturedFramebuffer;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct MySource;
//!
//! #[async_trait]
//! impl CaptureSource for MySource {
//!     async fn capture(&self) -> Result<CapturedFramebuffer, String> {
//!         Err("no frame yet".into())
//!     }
//!
//!     fn desktop_name(&self) -> String {
//!         "my-desktop".to_string()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:5900").await?;
//!     let (stream, _) = listener.accept().await?;
//!
//!     let session = Session::new(stream, Arc::new(MySource), None, Listeners::default(), SessionOptions::default());
//!     session.run().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod cache;
pub mod capture;
pub mod convert;
pub mod encoding;
pub mod error;
pub mod events;
pub mod framebuffer;
pub mod geometry;
pub mod protocol;
pub mod pump;
pub mod session;

// Re-exports: the surface a host application reaches for most often.
pub use auth::{PasswordChallenge, StaticPasswordChallenge};
pub use capture::CaptureSource;
pub use encoding::{get_encoder, EncoderStats, Encoding};
pub use error::{Result, VncError};
pub use events::Listeners;
pub use framebuffer::{CapturedFramebuffer, Framebuffer};
pub use geometry::Rectangle;
pub use protocol::PixelFormat;
pub use session::{Session, SessionHandle, SessionOptions};
