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

//! The external capture collaborator: where a session gets its frames from.
//!
//! `async_trait` is used here, grounded on the `oxidecomputer-rfb` crate's
//! `Server` trait, since a real capture backend (a screen grabber, a GPU
//! passthrough, a software framebuffer) naturally performs I/O to produce a
//! frame.

use crate::framebuffer::CapturedFramebuffer;
use crate::protocol::DesktopSizeStatus;
use async_trait::async_trait;

/// Supplies framebuffer frames to a session and optionally handles
/// client-initiated resize requests.
///
/// Implementors own the actual pixel source (an X11/Wayland grabber, a
/// headless software surface, a GPU readback path, ...). The session never
/// assumes anything about how a frame was produced beyond the contract
/// below.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Captures the current state of the framebuffer.
    ///
    /// Implementations should return quickly; a slow capture delays every
    /// client waiting on the update pump. Returning an error is recovered
    /// locally by the pump — it never closes the session.
    async fn capture(&self) -> Result<CapturedFramebuffer, String>;

    /// The desktop/session name sent in `ServerInit`. Queried once, at
    /// `AwaitingClientInit`. Defaults to an empty name.
    fn desktop_name(&self) -> String {
        String::new()
    }

    /// Whether this source can honor `set_desktop_size`. Checked by the
    /// session before it tells a client that `SetDesktopSize` is usable.
    fn supports_resizing(&self) -> bool {
        false
    }

    /// Requests a desktop resize, e.g. in response to a client's
    /// `SetDesktopSize` message. The default implementation reports the
    /// operation as administratively prohibited, matching
    /// `supports_resizing`'s default of `false`.
    async fn set_desktop_size(&self, _width: u16, _height: u16) -> DesktopSizeStatus {
        DesktopSizeStatus::Prohibited
    }
}
