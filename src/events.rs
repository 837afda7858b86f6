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

//! The session's observable events.
//!
//! Listeners are a capability interface — a struct of optional callbacks —
//! rather than a reflection-based event bus. Callbacks run synchronously
//! on the session thread (or the pump thread, for
//! `FramebufferCapturing`/`FramebufferUpdating`) and must not block
//! indefinitely.

/// Argument record for `PasswordProvided`.
#[derive(Debug, Clone, Copy)]
pub struct PasswordProvidedArgs {
    /// Whether the presented response was accepted.
    pub authenticated: bool,
}

/// Argument record for `ConnectionFailed`: the session never reached
/// `Running`.
#[derive(Debug, Clone)]
pub struct ConnectionFailedArgs {
    /// Human-readable reason the handshake didn't complete.
    pub reason: String,
}

/// Argument record for `Closed`, fired exactly once after `Running`.
#[derive(Debug, Clone)]
pub struct ClosedArgs {
    /// Human-readable reason the session ended.
    pub reason: String,
}

/// Argument record for `FramebufferUpdating`. A listener can set `handled`
/// to short-circuit the cache/encoder path entirely; in that case
/// `sent_changes` is returned by the pump tick as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramebufferUpdatingArgs {
    /// Set by a listener to skip the built-in cache/encode/send path.
    pub handled: bool,
    /// When `handled` is set, whether the listener itself sent changes.
    pub sent_changes: bool,
}

/// Argument record for `KeyChanged`.
#[derive(Debug, Clone, Copy)]
pub struct KeyChangedArgs {
    /// X11 keysym.
    pub keysym: u32,
    /// `true` if pressed, `false` if released.
    pub pressed: bool,
}

/// Argument record for `PointerChanged`.
#[derive(Debug, Clone, Copy)]
pub struct PointerChangedArgs {
    /// Pointer X coordinate in framebuffer space.
    pub x: u16,
    /// Pointer Y coordinate in framebuffer space.
    pub y: u16,
    /// Button bitmask (bit 0 = left, bit 1 = middle, bit 2 = right, ...).
    pub button_mask: u8,
}

/// Argument record for `RemoteClipboardChanged`.
#[derive(Debug, Clone)]
pub struct RemoteClipboardChangedArgs {
    /// The clipboard text the client sent via `ClientCutText`.
    pub text: String,
}

type Callback0 = Box<dyn Fn() + Send + Sync>;
type Callback1<A> = Box<dyn Fn(&A) + Send + Sync>;
type CallbackMut1<A> = Box<dyn Fn(&mut A) + Send + Sync>;

/// The full set of events a [`crate::session::Session`] can emit. Every
/// field is optional; a session with no listeners installed simply emits
/// nothing. Build with [`Listeners::default`] and the `on_*` builder
/// methods.
#[derive(Default)]
pub struct Listeners {
    password_provided: Option<Callback1<PasswordProvidedArgs>>,
    creating_desktop: Option<Callback0>,
    connected: Option<Callback0>,
    connection_failed: Option<Callback1<ConnectionFailedArgs>>,
    closed: Option<Callback1<ClosedArgs>>,
    framebuffer_capturing: Option<Callback0>,
    framebuffer_updating: Option<CallbackMut1<FramebufferUpdatingArgs>>,
    key_changed: Option<Callback1<KeyChangedArgs>>,
    pointer_changed: Option<Callback1<PointerChangedArgs>>,
    remote_clipboard_changed: Option<Callback1<RemoteClipboardChangedArgs>>,
}

macro_rules! builder0 {
    ($name:ident, $field:ident) => {
        /// Registers a callback for this event.
        #[must_use]
        pub fn $name(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
            self.$field = Some(Box::new(f));
            self
        }
    };
}

macro_rules! builder1 {
    ($name:ident, $field:ident, $arg:ty) => {
        /// Registers a callback for this event.
        #[must_use]
        pub fn $name(mut self, f: impl Fn(&$arg) + Send + Sync + 'static) -> Self {
            self.$field = Some(Box::new(f));
            self
        }
    };
}

impl Listeners {
    builder1!(on_password_provided, password_provided, PasswordProvidedArgs);
    builder0!(on_creating_desktop, creating_desktop);
    builder0!(on_connected, connected);
    builder1!(on_connection_failed, connection_failed, ConnectionFailedArgs);
    builder1!(on_closed, closed, ClosedArgs);
    builder0!(on_framebuffer_capturing, framebuffer_capturing);
    builder1!(on_key_changed, key_changed, KeyChangedArgs);
    builder1!(on_pointer_changed, pointer_changed, PointerChangedArgs);
    builder1!(on_remote_clipboard_changed, remote_clipboard_changed, RemoteClipboardChangedArgs);

    /// Registers the `FramebufferUpdating` callback, the only one that
    /// receives its argument by mutable reference (it can set `handled`).
    #[must_use]
    pub fn on_framebuffer_updating(mut self, f: impl Fn(&mut FramebufferUpdatingArgs) + Send + Sync + 'static) -> Self {
        self.framebuffer_updating = Some(Box::new(f));
        self
    }

    pub(crate) fn password_provided(&self, args: &PasswordProvidedArgs) {
        if let Some(f) = &self.password_provided {
            f(args);
        }
    }

    pub(crate) fn creating_desktop(&self) {
        if let Some(f) = &self.creating_desktop {
            f();
        }
    }

    pub(crate) fn connected(&self) {
        if let Some(f) = &self.connected {
            f();
        }
    }

    pub(crate) fn connection_failed(&self, args: &ConnectionFailedArgs) {
        if let Some(f) = &self.connection_failed {
            f(args);
        }
    }

    pub(crate) fn closed(&self, args: &ClosedArgs) {
        if let Some(f) = &self.closed {
            f(args);
        }
    }

    pub(crate) fn framebuffer_capturing(&self) {
        if let Some(f) = &self.framebuffer_capturing {
            f();
        }
    }

    pub(crate) fn framebuffer_updating(&self, args: &mut FramebufferUpdatingArgs) {
        if let Some(f) = &self.framebuffer_updating {
            f(args);
        }
    }

    pub(crate) fn key_changed(&self, args: &KeyChangedArgs) {
        if let Some(f) = &self.key_changed {
            f(args);
        }
    }

    pub(crate) fn pointer_changed(&self, args: &PointerChangedArgs) {
        if let Some(f) = &self.pointer_changed {
            f(args);
        }
    }

    pub(crate) fn remote_clipboard_changed(&self, args: &RemoteClipboardChangedArgs) {
        if let Some(f) = &self.remote_clipboard_changed {
            f(args);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn unset_callbacks_are_no_ops() {
        let listeners = Listeners::default();
        listeners.creating_desktop();
        listeners.connected();
        listeners.framebuffer_capturing();
    }

    #[test]
    fn registered_callback_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let listeners = Listeners::default().on_connected(move || fired2.store(true, Ordering::SeqCst));
        listeners.connected();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn framebuffer_updating_can_set_handled() {
        let listeners = Listeners::default().on_framebuffer_updating(|args| {
            args.handled = true;
            args.sent_changes = true;
        });
        let mut args = FramebufferUpdatingArgs::default();
        listeners.framebuffer_updating(&mut args);
        assert!(args.handled);
        assert!(args.sent_changes);
    }
}
