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

//! The session and protocol state machine: the heart of the crate. Drives
//! the handshake, owns the framebuffer and the per-client negotiated
//! state, and runs the message loop that dispatches inbound RFB opcodes
//! while the [`crate::pump::UpdatePump`] drives outbound updates.
//!
//! `Session<T>` is transport-generic so callers can hand in a TLS stream,
//! a Unix socket, or an in-memory duplex pair in tests.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify, RwLock};

use crate::cache::{CacheAction, FramebufferCache};
use crate::capture::CaptureSource;
use crate::auth::PasswordChallenge;
use crate::encoding::{get_encoder, is_generic_pixel_encoder, CopyRectEncoding, Encoding, EncoderStats, RawEncoding};
use crate::error::{Result, VncError};
use crate::events::{
    ClosedArgs, ConnectionFailedArgs, FramebufferUpdatingArgs, KeyChangedArgs, Listeners, PasswordProvidedArgs,
    PointerChangedArgs, RemoteClipboardChangedArgs,
};
use crate::framebuffer::Framebuffer;
use crate::geometry::Rectangle;
use crate::protocol::{
    write_desktop_size, write_extended_desktop_size, DesktopSizeReason, DesktopSizeStatus, PixelFormat,
    RectangleHeader, ServerInit, CLIENT_MSG_CLIENT_CUT_TEXT, CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST,
    CLIENT_MSG_KEY_EVENT, CLIENT_MSG_POINTER_EVENT, CLIENT_MSG_SET_DESKTOP_SIZE, CLIENT_MSG_SET_ENCODINGS,
    CLIENT_MSG_SET_PIXEL_FORMAT, ENCODING_COPYRECT, ENCODING_DESKTOP_SIZE, ENCODING_EXTENDED_DESKTOP_SIZE,
    ENCODING_RAW, PROTOCOL_VERSION, SECURITY_RESULT_FAILED, SECURITY_RESULT_OK, SECURITY_TYPE_NONE,
    SECURITY_TYPE_VNC_AUTH, SERVER_MSG_BELL, SERVER_MSG_FRAMEBUFFER_UPDATE, SERVER_MSG_SERVER_CUT_TEXT,
};
use crate::pump::UpdatePump;

/// Bound on `SetEncodings`' count field.
const MAX_ENCODINGS: usize = 511;
/// Bound on `ClientCutText`'s length field.
const MAX_CUT_TEXT: usize = 16 * 1024 * 1024;

/// The protocol states the session moves through, logged as it
/// transitions through them. Control flow itself is the ordinary linear
/// sequence of awaits in [`Session::run`] — Rust's async model already
/// encodes "what happens next" without a separate dispatch loop over this
/// enum — but the states are named here so transitions are observable in
/// logs and so the type exists for documentation/introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Exchanging the RFB version banner.
    AwaitingVersion,
    /// Negotiating which security type the client will use.
    AwaitingSecuritySelection,
    /// Running the VNC authentication challenge/response.
    AwaitingAuth,
    /// Waiting for `ClientInit`, about to send `ServerInit`.
    AwaitingClientInit,
    /// The message loop is active.
    Running,
    /// Terminal: the session has ended.
    Closed,
}

/// Tunable session parameters. Named fields rather than a config-file
/// layer, since there's no ambient config file to load in this core.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Maximum rate, in Hz, at which the update pump invokes
    /// `send_changes`. Bounds outgoing frame rate.
    pub rate_hz: f64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { rate_hz: 30.0 }
    }
}

/// A client's `FramebufferUpdateRequest`, clipped to framebuffer bounds.
/// At most one is pending per session.
#[derive(Debug, Clone, Copy)]
struct UpdateRequest {
    incremental: bool,
    region: Rectangle,
}

/// A desktop-size pseudo-rectangle pending at the end of an update, chosen
/// by which size pseudo-encoding the client advertised: the full
/// `ExtendedDesktopSize` (carries a reason/status and screen layout) or the
/// plain `DesktopSize` (just the new dimensions in the header).
#[derive(Debug, Clone, Copy)]
enum DesktopSizeRect {
    Extended(DesktopSizeReason, DesktopSizeStatus, u16, u16),
    Basic(u16, u16),
}

impl DesktopSizeRect {
    fn write_to(&self, buf: &mut BytesMut) {
        match *self {
            DesktopSizeRect::Extended(reason, status, w, h) => write_extended_desktop_size(buf, reason, status, w, h),
            DesktopSizeRect::Basic(w, h) => write_desktop_size(buf, w, h),
        }
    }

    fn dimensions(&self) -> (u16, u16) {
        match *self {
            DesktopSizeRect::Extended(_, _, w, h) | DesktopSizeRect::Basic(w, h) => (w, h),
        }
    }
}

/// One rectangle queued between `BeginUpdate` and `EndUpdate`.
/// `content` is either raw pixel bytes (already converted to the client's
/// pixel format) or, for `CopyRect`, the 4-byte source-point body.
struct PendingRectangle {
    region: Rectangle,
    encoding: i32,
    content: Vec<u8>,
}

/// Per-client negotiated state.
#[derive(Debug, Clone)]
struct ClientState {
    supported_encodings: Vec<i32>,
    pixel_format: PixelFormat,
    width: u16,
    height: u16,
    selected_encoder: i32,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            supported_encodings: Vec::new(),
            pixel_format: PixelFormat::rgbx8888(),
            width: 0,
            height: 0,
            selected_encoder: ENCODING_RAW,
        }
    }
}

/// State shared between the session's message loop and its update pump,
/// and exposed to the outside world via [`SessionHandle`]. Field order
/// documents the lock order: `pending_request` → `framebuffer.sync_root`
/// → `writer`.
struct Shared<T> {
    writer: Mutex<WriteHalf<T>>,
    framebuffer: Framebuffer,
    capture: Arc<dyn CaptureSource>,
    password: Option<Arc<dyn PasswordChallenge>>,
    listeners: Arc<Listeners>,
    client: RwLock<ClientState>,
    pending_request: Mutex<Option<UpdateRequest>>,
    cache: Mutex<FramebufferCache>,
    stats: Mutex<HashMap<i32, EncoderStats>>,
    options: SessionOptions,
    /// Signaled when an encoder write fails mid-rectangle: an
    /// `EncoderError` / a rectangle-send I/O failure always closes the
    /// session. The message loop selects on this alongside its read so a
    /// pump-thread failure promptly ends `Running`.
    fatal: Notify,
    fatal_reason: Mutex<Option<String>>,
}

/// A cloneable handle to a running session's outbound stream, usable from
/// outside the session's own task — e.g. to ring the bell or push
/// clipboard text. Writes through a handle share the same `streamLock` as
/// the message loop and the update pump, so they're never interleaved.
#[derive(Clone)]
pub struct SessionHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> SessionHandle<T>
where
    T: AsyncWrite + Unpin + Send + 'static,
{
    /// Sends `Bell` (opcode 2): a single byte, no body.
    pub async fn bell(&self) -> Result<()> {
        let mut writer = self.shared.writer.lock().await;
        writer.write_all(&[SERVER_MSG_BELL]).await?;
        Ok(())
    }

    /// Sends `ServerCutText` (opcode 3): `3 pad + u32 len + bytes`.
    pub async fn server_cut_text(&self, text: &str) -> Result<()> {
        let mut buf = BytesMut::new();
        buf.put_u8(SERVER_MSG_SERVER_CUT_TEXT);
        buf.put_bytes(0, 3);
        let bytes = text.as_bytes();
        buf.put_u32(bytes.len() as u32);
        buf.extend_from_slice(bytes);
        let mut writer = self.shared.writer.lock().await;
        writer.write_all(&buf).await?;
        Ok(())
    }
}

/// A single RFB server session over an already-connected transport.
///
/// Owns the read half of the transport and the session's exclusive
/// state: its wire stream, its pending update request, its rectangle
/// queue, and its encoder statistics. Call [`Session::handle`] before
/// [`Session::run`] to retain a [`SessionHandle`] for out-of-band sends.
pub struct Session<T> {
    reader: ReadHalf<T>,
    shared: Arc<Shared<T>>,
    version_supported: bool,
    pump: Option<UpdatePump>,
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an already-connected transport. Nothing is written to it
    /// until [`Session::run`] is called.
    pub fn new(
        transport: T,
        capture: Arc<dyn CaptureSource>,
        password: Option<Arc<dyn PasswordChallenge>>,
        listeners: Listeners,
        options: SessionOptions,
    ) -> Self {
        let (reader, writer) = tokio::io::split(transport);
        let name = capture.desktop_name();
        let shared = Arc::new(Shared {
            writer: Mutex::new(writer),
            framebuffer: Framebuffer::new(name, 0, 0, PixelFormat::rgbx8888()),
            capture,
            password,
            listeners: Arc::new(listeners),
            client: RwLock::new(ClientState::default()),
            pending_request: Mutex::new(None),
            cache: Mutex::new(FramebufferCache::new()),
            stats: Mutex::new(HashMap::new()),
            options,
            fatal: Notify::new(),
            fatal_reason: Mutex::new(None),
        });
        Self { reader, shared, version_supported: false, pump: None }
    }

    /// A cloneable handle for out-of-band sends (`Bell`, `ServerCutText`)
    /// from outside the task that will drive [`Session::run`].
    #[must_use]
    pub fn handle(&self) -> SessionHandle<T> {
        SessionHandle { shared: self.shared.clone() }
    }

    /// Drives the session to completion: handshake, then the message loop
    /// until the client disconnects or a fatal error occurs. Fires
    /// `ConnectionFailed` if `Running` was never reached, or `Closed`
    /// exactly once otherwise.
    pub async fn run(mut self) -> Result<()> {
        let mut reached_running = false;
        let result = self.run_inner(&mut reached_running).await;
        match &result {
            Ok(()) => self.shared.listeners.closed(&ClosedArgs { reason: "connection closed".into() }),
            Err(e) if reached_running => self.shared.listeners.closed(&ClosedArgs { reason: e.to_string() }),
            Err(e) => self.shared.listeners.connection_failed(&ConnectionFailedArgs { reason: e.to_string() }),
        }
        self.log_stats().await;
        result
    }

    async fn run_inner(&mut self, reached_running: &mut bool) -> Result<()> {
        log::debug!("state: {:?}", SessionState::AwaitingVersion);
        self.await_version().await?;

        log::debug!("state: {:?}", SessionState::AwaitingSecuritySelection);
        let methods = self.security_methods();
        let method = self.negotiate_security(&methods).await?;

        if method == SECURITY_TYPE_VNC_AUTH {
            log::debug!("state: {:?}", SessionState::AwaitingAuth);
            self.perform_vnc_auth().await?;
        } else {
            let mut buf = BytesMut::with_capacity(4);
            buf.put_u32(SECURITY_RESULT_OK);
            self.write_locked(&buf).await?;
        }

        log::debug!("state: {:?}", SessionState::AwaitingClientInit);
        self.await_client_init().await?;

        *reached_running = true;
        log::debug!("state: {:?}", SessionState::Running);
        self.shared.listeners.connected();

        let pump_shared = self.shared.clone();
        self.pump = Some(UpdatePump::start(
            Arc::new(move || {
                let shared = pump_shared.clone();
                Box::pin(async move { Self::send_changes(&shared).await })
            }),
            self.shared.options.rate_hz,
            false,
        ));

        let result = self.message_loop().await;
        if let Some(pump) = self.pump.take() {
            pump.stop().await;
        }
        log::debug!("state: {:?}", SessionState::Closed);
        result
    }

    // ---- Handshake ----------------------------------------------------

    async fn await_version(&mut self) -> Result<()> {
        self.write_locked(PROTOCOL_VERSION.as_bytes()).await?;
        let mut buf = [0u8; 12];
        self.reader.read_exact(&mut buf).await?;
        let text = String::from_utf8_lossy(&buf);
        let version = text
            .strip_prefix("RFB ")
            .and_then(|rest| rest.get(0..7))
            .and_then(|v| v.split_once('.'))
            .and_then(|(maj, min)| Some((maj.parse::<u8>().ok()?, min.trim_end_matches(['\n', '\0']).parse::<u8>().ok()?)));
        self.version_supported = version == Some((3, 8));
        Ok(())
    }

    fn security_methods(&self) -> Vec<u8> {
        if !self.version_supported {
            return Vec::new();
        }
        if self.shared.password.is_some() {
            vec![SECURITY_TYPE_VNC_AUTH]
        } else {
            vec![SECURITY_TYPE_NONE]
        }
    }

    async fn negotiate_security(&mut self, methods: &[u8]) -> Result<u8> {
        let mut buf = BytesMut::with_capacity(1 + methods.len());
        buf.put_u8(methods.len() as u8);
        buf.extend_from_slice(methods);
        self.write_locked(&buf).await?;

        if methods.is_empty() {
            self.write_failure_reason("unsupported protocol version").await?;
            return Err(VncError::ProtocolViolation("client did not offer RFB 003.008".into()));
        }

        let selected = self.reader.read_u8().await?;
        if !methods.contains(&selected) {
            self.write_failure_reason("unsupported security type").await?;
            return Err(VncError::ProtocolViolation(format!("client selected unoffered security type {selected}")));
        }
        Ok(selected)
    }

    async fn write_failure_reason(&self, reason: &str) -> Result<()> {
        let mut buf = BytesMut::new();
        let bytes = reason.as_bytes();
        buf.put_u32(bytes.len() as u32);
        buf.extend_from_slice(bytes);
        self.write_locked(&buf).await
    }

    async fn perform_vnc_auth(&mut self) -> Result<()> {
        let password = self
            .shared
            .password
            .clone()
            .ok_or_else(|| VncError::SanityCheck("VNC auth selected with no PasswordChallenge configured".into()))?;

        let mut challenge = password.generate_challenge().await;
        self.write_locked(&challenge).await?;

        let mut response = [0u8; 16];
        self.reader.read_exact(&mut response).await?;
        let authenticated = password.verify_response(&challenge, &response).await;

        challenge.iter_mut().for_each(|b| *b = 0);
        response.iter_mut().for_each(|b| *b = 0);
        self.shared.listeners.password_provided(&PasswordProvidedArgs { authenticated });

        if authenticated {
            let mut buf = BytesMut::with_capacity(4);
            buf.put_u32(SECURITY_RESULT_OK);
            self.write_locked(&buf).await?;
            Ok(())
        } else {
            let mut buf = BytesMut::with_capacity(4);
            buf.put_u32(SECURITY_RESULT_FAILED);
            let reason = b"authentication failed";
            buf.put_u32(reason.len() as u32);
            buf.extend_from_slice(reason);
            self.write_locked(&buf).await?;
            Err(VncError::AuthFailure)
        }
    }

    async fn await_client_init(&mut self) -> Result<()> {
        let mut shared_flag = [0u8; 1];
        self.reader.read_exact(&mut shared_flag).await?;
        self.shared.listeners.creating_desktop();

        let captured = self
            .shared
            .capture
            .capture()
            .await
            .map_err(|e| VncError::SanityCheck(format!("no initial framebuffer available: {e}")))?;

        self.shared.framebuffer.resize(captured.width, captured.height).await;
        self.shared.framebuffer.set_pixel_format(captured.pixel_format.clone()).await;
        self.shared.framebuffer.apply_capture(&captured).await;
        self.shared.cache.lock().await.reset(captured.width, captured.height, captured.pixel_format.clone());

        {
            let mut client = self.shared.client.write().await;
            client.pixel_format = captured.pixel_format.clone();
            client.width = captured.width;
            client.height = captured.height;
        }

        let server_init = ServerInit {
            framebuffer_width: captured.width,
            framebuffer_height: captured.height,
            pixel_format: captured.pixel_format,
            name: self.shared.framebuffer.name.clone(),
        };
        let mut buf = BytesMut::new();
        server_init.write_to(&mut buf);
        self.write_locked(&buf).await
    }

    // ---- Running: message loop -----------------------------------------

    async fn message_loop(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                () = self.shared.fatal.notified() => {
                    let reason = self.shared.fatal_reason.lock().await.clone().unwrap_or_else(|| "update pump write failed".into());
                    return Err(VncError::EncoderError(reason));
                }
                opcode = Self::read_opcode(&mut self.reader) => {
                    let Some(opcode) = opcode? else { return Err(VncError::ConnectionClosed) };
                    self.dispatch(opcode).await?;
                }
            }
        }
    }

    async fn read_opcode(reader: &mut ReadHalf<T>) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        let n = reader.read(&mut buf).await?;
        Ok(if n == 0 { None } else { Some(buf[0]) })
    }

    async fn dispatch(&mut self, opcode: u8) -> Result<()> {
        match opcode {
            CLIENT_MSG_SET_PIXEL_FORMAT => self.handle_set_pixel_format().await,
            CLIENT_MSG_SET_ENCODINGS => self.handle_set_encodings().await,
            CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => self.handle_update_request().await,
            CLIENT_MSG_KEY_EVENT => self.handle_key_event().await,
            CLIENT_MSG_POINTER_EVENT => self.handle_pointer_event().await,
            CLIENT_MSG_CLIENT_CUT_TEXT => self.handle_cut_text().await,
            CLIENT_MSG_SET_DESKTOP_SIZE => self.handle_set_desktop_size().await,
            other => Err(VncError::ProtocolViolation(format!("unknown opcode {other}"))),
        }
    }

    async fn handle_set_pixel_format(&mut self) -> Result<()> {
        let mut pad = [0u8; 3];
        self.reader.read_exact(&mut pad).await?;
        let mut raw = BytesMut::zeroed(16);
        self.reader.read_exact(&mut raw).await?;
        let format = PixelFormat::from_bytes(&mut raw)?;
        if !format.is_valid() {
            return Err(VncError::InvalidPixelFormat(format!("{format:?}")));
        }
        self.shared.client.write().await.pixel_format = format;
        Ok(())
    }

    async fn handle_set_encodings(&mut self) -> Result<()> {
        let mut pad = [0u8; 1];
        self.reader.read_exact(&mut pad).await?;
        let count = usize::from(self.reader.read_u16().await?);
        if count > MAX_ENCODINGS {
            return Err(VncError::ProtocolViolation(format!("SetEncodings count {count} exceeds {MAX_ENCODINGS}")));
        }
        let mut encodings = Vec::with_capacity(count);
        for _ in 0..count {
            encodings.push(self.reader.read_i32().await?);
        }
        // CopyRect is excluded: it's a meta-encoding for move-hints, not a
        // generic pixel encoder, and must never be picked here (it's
        // selected per-rectangle by the cache instead).
        let selected = encodings.iter().copied().find(|e| is_generic_pixel_encoder(*e)).unwrap_or(ENCODING_RAW);

        let mut client = self.shared.client.write().await;
        client.supported_encodings = encodings;
        client.selected_encoder = selected;
        Ok(())
    }

    async fn handle_update_request(&mut self) -> Result<()> {
        let incremental = self.reader.read_u8().await? != 0;
        let x = self.reader.read_u16().await?;
        let y = self.reader.read_u16().await?;
        let width = self.reader.read_u16().await?;
        let height = self.reader.read_u16().await?;

        let (fb_width, fb_height) = self.shared.framebuffer.dimensions().await;
        let region = Rectangle::from_wire(x, y, width, height).clip_to_bounds(fb_width, fb_height);
        if region.is_empty() {
            return Ok(()); // empty request region, discarded
        }

        *self.shared.pending_request.lock().await = Some(UpdateRequest { incremental, region });
        if let Some(pump) = &self.pump {
            pump.signal();
        }
        Ok(())
    }

    async fn handle_key_event(&mut self) -> Result<()> {
        let pressed = self.reader.read_u8().await? != 0;
        let mut pad = [0u8; 2];
        self.reader.read_exact(&mut pad).await?;
        let keysym = self.reader.read_u32().await?;
        self.shared.listeners.key_changed(&KeyChangedArgs { keysym, pressed });
        Ok(())
    }

    async fn handle_pointer_event(&mut self) -> Result<()> {
        let button_mask = self.reader.read_u8().await?;
        let x = self.reader.read_u16().await?;
        let y = self.reader.read_u16().await?;
        self.shared.listeners.pointer_changed(&PointerChangedArgs { x, y, button_mask });
        Ok(())
    }

    async fn handle_cut_text(&mut self) -> Result<()> {
        let mut pad = [0u8; 3];
        self.reader.read_exact(&mut pad).await?;
        let len = self.reader.read_u32().await? as usize;
        if len > MAX_CUT_TEXT {
            return Err(VncError::ProtocolViolation(format!("ClientCutText length {len} exceeds {MAX_CUT_TEXT}")));
        }
        let mut bytes = vec![0u8; len];
        self.reader.read_exact(&mut bytes).await?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        self.shared.listeners.remote_clipboard_changed(&RemoteClipboardChangedArgs { text });
        Ok(())
    }

    async fn handle_set_desktop_size(&mut self) -> Result<()> {
        let mut pad = [0u8; 1];
        self.reader.read_exact(&mut pad).await?;
        let width = self.reader.read_u16().await?;
        let height = self.reader.read_u16().await?;
        let num_screens = self.reader.read_u8().await?;
        self.reader.read_exact(&mut pad).await?;
        let mut screens = vec![0u8; usize::from(num_screens) * 16];
        self.reader.read_exact(&mut screens).await?;

        let status = if self.shared.capture.supports_resizing() {
            self.shared.capture.set_desktop_size(width, height).await
        } else {
            DesktopSizeStatus::Prohibited
        };
        let (applied_width, applied_height) = if status == DesktopSizeStatus::Success {
            self.shared.framebuffer.resize(width, height).await;
            let format = self.shared.framebuffer.pixel_format().await;
            self.shared.cache.lock().await.reset(width, height, format);
            let mut client = self.shared.client.write().await;
            client.width = width;
            client.height = height;
            (width, height)
        } else {
            self.shared.framebuffer.dimensions().await
        };

        let mut buf = BytesMut::new();
        buf.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
        buf.put_u8(0);
        buf.put_u16(1);
        write_extended_desktop_size(&mut buf, DesktopSizeReason::Client, status, applied_width, applied_height);
        self.write_locked(&buf).await
    }

    // ---- Shared helpers -------------------------------------------------

    async fn write_locked(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.shared.writer.lock().await;
        writer.write_all(bytes).await?;
        Ok(())
    }

    async fn log_stats(&self) {
        let stats = self.shared.stats.lock().await;
        for (encoding, s) in stats.iter() {
            log::info!(
                "session closed: encoding {encoding} sent {} rect(s), {} raw byte(s), {} encoded byte(s)",
                s.rectangles,
                s.raw_bytes,
                s.encoded_bytes
            );
        }
    }

    /// The update pump's per-tick action.
    async fn send_changes(shared: &Arc<Shared<T>>) -> bool {
        let mut pending_guard = shared.pending_request.lock().await; // FramebufferUpdateRequestLock
        let Some(request) = *pending_guard else { return false };

        let captured = match shared.capture.capture().await {
            Ok(c) => c,
            Err(e) => {
                let err = VncError::CaptureError(e);
                debug_assert!(!err.is_fatal(), "CaptureError must never close the session");
                log::warn!("capture error (recovered): {err}");
                return false;
            }
        };

        shared.listeners.framebuffer_capturing();
        let mut updating_args = FramebufferUpdatingArgs::default();
        shared.listeners.framebuffer_updating(&mut updating_args);
        if updating_args.handled {
            return updating_args.sent_changes;
        }

        let (fb_width, fb_height) = shared.framebuffer.dimensions().await;
        let fb_format = shared.framebuffer.pixel_format().await;
        if (captured.width, captured.height) != (fb_width, fb_height) || captured.pixel_format != fb_format {
            shared.framebuffer.resize(captured.width, captured.height).await;
            shared.framebuffer.set_pixel_format(captured.pixel_format.clone()).await;
            shared.cache.lock().await.reset(captured.width, captured.height, captured.pixel_format.clone());
        }
        shared.framebuffer.apply_capture(&captured).await; // framebuffer.sync_root, nested under pending_request

        let client = shared.client.read().await.clone();
        let supports_copyrect = client.supported_encodings.contains(&ENCODING_COPYRECT);
        let supports_ext_desktop_size = client.supported_encodings.contains(&ENCODING_EXTENDED_DESKTOP_SIZE);
        let supports_desktop_size = client.supported_encodings.contains(&ENCODING_DESKTOP_SIZE);

        let actions = {
            let mut cache = shared.cache.lock().await;
            cache.respond_to_update_request(request.incremental, request.region, &captured, supports_copyrect)
        };

        let mut rectangles = Vec::with_capacity(actions.len());
        for action in actions {
            match action {
                CacheAction::CopyRect { dest, src_x, src_y } => {
                    rectangles.push(PendingRectangle {
                        region: dest,
                        encoding: ENCODING_COPYRECT,
                        content: CopyRectEncoding::body(src_x, src_y).to_vec(),
                    });
                }
                CacheAction::Invalidate(region) => {
                    let pixels = shared.framebuffer.get_rect_as(region, &client.pixel_format).await;
                    rectangles.push(PendingRectangle { region, encoding: client.selected_encoder, content: pixels });
                }
            }
        }

        // ExtendedDesktopSize prepended before pixel rects on a
        // non-incremental request.
        let prefix = (!request.incremental && supports_ext_desktop_size).then_some(DesktopSizeRect::Extended(
            DesktopSizeReason::Server,
            DesktopSizeStatus::Success,
            captured.width,
            captured.height,
        ));
        // A desktop-size pseudo-rectangle appended after pixel rects when
        // the framebuffer's dimensions have drifted from what the client
        // believes them to be: `ExtendedDesktopSize` if the client
        // advertised it, else the plain `DesktopSize` pseudo-encoding if
        // the client advertised that instead.
        let dims_changed = (client.width, client.height) != (captured.width, captured.height);
        let suffix = if prefix.is_some() || !dims_changed {
            None
        } else if supports_ext_desktop_size {
            Some(DesktopSizeRect::Extended(DesktopSizeReason::Server, DesktopSizeStatus::Success, captured.width, captured.height))
        } else if supports_desktop_size {
            Some(DesktopSizeRect::Basic(captured.width, captured.height))
        } else {
            None
        };

        if rectangles.is_empty() && prefix.is_none() && suffix.is_none() {
            // Nothing to send this tick: leave the request pending rather
            // than discarding it. A conforming client has exactly one
            // outstanding `FramebufferUpdateRequest` and won't issue
            // another until it receives a `FramebufferUpdate`; clearing it
            // here would stall the stream until the client happens to send
            // a fresh request.
            return false;
        }

        let rect_count = rectangles.len() + usize::from(prefix.is_some()) + usize::from(suffix.is_some());
        let mut buf = BytesMut::new();
        buf.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
        buf.put_u8(0);
        buf.put_u16(rect_count as u16);

        if let Some(rect) = &prefix {
            rect.write_to(&mut buf);
        }

        {
            let mut stats = shared.stats.lock().await;
            for rect in &rectangles {
                let header = RectangleHeader {
                    x: rect.region.x as u16,
                    y: rect.region.y as u16,
                    width: rect.region.width as u16,
                    height: rect.region.height as u16,
                    encoding: rect.encoding,
                };
                let encoded = match get_encoder(rect.encoding) {
                    Some(encoder) => encoder.send(&mut buf, &client.pixel_format, header, &rect.content),
                    None => RawEncoding.send(&mut buf, &client.pixel_format, header, &rect.content),
                };
                stats.entry(rect.encoding).or_default().record(rect.content.len(), encoded);
            }
        }

        if let Some(rect) = &suffix {
            rect.write_to(&mut buf);
            let (w, h) = rect.dimensions();
            let mut client_state = shared.client.write().await;
            client_state.width = w;
            client_state.height = h;
        } else if let Some(rect) = &prefix {
            let (w, h) = rect.dimensions();
            let mut client_state = shared.client.write().await;
            client_state.width = w;
            client_state.height = h;
        }

        *pending_guard = None;

        let write_result = {
            let mut writer = shared.writer.lock().await; // streamLock, acquired last
            writer.write_all(&buf).await
        };
        drop(pending_guard);

        match write_result {
            Ok(()) => true,
            Err(e) => {
                *shared.fatal_reason.lock().await = Some(format!("framebuffer update write failed: {e}"));
                shared.fatal.notify_one();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::CapturedFramebuffer;
    use async_trait::async_trait;
    use bytes::{Buf, Bytes};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::{duplex, AsyncReadExt as _, AsyncWriteExt as _};

    struct FixedCapture {
        width: u16,
        height: u16,
        format: PixelFormat,
        pixels: Vec<u8>,
        name: String,
    }

    #[async_trait]
    impl CaptureSource for FixedCapture {
        async fn capture(&self) -> std::result::Result<CapturedFramebuffer, String> {
            let stride = usize::from(self.width) * self.format.bytes_per_pixel();
            Ok(CapturedFramebuffer {
                width: self.width,
                height: self.height,
                pixel_format: self.format.clone(),
                stride,
                data: Bytes::from(self.pixels.clone()),
                hints: None,
            })
        }

        fn desktop_name(&self) -> String {
            self.name.clone()
        }
    }

    async fn read_exact_vec(stream: &mut (impl tokio::io::AsyncRead + Unpin), len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    /// Drives the version/security/`ClientInit` handshake over an
    /// already-connected duplex half and reads off `ServerInit`, returning
    /// the advertised framebuffer dimensions.
    async fn complete_handshake(client: &mut (impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin)) -> (u16, u16) {
        let _banner = read_exact_vec(client, 12).await;
        client.write_all(b"RFB 003.008\n").await.unwrap();
        let methods = read_exact_vec(client, 2).await;
        assert_eq!(methods[0], 1, "expected exactly one security type offered");
        client.write_all(&[methods[1]]).await.unwrap();
        let _sec_result = read_exact_vec(client, 4).await;
        client.write_all(&[1]).await.unwrap(); // ClientInit: shared

        let header = read_exact_vec(client, 24).await;
        let mut cursor = Bytes::from(header);
        let width = cursor.get_u16();
        let height = cursor.get_u16();
        cursor.advance(16); // pixel format
        let name_len = cursor.get_u32() as usize;
        let _name = read_exact_vec(client, name_len).await;
        (width, height)
    }

    fn update_request_bytes(incremental: bool, x: u16, y: u16, width: u16, height: u16) -> [u8; 10] {
        let mut bytes = [0u8; 10];
        bytes[0] = CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST;
        bytes[1] = u8::from(incremental);
        bytes[2..4].copy_from_slice(&x.to_be_bytes());
        bytes[4..6].copy_from_slice(&y.to_be_bytes());
        bytes[6..8].copy_from_slice(&width.to_be_bytes());
        bytes[8..10].copy_from_slice(&height.to_be_bytes());
        bytes
    }

    async fn read_rectangle_header(client: &mut (impl tokio::io::AsyncRead + Unpin)) -> (u16, u16, u16, u16, i32) {
        let bytes = read_exact_vec(client, 12).await;
        let mut cursor = Bytes::from(bytes);
        (cursor.get_u16(), cursor.get_u16(), cursor.get_u16(), cursor.get_u16(), cursor.get_i32())
    }

    #[tokio::test]
    async fn handshake_with_none_auth_reaches_running() {
        let capture: Arc<dyn CaptureSource> = Arc::new(FixedCapture {
            width: 2,
            height: 1,
            format: PixelFormat::rgbx8888(),
            pixels: vec![0xFF, 0, 0, 0xFF, 0, 0xFF, 0, 0xFF],
            name: "t".into(),
        });
        let connected = Arc::new(AtomicBool::new(false));
        let connected2 = connected.clone();
        let listeners = Listeners::default().on_connected(move || connected2.store(true, Ordering::SeqCst));

        let (client_side, server_side) = duplex(4096);
        let session = Session::new(server_side, capture, None, listeners, SessionOptions::default());
        let server_task = tokio::spawn(session.run());

        let mut client = client_side;
        let banner = read_exact_vec(&mut client, 12).await;
        assert_eq!(&banner, b"RFB 003.008\n");
        client.write_all(b"RFB 003.008\n").await.unwrap();

        let methods = read_exact_vec(&mut client, 2).await;
        assert_eq!(methods, vec![1, 1]); // one method, None

        client.write_all(&[1]).await.unwrap();
        let sec_result = read_exact_vec(&mut client, 4).await;
        assert_eq!(sec_result, vec![0, 0, 0, 0]);

        client.write_all(&[1]).await.unwrap(); // ClientInit: shared

        let header = read_exact_vec(&mut client, 24).await; // w,h,pf,namelen
        let mut cursor = Bytes::from(header);
        let width = cursor.get_u16();
        let height = cursor.get_u16();
        assert_eq!((width, height), (2, 1));
        cursor.advance(16); // pixel format
        let name_len = cursor.get_u32();
        assert_eq!(name_len, 1);
        let name = read_exact_vec(&mut client, 1).await;
        assert_eq!(name, b"t");

        client.shutdown().await.unwrap();
        let _ = server_task.await.unwrap();
        assert!(connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn bad_version_closes_without_connected() {
        let capture: Arc<dyn CaptureSource> = Arc::new(FixedCapture {
            width: 1,
            height: 1,
            format: PixelFormat::rgbx8888(),
            pixels: vec![0, 0, 0, 0],
            name: String::new(),
        });
        let (client_side, server_side) = duplex(4096);
        let failed = Arc::new(AtomicBool::new(false));
        let failed2 = failed.clone();
        let listeners = Listeners::default().on_connection_failed(move |_| failed2.store(true, Ordering::SeqCst));
        let session = Session::new(server_side, capture, None, listeners, SessionOptions::default());
        let server_task = tokio::spawn(session.run());

        let mut client = client_side;
        let _banner = read_exact_vec(&mut client, 12).await;
        client.write_all(b"RFB 003.003\n").await.unwrap();

        let methods = read_exact_vec(&mut client, 1).await;
        assert_eq!(methods, vec![0]); // zero security types offered

        let _ = server_task.await.unwrap();
        assert!(failed.load(Ordering::SeqCst));
    }

    #[test]
    fn client_state_default_selects_raw() {
        let state = ClientState::default();
        assert_eq!(state.selected_encoder, ENCODING_RAW);
    }

    #[tokio::test]
    async fn non_incremental_request_sends_raw_rectangle() {
        let pixels = vec![0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22, 0x33, 0x44];
        let capture: Arc<dyn CaptureSource> = Arc::new(FixedCapture {
            width: 2,
            height: 1,
            format: PixelFormat::rgbx8888(),
            pixels: pixels.clone(),
            name: String::new(),
        });
        let (client_side, server_side) = duplex(4096);
        let session = Session::new(server_side, capture, None, Listeners::default(), SessionOptions::default());
        let server_task = tokio::spawn(session.run());

        let mut client = client_side;
        let (width, height) = complete_handshake(&mut client).await;
        assert_eq!((width, height), (2, 1));

        client.write_all(&update_request_bytes(false, 0, 0, width, height)).await.unwrap();

        let msg_type = read_exact_vec(&mut client, 1).await[0];
        assert_eq!(msg_type, SERVER_MSG_FRAMEBUFFER_UPDATE);
        let _pad = read_exact_vec(&mut client, 1).await;
        let rect_count = Bytes::from(read_exact_vec(&mut client, 2).await).get_u16();
        assert_eq!(rect_count, 1);

        let (x, y, w, h, encoding) = read_rectangle_header(&mut client).await;
        assert_eq!((x, y, w, h, encoding), (0, 0, width, height, ENCODING_RAW));
        let body = read_exact_vec(&mut client, pixels.len()).await;
        assert_eq!(body, pixels);

        client.shutdown().await.unwrap();
        let _ = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn move_hint_with_copyrect_negotiated_sends_copyrect_rectangle() {
        let pixels = vec![0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80];
        let calls = Arc::new(AtomicUsize::new(0));

        struct HintedCapture {
            width: u16,
            height: u16,
            format: PixelFormat,
            pixels: Vec<u8>,
            calls: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl CaptureSource for HintedCapture {
            async fn capture(&self) -> std::result::Result<CapturedFramebuffer, String> {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                let stride = usize::from(self.width) * self.format.bytes_per_pixel();
                let hints = (call > 0).then(|| crate::framebuffer::CaptureHints {
                    moved_rects: vec![crate::framebuffer::MoveRect {
                        src: Rectangle::new(0, 0, i32::from(self.width), i32::from(self.height)),
                        dst_x: 0,
                        dst_y: 0,
                    }],
                    dirty_rects: Vec::new(),
                    pointer: None,
                });
                Ok(CapturedFramebuffer {
                    width: self.width,
                    height: self.height,
                    pixel_format: self.format.clone(),
                    stride,
                    data: Bytes::from(self.pixels.clone()),
                    hints,
                })
            }
        }

        let capture: Arc<dyn CaptureSource> =
            Arc::new(HintedCapture { width: 2, height: 1, format: PixelFormat::rgbx8888(), pixels, calls: calls.clone() });
        let (client_side, server_side) = duplex(4096);
        let session = Session::new(server_side, capture, None, Listeners::default(), SessionOptions::default());
        let server_task = tokio::spawn(session.run());

        let mut client = client_side;
        let (width, height) = complete_handshake(&mut client).await;

        // Negotiate Raw + CopyRect, then establish a baseline snapshot with
        // a non-incremental request.
        let mut set_encodings = vec![CLIENT_MSG_SET_ENCODINGS, 0, 0, 2];
        set_encodings.extend_from_slice(&ENCODING_RAW.to_be_bytes());
        set_encodings.extend_from_slice(&ENCODING_COPYRECT.to_be_bytes());
        client.write_all(&set_encodings).await.unwrap();
        client.write_all(&update_request_bytes(false, 0, 0, width, height)).await.unwrap();

        let msg_type = read_exact_vec(&mut client, 1).await[0];
        assert_eq!(msg_type, SERVER_MSG_FRAMEBUFFER_UPDATE);
        let _pad = read_exact_vec(&mut client, 1).await;
        let rect_count = Bytes::from(read_exact_vec(&mut client, 2).await).get_u16();
        assert_eq!(rect_count, 1);
        let (.., encoding) = read_rectangle_header(&mut client).await;
        assert_eq!(encoding, ENCODING_RAW);
        let _body = read_exact_vec(&mut client, usize::from(width) * usize::from(height) * 4).await;

        // Second, incremental request: the capture now reports the whole
        // frame as a no-op move, which the cache turns into CopyRect.
        client.write_all(&update_request_bytes(true, 0, 0, width, height)).await.unwrap();

        let msg_type = read_exact_vec(&mut client, 1).await[0];
        assert_eq!(msg_type, SERVER_MSG_FRAMEBUFFER_UPDATE);
        let _pad = read_exact_vec(&mut client, 1).await;
        let rect_count = Bytes::from(read_exact_vec(&mut client, 2).await).get_u16();
        assert_eq!(rect_count, 1);
        let (x, y, w, h, encoding) = read_rectangle_header(&mut client).await;
        assert_eq!((x, y, w, h, encoding), (0, 0, width, height, ENCODING_COPYRECT));
        let body = read_exact_vec(&mut client, 4).await;
        assert_eq!(body, vec![0, 0, 0, 0]); // src_x, src_y both 0

        client.shutdown().await.unwrap();
        let _ = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn set_desktop_size_reports_extended_desktop_size() {
        struct ResizableCapture;

        #[async_trait]
        impl CaptureSource for ResizableCapture {
            async fn capture(&self) -> std::result::Result<CapturedFramebuffer, String> {
                Ok(CapturedFramebuffer {
                    width: 4,
                    height: 4,
                    pixel_format: PixelFormat::rgbx8888(),
                    stride: 16,
                    data: Bytes::from(vec![0u8; 16 * 4]),
                    hints: None,
                })
            }

            fn supports_resizing(&self) -> bool {
                true
            }

            async fn set_desktop_size(&self, _width: u16, _height: u16) -> DesktopSizeStatus {
                DesktopSizeStatus::Success
            }
        }

        let capture: Arc<dyn CaptureSource> = Arc::new(ResizableCapture);
        let (client_side, server_side) = duplex(4096);
        let session = Session::new(server_side, capture, None, Listeners::default(), SessionOptions::default());
        let server_task = tokio::spawn(session.run());

        let mut client = client_side;
        let _ = complete_handshake(&mut client).await;

        let mut set_desktop_size = vec![CLIENT_MSG_SET_DESKTOP_SIZE, 0];
        set_desktop_size.extend_from_slice(&8u16.to_be_bytes());
        set_desktop_size.extend_from_slice(&6u16.to_be_bytes());
        set_desktop_size.push(0); // num_screens
        set_desktop_size.push(0); // padding
        client.write_all(&set_desktop_size).await.unwrap();

        let msg_type = read_exact_vec(&mut client, 1).await[0];
        assert_eq!(msg_type, SERVER_MSG_FRAMEBUFFER_UPDATE);
        let _pad = read_exact_vec(&mut client, 1).await;
        let rect_count = Bytes::from(read_exact_vec(&mut client, 2).await).get_u16();
        assert_eq!(rect_count, 1);

        let (reason, status, width, height, encoding) = read_rectangle_header(&mut client).await;
        assert_eq!(encoding, ENCODING_EXTENDED_DESKTOP_SIZE);
        assert_eq!(reason, DesktopSizeReason::Client as u16);
        assert_eq!(status, DesktopSizeStatus::Success as u16);
        assert_eq!((width, height), (8, 6));

        let num_screens = read_exact_vec(&mut client, 1).await[0];
        assert_eq!(num_screens, 1);
        let _pad = read_exact_vec(&mut client, 3).await;
        let screen = read_exact_vec(&mut client, 16).await;
        let mut cursor = Bytes::from(screen);
        assert_eq!(cursor.get_u32(), 0); // screen id
        assert_eq!(cursor.get_u16(), 0);
        assert_eq!(cursor.get_u16(), 0);
        assert_eq!(cursor.get_u16(), 8);
        assert_eq!(cursor.get_u16(), 6);

        client.shutdown().await.unwrap();
        let _ = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn bell_interleaves_safely_with_pending_update() {
        let capture: Arc<dyn CaptureSource> = Arc::new(FixedCapture {
            width: 1,
            height: 1,
            format: PixelFormat::rgbx8888(),
            pixels: vec![0x11, 0x22, 0x33, 0x44],
            name: String::new(),
        });
        let (client_side, server_side) = duplex(4096);
        let session = Session::new(server_side, capture, None, Listeners::default(), SessionOptions::default());
        let handle = session.handle();
        let server_task = tokio::spawn(session.run());

        let mut client = client_side;
        let (width, height) = complete_handshake(&mut client).await;

        client.write_all(&update_request_bytes(false, 0, 0, width, height)).await.unwrap();
        handle.bell().await.unwrap();

        let mut saw_bell = false;
        let mut saw_update = false;
        for _ in 0..2 {
            let opcode = read_exact_vec(&mut client, 1).await[0];
            match opcode {
                SERVER_MSG_BELL => saw_bell = true,
                SERVER_MSG_FRAMEBUFFER_UPDATE => {
                    saw_update = true;
                    let _pad = read_exact_vec(&mut client, 1).await;
                    let rect_count = Bytes::from(read_exact_vec(&mut client, 2).await).get_u16();
                    assert_eq!(rect_count, 1);
                    let (.., encoding) = read_rectangle_header(&mut client).await;
                    assert_eq!(encoding, ENCODING_RAW);
                    let _body = read_exact_vec(&mut client, 4).await;
                }
                other => panic!("unexpected opcode {other}"),
            }
        }
        assert!(saw_bell, "Bell never arrived");
        assert!(saw_update, "FramebufferUpdate never arrived");

        client.shutdown().await.unwrap();
        let _ = server_task.await.unwrap();
    }
}
