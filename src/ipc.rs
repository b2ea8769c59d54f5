// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Message based transport between the host (browser) side and the GPU side.
//!
//! The host sends [`GpuMessage`]s and gets [`HostMessage`]s back. Replies arrive in request order
//! for each kind of request, which is how [`GpuPlatformSupportHost`] matches them to callbacks.

use std::collections::VecDeque;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::sync::Mutex;

use crate::display::ColorCorrection;
use crate::display::DisplayMode;
use crate::display::DisplaySnapshot;
use crate::display::HdcpState;
use crate::overlay::OverlayStatus;
use crate::overlay::OverlayStatusCallback;
use crate::overlay::OverlaySurfaceCandidate;
use crate::overlay::OverlayValidator;
use crate::screen::CursorBitmap;
use crate::thread::DrmThreadProxy;
use crate::Point;
use crate::Rect;
use crate::Widget;

/// Requests from the host to the GPU side.
#[derive(Debug)]
pub enum GpuMessage {
    AddGraphicsDevice { path: PathBuf, fd: OwnedFd },
    RemoveGraphicsDevice { path: PathBuf },
    CreateWindow { widget: Widget, bounds: Rect },
    DestroyWindow { widget: Widget },
    SetWindowBounds { widget: Widget, bounds: Rect },
    SetCursor { widget: Widget, bitmap: Option<CursorBitmap>, location: Point },
    MoveCursor { widget: Widget, location: Point },
    CheckOverlayCapabilities { widget: Widget, candidates: Vec<OverlaySurfaceCandidate> },
    RefreshNativeDisplays,
    ConfigureNativeDisplay { display_id: i64, mode: DisplayMode, origin: Point },
    DisableNativeDisplay { display_id: i64 },
    TakeDisplayControl,
    RelinquishDisplayControl,
    GetHdcpState { display_id: i64 },
    SetHdcpState { display_id: i64, state: HdcpState },
    SetColorCorrection { display_id: i64, correction: ColorCorrection },
}

/// Replies from the GPU side to the host.
#[derive(Clone, Debug, PartialEq)]
pub enum HostMessage {
    OverlayCapabilitiesReceived {
        widget: Widget,
        candidates: Vec<OverlaySurfaceCandidate>,
        status: Vec<OverlayStatus>,
    },
    UpdateNativeDisplays(Vec<DisplaySnapshot>),
    DisplayConfigured { display_id: i64, success: bool },
    DisplayDisabled { display_id: i64, success: bool },
    DisplayControlTaken(bool),
    DisplayControlRelinquished(bool),
    HdcpStateReceived { display_id: i64, state: Option<HdcpState> },
    HdcpStateUpdated { display_id: i64, success: bool },
}

/// GPU side endpoint: turns [`GpuMessage`]s into calls on the DRM thread and sends the results
/// back as [`HostMessage`]s.
#[derive(Debug)]
pub struct GpuPlatformSupport {
    proxy: DrmThreadProxy,
    host: Sender<HostMessage>,
}

impl GpuPlatformSupport {
    pub fn new(proxy: DrmThreadProxy, host: Sender<HostMessage>) -> Self {
        Self { proxy, host }
    }

    /// Handles messages until the host hangs up.
    pub fn serve(&self, receiver: Receiver<GpuMessage>) {
        for message in receiver {
            self.handle_message(message);
        }
        log::debug!("Host channel closed");
    }

    fn reply(&self) -> impl FnOnce(HostMessage) + Send + 'static {
        let host = self.host.clone();
        move |message| {
            if let Err(e) = host.send(message) {
                log::warn!("Dropping reply to a closed host channel: {:?}", e.0);
            }
        }
    }

    pub fn handle_message(&self, message: GpuMessage) {
        log::trace!("Handling {message:?}");
        match message {
            GpuMessage::AddGraphicsDevice { path, fd } => {
                self.proxy.add_graphics_device(path, File::from(fd))
            }
            GpuMessage::RemoveGraphicsDevice { path } => self.proxy.remove_graphics_device(path),
            GpuMessage::CreateWindow { widget, bounds } => self.proxy.create_window(widget, bounds),
            GpuMessage::DestroyWindow { widget } => self.proxy.destroy_window(widget),
            GpuMessage::SetWindowBounds { widget, bounds } => {
                self.proxy.set_window_bounds(widget, bounds)
            }
            GpuMessage::SetCursor { widget, bitmap, location } => {
                self.proxy.set_cursor(widget, bitmap, location)
            }
            GpuMessage::MoveCursor { widget, location } => self.proxy.move_cursor(widget, location),
            GpuMessage::CheckOverlayCapabilities { widget, candidates } => {
                let reply = self.reply();
                let request = candidates.clone();
                self.proxy.request_validation(
                    widget,
                    request,
                    Box::new(move |status| {
                        reply(HostMessage::OverlayCapabilitiesReceived {
                            widget,
                            candidates,
                            status,
                        })
                    }),
                );
            }
            GpuMessage::RefreshNativeDisplays => {
                let reply = self.reply();
                self.proxy.refresh_native_displays(move |displays| {
                    reply(HostMessage::UpdateNativeDisplays(displays))
                });
            }
            GpuMessage::ConfigureNativeDisplay { display_id, mode, origin } => {
                let reply = self.reply();
                self.proxy.configure_native_display(
                    display_id,
                    mode,
                    origin,
                    move |(display_id, success)| {
                        reply(HostMessage::DisplayConfigured { display_id, success })
                    },
                );
            }
            GpuMessage::DisableNativeDisplay { display_id } => {
                let reply = self.reply();
                self.proxy.disable_native_display(display_id, move |(display_id, success)| {
                    reply(HostMessage::DisplayDisabled { display_id, success })
                });
            }
            GpuMessage::TakeDisplayControl => {
                let reply = self.reply();
                self.proxy.take_display_control(move |success| {
                    reply(HostMessage::DisplayControlTaken(success))
                });
            }
            GpuMessage::RelinquishDisplayControl => {
                let reply = self.reply();
                self.proxy.relinquish_display_control(move |success| {
                    reply(HostMessage::DisplayControlRelinquished(success))
                });
            }
            GpuMessage::GetHdcpState { display_id } => {
                let reply = self.reply();
                self.proxy.get_hdcp_state(display_id, move |(display_id, state)| {
                    reply(HostMessage::HdcpStateReceived { display_id, state })
                });
            }
            GpuMessage::SetHdcpState { display_id, state } => {
                let reply = self.reply();
                self.proxy.set_hdcp_state(display_id, state, move |(display_id, success)| {
                    reply(HostMessage::HdcpStateUpdated { display_id, success })
                });
            }
            GpuMessage::SetColorCorrection { display_id, correction } => {
                self.proxy.set_color_correction(display_id, correction)
            }
        }
    }
}

pub type DisplaysCallback = Box<dyn FnOnce(Vec<DisplaySnapshot>) + Send + 'static>;
pub type DisplayResultCallback = Box<dyn FnOnce(i64, bool) + Send + 'static>;
pub type HdcpStateCallback = Box<dyn FnOnce(i64, Option<HdcpState>) + Send + 'static>;
pub type ResultCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Callbacks waiting for a reply, oldest first.
#[derive(Default)]
struct PendingCallbacks {
    overlays: VecDeque<(Widget, OverlayStatusCallback)>,
    displays: VecDeque<DisplaysCallback>,
    configure: VecDeque<(i64, DisplayResultCallback)>,
    disable: VecDeque<(i64, DisplayResultCallback)>,
    take_control: VecDeque<ResultCallback>,
    relinquish_control: VecDeque<ResultCallback>,
    get_hdcp: VecDeque<(i64, HdcpStateCallback)>,
    set_hdcp: VecDeque<(i64, DisplayResultCallback)>,
}

impl PendingCallbacks {
    fn take_for<C>(queue: &mut VecDeque<(i64, C)>, display_id: i64) -> Option<C> {
        let index = queue.iter().position(|(id, _)| *id == display_id)?;
        queue.remove(index).map(|(_, callback)| callback)
    }
}

/// Host side endpoint. Sends requests and runs the matching callback when a reply is handed to
/// [`GpuPlatformSupportHost::handle_message`].
///
/// If the GPU side is gone, callbacks run right away with a failure result.
pub struct GpuPlatformSupportHost {
    gpu: Sender<GpuMessage>,
    pending: Mutex<PendingCallbacks>,
}

impl std::fmt::Debug for GpuPlatformSupportHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuPlatformSupportHost").finish_non_exhaustive()
    }
}

impl GpuPlatformSupportHost {
    pub fn new(gpu: Sender<GpuMessage>) -> Self {
        Self { gpu, pending: Default::default() }
    }

    fn send(&self, message: GpuMessage) -> bool {
        match self.gpu.send(message) {
            Ok(()) => true,
            Err(e) => {
                log::error!("GPU channel closed, dropping {:?}", e.0);
                false
            }
        }
    }

    pub fn add_graphics_device(&self, path: PathBuf, fd: OwnedFd) {
        self.send(GpuMessage::AddGraphicsDevice { path, fd });
    }

    pub fn remove_graphics_device(&self, path: PathBuf) {
        self.send(GpuMessage::RemoveGraphicsDevice { path });
    }

    pub fn create_window(&self, widget: Widget, bounds: Rect) {
        self.send(GpuMessage::CreateWindow { widget, bounds });
    }

    pub fn destroy_window(&self, widget: Widget) {
        self.send(GpuMessage::DestroyWindow { widget });
    }

    pub fn set_window_bounds(&self, widget: Widget, bounds: Rect) {
        self.send(GpuMessage::SetWindowBounds { widget, bounds });
    }

    pub fn set_cursor(&self, widget: Widget, bitmap: Option<CursorBitmap>, location: Point) {
        self.send(GpuMessage::SetCursor { widget, bitmap, location });
    }

    pub fn move_cursor(&self, widget: Widget, location: Point) {
        self.send(GpuMessage::MoveCursor { widget, location });
    }

    pub fn set_color_correction(&self, display_id: i64, correction: ColorCorrection) {
        self.send(GpuMessage::SetColorCorrection { display_id, correction });
    }

    // Callbacks are queued before their request goes out.

    pub fn refresh_native_displays(&self, callback: DisplaysCallback) {
        self.pending.lock().unwrap().displays.push_back(callback);
        if !self.send(GpuMessage::RefreshNativeDisplays) {
            if let Some(callback) = self.pending.lock().unwrap().displays.pop_back() {
                callback(vec![]);
            }
        }
    }

    pub fn configure_native_display(
        &self,
        display_id: i64,
        mode: DisplayMode,
        origin: Point,
        callback: DisplayResultCallback,
    ) {
        self.pending.lock().unwrap().configure.push_back((display_id, callback));
        if !self.send(GpuMessage::ConfigureNativeDisplay { display_id, mode, origin }) {
            self.fail_display_result(display_id, |p| &mut p.configure);
        }
    }

    pub fn disable_native_display(&self, display_id: i64, callback: DisplayResultCallback) {
        self.pending.lock().unwrap().disable.push_back((display_id, callback));
        if !self.send(GpuMessage::DisableNativeDisplay { display_id }) {
            self.fail_display_result(display_id, |p| &mut p.disable);
        }
    }

    pub fn set_hdcp_state(
        &self,
        display_id: i64,
        state: HdcpState,
        callback: DisplayResultCallback,
    ) {
        self.pending.lock().unwrap().set_hdcp.push_back((display_id, callback));
        if !self.send(GpuMessage::SetHdcpState { display_id, state }) {
            self.fail_display_result(display_id, |p| &mut p.set_hdcp);
        }
    }

    fn fail_display_result<F>(&self, display_id: i64, queue: F)
    where
        F: FnOnce(&mut PendingCallbacks) -> &mut VecDeque<(i64, DisplayResultCallback)>,
    {
        let callback = {
            let mut pending = self.pending.lock().unwrap();
            let queue = queue(&mut pending);
            // The entry just queued is the newest one for this display.
            let index = queue.iter().rposition(|(id, _)| *id == display_id);
            index.and_then(|i| queue.remove(i)).map(|(_, callback)| callback)
        };
        if let Some(callback) = callback {
            callback(display_id, false);
        }
    }

    pub fn get_hdcp_state(&self, display_id: i64, callback: HdcpStateCallback) {
        self.pending.lock().unwrap().get_hdcp.push_back((display_id, callback));
        if !self.send(GpuMessage::GetHdcpState { display_id }) {
            let callback = {
                let mut pending = self.pending.lock().unwrap();
                let index = pending.get_hdcp.iter().rposition(|(id, _)| *id == display_id);
                index.and_then(|i| pending.get_hdcp.remove(i)).map(|(_, callback)| callback)
            };
            if let Some(callback) = callback {
                callback(display_id, None);
            }
        }
    }

    pub fn take_display_control(&self, callback: ResultCallback) {
        self.pending.lock().unwrap().take_control.push_back(callback);
        if !self.send(GpuMessage::TakeDisplayControl) {
            if let Some(callback) = self.pending.lock().unwrap().take_control.pop_back() {
                callback(false);
            }
        }
    }

    pub fn relinquish_display_control(&self, callback: ResultCallback) {
        self.pending.lock().unwrap().relinquish_control.push_back(callback);
        if !self.send(GpuMessage::RelinquishDisplayControl) {
            if let Some(callback) = self.pending.lock().unwrap().relinquish_control.pop_back() {
                callback(false);
            }
        }
    }

    /// Runs the callback waiting for `message`. Callbacks run without the internal lock held, so
    /// they may issue new requests.
    pub fn handle_message(&self, message: HostMessage) {
        let mut pending = self.pending.lock().unwrap();
        match message {
            HostMessage::OverlayCapabilitiesReceived { widget, status, .. } => {
                let index = pending.overlays.iter().position(|(w, _)| *w == widget);
                let callback = index.and_then(|i| pending.overlays.remove(i));
                drop(pending);
                match callback {
                    Some((_, callback)) => callback(status),
                    None => log::warn!("Unexpected overlay reply for window {widget}"),
                }
            }
            HostMessage::UpdateNativeDisplays(displays) => {
                let callback = pending.displays.pop_front();
                drop(pending);
                match callback {
                    Some(callback) => callback(displays),
                    None => log::debug!("Unsolicited display update"),
                }
            }
            HostMessage::DisplayConfigured { display_id, success } => {
                let callback = PendingCallbacks::take_for(&mut pending.configure, display_id);
                drop(pending);
                match callback {
                    Some(callback) => callback(display_id, success),
                    None => log::warn!("Unexpected configure reply for display {display_id}"),
                }
            }
            HostMessage::DisplayDisabled { display_id, success } => {
                let callback = PendingCallbacks::take_for(&mut pending.disable, display_id);
                drop(pending);
                match callback {
                    Some(callback) => callback(display_id, success),
                    None => log::warn!("Unexpected disable reply for display {display_id}"),
                }
            }
            HostMessage::DisplayControlTaken(success) => {
                let callback = pending.take_control.pop_front();
                drop(pending);
                match callback {
                    Some(callback) => callback(success),
                    None => log::warn!("Unexpected display control reply"),
                }
            }
            HostMessage::DisplayControlRelinquished(success) => {
                let callback = pending.relinquish_control.pop_front();
                drop(pending);
                match callback {
                    Some(callback) => callback(success),
                    None => log::warn!("Unexpected display control reply"),
                }
            }
            HostMessage::HdcpStateReceived { display_id, state } => {
                let callback = PendingCallbacks::take_for(&mut pending.get_hdcp, display_id);
                drop(pending);
                match callback {
                    Some(callback) => callback(display_id, state),
                    None => log::warn!("Unexpected HDCP state for display {display_id}"),
                }
            }
            HostMessage::HdcpStateUpdated { display_id, success } => {
                let callback = PendingCallbacks::take_for(&mut pending.set_hdcp, display_id);
                drop(pending);
                match callback {
                    Some(callback) => callback(display_id, success),
                    None => log::warn!("Unexpected HDCP update for display {display_id}"),
                }
            }
        }
    }
}

impl OverlayValidator for GpuPlatformSupportHost {
    fn request_validation(
        &self,
        widget: Widget,
        candidates: Vec<OverlaySurfaceCandidate>,
        callback: OverlayStatusCallback,
    ) {
        let count = candidates.len();
        self.pending.lock().unwrap().overlays.push_back((widget, callback));
        if !self.send(GpuMessage::CheckOverlayCapabilities { widget, candidates }) {
            let callback = {
                let mut pending = self.pending.lock().unwrap();
                let index = pending.overlays.iter().rposition(|(w, _)| *w == widget);
                index.and_then(|i| pending.overlays.remove(i))
            };
            if let Some((_, callback)) = callback {
                callback(vec![OverlayStatus::NotAble; count]);
            }
        }
    }
}
