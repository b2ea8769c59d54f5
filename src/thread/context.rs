// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! State owned by the DRM thread and the operations run on it.

use std::fs::File;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::sync::Arc;

use crate::device_manager::DrmDeviceGenerator;
use crate::device_manager::DrmDeviceManager;
use crate::display::ColorCorrection;
use crate::display::DisplayMode;
use crate::display::DisplaySnapshot;
use crate::display::HdcpState;
use crate::display_manager::DrmGpuDisplayManager;
use crate::gbm::BufferFormat;
use crate::gbm::BufferUsage;
use crate::gbm::GbmBuffer;
use crate::gbm::NativePixmapHandle;
use crate::overlay::check_overlay_capabilities;
use crate::overlay::OverlayStatus;
use crate::overlay::OverlaySurfaceCandidate;
use crate::screen::CursorBitmap;
use crate::screen::DrmWindow;
use crate::screen::OverlayPlane;
use crate::screen::ScreenManager;
use crate::screen::SwapCompletionCallback;
use crate::Fourcc;
use crate::Point;
use crate::Rect;
use crate::Size;
use crate::Widget;

/// Everything the DRM thread owns. Only ever touched from that thread.
pub struct DrmThreadContext {
    device_manager: DrmDeviceManager,
    screen_manager: ScreenManager,
    display_manager: DrmGpuDisplayManager,
    /// Bumped whenever the set of devices changes, so the event loop knows to rewatch their fds.
    device_generation: u64,
}

impl std::fmt::Debug for DrmThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmThreadContext")
            .field("device_manager", &self.device_manager)
            .field("screen_manager", &self.screen_manager)
            .field("display_manager", &self.display_manager)
            .finish()
    }
}

impl DrmThreadContext {
    pub fn new(generator: Box<dyn DrmDeviceGenerator>, use_atomic: bool) -> Self {
        Self {
            device_manager: DrmDeviceManager::new(generator, use_atomic),
            screen_manager: ScreenManager::new(),
            display_manager: DrmGpuDisplayManager::new(),
            device_generation: 0,
        }
    }

    pub fn device_manager(&self) -> &DrmDeviceManager {
        &self.device_manager
    }

    pub fn screen_manager(&self) -> &ScreenManager {
        &self.screen_manager
    }

    pub(crate) fn device_generation(&self) -> u64 {
        self.device_generation
    }

    /// File descriptors signalling DRM events, one per device in device order.
    pub(crate) fn device_fds(&self) -> Vec<BorrowedFd<'_>> {
        self.device_manager.devices().iter().map(|d| d.poll_fd()).collect()
    }

    /// Dispatches the kernel events of the `index`th device.
    pub(crate) fn process_device_events(&self, index: usize) {
        let Some(drm) = self.device_manager.devices().get(index) else {
            return;
        };
        if let Err(e) = drm.process_events() {
            log::error!("Failed to process events of {}: {e}", drm.path().display());
        }
    }

    pub fn add_graphics_device(&mut self, path: &Path, file: File) -> bool {
        match self.device_manager.add_drm_device(path, file) {
            Ok(_) => {
                self.device_generation += 1;
                true
            }
            Err(e) => {
                log::error!("Failed to add graphics device {}: {e}", path.display());
                false
            }
        }
    }

    /// Drops the device at `path`. Windows waiting on a flip of its displays get
    /// [`SwapResult::Failed`](crate::screen::SwapResult::Failed).
    pub fn remove_graphics_device(&mut self, path: &Path) {
        let Some(drm) = self.device_manager.get_drm_device(path).cloned() else {
            log::warn!("Removing unknown graphics device {}", path.display());
            return;
        };
        self.screen_manager.remove_display_controllers_on(&drm);
        self.device_manager.remove_drm_device(path);
        self.device_generation += 1;
    }

    /// Allocates a buffer on the device `widget` renders on. `None` means the allocation is
    /// dropped.
    pub fn create_buffer(
        &self,
        widget: Widget,
        size: Size,
        format: BufferFormat,
        usage: BufferUsage,
    ) -> Option<Arc<GbmBuffer>> {
        let drm = self.device_manager.get_drm_device_for_widget(widget)?;
        GbmBuffer::create(drm, Fourcc::from(format), size, usage)
            .map_err(|e| log::error!("Failed to create {format:?} {size} buffer: {e}"))
            .ok()
    }

    pub fn create_buffer_from_handle(
        &self,
        widget: Widget,
        size: Size,
        format: BufferFormat,
        handle: NativePixmapHandle,
    ) -> Option<Arc<GbmBuffer>> {
        let drm = self.device_manager.get_drm_device_for_widget(widget)?;
        GbmBuffer::create_from_handle(drm, Fourcc::from(format), size, handle, BufferUsage::Scanout)
            .map_err(|e| log::error!("Failed to import {format:?} {size} buffer: {e}"))
            .ok()
    }

    pub fn create_window(&mut self, widget: Widget, bounds: Rect) {
        let mut window = DrmWindow::new(widget);
        window.set_bounds(bounds);
        self.screen_manager.add_window(window);
    }

    pub fn destroy_window(&mut self, widget: Widget) {
        if self.screen_manager.remove_window(widget).is_none() {
            log::warn!("Destroying unknown window {widget}");
        }
        self.device_manager.update_drm_device(widget, None);
    }

    pub fn set_window_bounds(&mut self, widget: Widget, bounds: Rect) {
        self.screen_manager.set_window_bounds(widget, bounds);
    }

    pub fn schedule_page_flip(
        &mut self,
        widget: Widget,
        planes: Vec<OverlayPlane>,
        callback: SwapCompletionCallback,
    ) {
        self.screen_manager.schedule_page_flip(widget, planes, callback);
    }

    pub fn check_overlay_capabilities(
        &self,
        widget: Widget,
        candidates: &[OverlaySurfaceCandidate],
    ) -> Vec<OverlayStatus> {
        check_overlay_capabilities(self.screen_manager.get_window_controller(widget), candidates)
    }

    pub fn set_cursor(&mut self, widget: Widget, bitmap: Option<CursorBitmap>, location: Point) {
        self.screen_manager.set_cursor(widget, bitmap, location);
    }

    pub fn move_cursor(&mut self, widget: Widget, location: Point) {
        self.screen_manager.move_cursor(widget, location);
    }

    pub fn refresh_native_displays(&mut self) -> Vec<DisplaySnapshot> {
        self.display_manager.refresh_native_displays(&self.device_manager, &mut self.screen_manager)
    }

    pub fn configure_native_display(
        &mut self,
        display_id: i64,
        mode: &DisplayMode,
        origin: Point,
    ) -> bool {
        self.display_manager
            .configure_display(display_id, mode, origin, &mut self.screen_manager)
            .map_err(|e| log::error!("Failed to configure display {display_id}: {e}"))
            .is_ok()
    }

    pub fn disable_native_display(&mut self, display_id: i64) -> bool {
        self.display_manager
            .disable_display(display_id, &mut self.screen_manager)
            .map_err(|e| log::error!("Failed to disable display {display_id}: {e}"))
            .is_ok()
    }

    pub fn take_display_control(&self) -> bool {
        self.display_manager.take_display_control(&self.device_manager)
    }

    pub fn relinquish_display_control(&self) -> bool {
        self.display_manager.relinquish_display_control(&self.device_manager)
    }

    pub fn get_hdcp_state(&self, display_id: i64) -> Option<HdcpState> {
        self.display_manager
            .get_hdcp_state(display_id)
            .map_err(|e| log::error!("Failed to get HDCP state of display {display_id}: {e}"))
            .ok()
    }

    pub fn set_hdcp_state(&self, display_id: i64, state: HdcpState) -> bool {
        self.display_manager
            .set_hdcp_state(display_id, state)
            .map_err(|e| log::error!("Failed to set HDCP state of display {display_id}: {e}"))
            .is_ok()
    }

    pub fn set_color_correction(&self, display_id: i64, correction: &ColorCorrection) {
        // Failures are already logged.
        let _ = self.display_manager.set_color_correction(display_id, correction);
    }
}
