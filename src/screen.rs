// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Display controllers and the windows presented on them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::drm::plane_manager::CropRect;
use crate::drm::plane_manager::PlaneConfig;
use crate::drm::DrmDevice;
use crate::drm::DrmError;
use crate::drm::DrmResult;
use crate::drm::ModeInfo;
use crate::gbm::BufferUsage;
use crate::gbm::GbmBuffer;
use crate::Fourcc;
use crate::Point;
use crate::Rect;
use crate::Widget;

pub mod drm_window;
pub mod hardware_display_controller;

pub use drm_window::CursorBitmap;
pub use drm_window::DrmWindow;
pub use hardware_display_controller::CrtcController;
pub use hardware_display_controller::HardwareDisplayController;

/// Outcome of a page flip request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwapResult {
    Ack,
    Failed,
    /// The buffers do not match the display anymore and must be reallocated before the next
    /// frame.
    NakRecreateBuffers,
}

pub type SwapCompletionCallback = Box<dyn FnOnce(SwapResult) + Send + 'static>;

/// A buffer to present as one layer of a frame.
#[derive(Clone, Debug)]
pub struct OverlayPlane {
    pub buffer: Arc<GbmBuffer>,
    pub z_order: i32,
    /// Where the layer goes, relative to the display.
    pub display_bounds: Rect,
    pub crop: CropRect,
}

impl OverlayPlane {
    pub fn new(buffer: Arc<GbmBuffer>, z_order: i32, display_bounds: Rect, crop: CropRect) -> Self {
        Self { buffer, z_order, display_bounds, crop }
    }

    pub fn to_plane_config(&self) -> PlaneConfig {
        PlaneConfig {
            framebuffer_id: self.buffer.framebuffer_id(),
            format: self.buffer.framebuffer_format().into(),
            z_order: self.z_order,
            display_bounds: self.display_bounds,
            crop: self.crop,
        }
    }
}

/// Keeps track of the display controllers and of which window shows on which of them.
///
/// Windows are matched to controllers by bounds: a window is presented by the enabled controller
/// covering exactly the same area of the desktop. Controllers configured with the same origin and
/// mode are merged into a single mirrored controller.
#[derive(Debug, Default)]
pub struct ScreenManager {
    controllers: Vec<HardwareDisplayController>,
    windows: HashMap<Widget, DrmWindow>,
}

impl ScreenManager {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn controllers(&self) -> &[HardwareDisplayController] {
        &self.controllers
    }

    fn find_controller(&self, drm: &Arc<DrmDevice>, crtc_id: u32) -> Option<usize> {
        self.controllers.iter().position(|c| c.has_crtc(drm, crtc_id))
    }

    fn find_active_controller(&self, bounds: Rect) -> Option<usize> {
        self.controllers.iter().position(|c| !c.is_disabled() && c.bounds() == bounds)
    }

    /// Enabled controller showing exactly `bounds`.
    pub fn get_display_controller(&self, bounds: Rect) -> Option<&HardwareDisplayController> {
        self.find_active_controller(bounds).map(|i| &self.controllers[i])
    }

    /// Starts tracking `crtc_id` driving `connector_id`. The controller stays disabled until
    /// configured.
    pub fn add_display_controller(
        &mut self,
        drm: &Arc<DrmDevice>,
        crtc_id: u32,
        connector_id: u32,
    ) {
        if self.find_controller(drm, crtc_id).is_some() {
            log::debug!("CRTC {crtc_id} on {} is already tracked", drm.path().display());
            return;
        }
        self.controllers.push(HardwareDisplayController::new(
            CrtcController::new(drm.clone(), crtc_id, connector_id),
            Point::default(),
        ));
    }

    /// Stops tracking `crtc_id`. A flip pending on a controller going away reports failure.
    pub fn remove_display_controller(&mut self, drm: &Arc<DrmDevice>, crtc_id: u32) {
        let Some(index) = self.find_controller(drm, crtc_id) else {
            return;
        };
        self.controllers[index].remove_crtc(drm, crtc_id);
        if self.controllers[index].crtc_controllers().is_empty() {
            let controller = self.controllers.remove(index);
            controller.fail_pending_flip();
        }
        self.update_controller_to_window_mapping();
    }

    /// Drops every controller of `drm`, used when the device goes away.
    pub fn remove_display_controllers_on(&mut self, drm: &Arc<DrmDevice>) {
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.controllers)
            .into_iter()
            .partition(|c| c.drm_device().map_or(true, |d| Arc::ptr_eq(d, drm)));
        self.controllers = kept;
        for controller in gone {
            if controller.fail_pending_flip() {
                log::warn!("Dropped a pending page flip of {}", drm.path().display());
            }
        }
        self.update_controller_to_window_mapping();
    }

    /// Shows `mode` on `crtc_id` at `origin` of the desktop, mirroring the controller already
    /// showing the same mode there if any.
    pub fn configure_display_controller(
        &mut self,
        drm: &Arc<DrmDevice>,
        crtc_id: u32,
        origin: Point,
        mode: &ModeInfo,
    ) -> DrmResult<()> {
        let mut index =
            self.find_controller(drm, crtc_id).ok_or(DrmError::NoSuchObject(crtc_id))?;

        let mirror = self.controllers.iter().enumerate().find_map(|(i, c)| {
            let same_device = c.drm_device().map_or(false, |d| Arc::ptr_eq(d, drm));
            (i != index
                && same_device
                && !c.is_disabled()
                && c.origin() == origin
                && c.mode_size() == mode.size())
            .then_some(i)
        });
        if let Some(target) = mirror {
            let result = self.mirror_into(index, target, drm, crtc_id, mode);
            self.update_controller_to_window_mapping();
            return result;
        }

        if self.controllers[index].is_mirrored() {
            log::debug!("Moving CRTC {crtc_id} out of its mirror group");
            if let Some(crtc) = self.controllers[index].remove_crtc(drm, crtc_id) {
                self.controllers.push(HardwareDisplayController::new(crtc, origin));
                index = self.controllers.len() - 1;
            }
        }

        self.controllers[index].set_origin(origin);
        let result = self
            .modeset_plane(drm, origin, mode)
            .and_then(|primary| self.controllers[index].modeset(&primary, mode));
        if let Err(e) = &result {
            log::error!("Failed to modeset CRTC {crtc_id} with {}: {e}", mode.name);
        }
        self.update_controller_to_window_mapping();
        result
    }

    fn mirror_into(
        &mut self,
        index: usize,
        mut target: usize,
        drm: &Arc<DrmDevice>,
        crtc_id: u32,
        mode: &ModeInfo,
    ) -> DrmResult<()> {
        let crtc = self.controllers[index]
            .remove_crtc(drm, crtc_id)
            .ok_or(DrmError::NoSuchObject(crtc_id))?;
        if self.controllers[index].crtc_controllers().is_empty() {
            let controller = self.controllers.remove(index);
            controller.fail_pending_flip();
            if target > index {
                target -= 1;
            }
        }

        log::info!("Mirroring CRTC {crtc_id} with {:?}", self.controllers[target]);
        self.controllers[target].add_crtc(crtc);
        let origin = self.controllers[target].origin();
        let primary = match self.controllers[target]
            .current_planes()
            .into_iter()
            .min_by_key(|p| p.z_order)
        {
            Some(primary) => primary,
            None => self.modeset_plane(drm, origin, mode)?,
        };
        self.controllers[target].modeset(&primary, mode)
    }

    /// Picks the buffer to scan out right after a modeset: the last frame of the window sitting
    /// at `origin` if it fits the mode, a fresh buffer otherwise.
    fn modeset_plane(
        &self,
        drm: &Arc<DrmDevice>,
        origin: Point,
        mode: &ModeInfo,
    ) -> DrmResult<OverlayPlane> {
        let size = mode.size();
        let reusable = self
            .windows
            .values()
            .filter(|w| w.bounds().origin == origin)
            .filter_map(|w| w.last_submitted_planes().iter().min_by_key(|p| p.z_order))
            .find(|p| p.buffer.size() == size && Arc::ptr_eq(p.buffer.drm_device(), drm));
        if let Some(plane) = reusable {
            return Ok(plane.clone());
        }

        let buffer = GbmBuffer::create(drm, Fourcc::from(b"XR24"), size, BufferUsage::Scanout)
            .map_err(|e| DrmError::Other(anyhow::anyhow!(e)))?;
        Ok(OverlayPlane::new(
            buffer,
            0,
            Rect::new(0, 0, size.width, size.height),
            CropRect::from_size(size),
        ))
    }

    /// Turns `crtc_id` off. A mirrored CRTC leaves its group first.
    pub fn disable_display_controller(
        &mut self,
        drm: &Arc<DrmDevice>,
        crtc_id: u32,
    ) -> DrmResult<()> {
        let index = self.find_controller(drm, crtc_id).ok_or(DrmError::NoSuchObject(crtc_id))?;
        let result = if self.controllers[index].is_mirrored() {
            match self.controllers[index].remove_crtc(drm, crtc_id) {
                Some(crtc) => {
                    let origin = self.controllers[index].origin();
                    let mut controller = HardwareDisplayController::new(crtc, origin);
                    let result = controller.disable();
                    self.controllers.push(controller);
                    result
                }
                None => Ok(()),
            }
        } else {
            self.controllers[index].disable()
        };
        self.update_controller_to_window_mapping();
        result
    }

    pub fn add_window(&mut self, window: DrmWindow) {
        let widget = window.widget();
        self.windows.insert(widget, window);
        self.update_window(widget);
    }

    pub fn remove_window(&mut self, widget: Widget) -> Option<DrmWindow> {
        self.windows.remove(&widget)
    }

    pub fn get_window(&self, widget: Widget) -> Option<&DrmWindow> {
        self.windows.get(&widget)
    }

    /// Controller currently presenting `widget`.
    pub fn get_window_controller(&self, widget: Widget) -> Option<&HardwareDisplayController> {
        self.get_display_controller(self.windows.get(&widget)?.bounds())
    }

    pub fn set_window_bounds(&mut self, widget: Widget, bounds: Rect) {
        if let Some(window) = self.windows.get_mut(&widget) {
            window.set_bounds(bounds);
            self.update_window(widget);
        }
    }

    fn update_window(&mut self, widget: Widget) {
        let Some(window) = self.windows.get_mut(&widget) else {
            return;
        };
        let controller = self
            .controllers
            .iter()
            .find(|c| !c.is_disabled() && c.bounds() == window.bounds());
        window.set_controller(controller);
    }

    fn update_controller_to_window_mapping(&mut self) {
        let widgets = self.windows.keys().copied().collect::<Vec<_>>();
        for widget in widgets {
            self.update_window(widget);
        }
    }

    /// Presents `planes` in `widget`. `callback` always runs, with `Failed` for unknown windows.
    pub fn schedule_page_flip(
        &mut self,
        widget: Widget,
        planes: Vec<OverlayPlane>,
        callback: SwapCompletionCallback,
    ) {
        let Some(window) = self.windows.get_mut(&widget) else {
            log::error!("Page flip requested for unknown window {widget}");
            callback(SwapResult::Failed);
            return;
        };
        let bounds = window.bounds();
        let controller =
            self.controllers.iter_mut().find(|c| !c.is_disabled() && c.bounds() == bounds);
        window.schedule_page_flip(planes, callback, controller);
    }

    pub fn test_page_flip(&self, widget: Widget, planes: &[OverlayPlane]) -> bool {
        match self.windows.get(&widget) {
            Some(window) => {
                window.test_page_flip(planes, self.get_display_controller(window.bounds()))
            }
            None => false,
        }
    }

    pub fn set_cursor(&mut self, widget: Widget, bitmap: Option<CursorBitmap>, location: Point) {
        if let Some(window) = self.windows.get_mut(&widget) {
            let bounds = window.bounds();
            let controller =
                self.controllers.iter().find(|c| !c.is_disabled() && c.bounds() == bounds);
            window.set_cursor(bitmap, location, controller);
        }
    }

    pub fn move_cursor(&mut self, widget: Widget, location: Point) {
        if let Some(window) = self.windows.get_mut(&widget) {
            let bounds = window.bounds();
            let controller =
                self.controllers.iter().find(|c| !c.is_disabled() && c.bounds() == bounds);
            window.move_cursor(location, controller);
        }
    }
}
