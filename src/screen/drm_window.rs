// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use crate::drm::dumb_buffer::DumbBuffer;
use crate::drm::DrmDevice;
use crate::screen::HardwareDisplayController;
use crate::screen::OverlayPlane;
use crate::screen::SwapCompletionCallback;
use crate::screen::SwapResult;
use crate::Point;
use crate::Rect;
use crate::Size;
use crate::Widget;

const CURSOR_BUFFER_COUNT: usize = 2;

/// A cursor image, tightly packed ARGB8888 pixels.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CursorBitmap {
    pub size: Size,
    pub pixels: Vec<u32>,
}

/// The DRM side of a native window. Presents its frames through the display controller covering
/// its bounds, if any.
#[derive(Default)]
pub struct DrmWindow {
    widget: Widget,
    bounds: Rect,
    cursor_device: Option<Arc<DrmDevice>>,
    cursor_buffers: Vec<DumbBuffer>,
    cursor_frontbuffer: usize,
    cursor_bitmap: Option<CursorBitmap>,
    cursor_location: Point,
    last_submitted_planes: Vec<OverlayPlane>,
    force_buffer_reallocation: bool,
}

impl std::fmt::Debug for DrmWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmWindow")
            .field("widget", &self.widget)
            .field("bounds", &self.bounds)
            .finish_non_exhaustive()
    }
}

impl DrmWindow {
    pub fn new(widget: Widget) -> Self {
        Self { widget, ..Default::default() }
    }

    pub fn widget(&self) -> Widget {
        self.widget
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    /// Moves the window. A size change makes the next flip ask for new buffers.
    pub fn set_bounds(&mut self, bounds: Rect) {
        if self.bounds.size != bounds.size && !self.last_submitted_planes.is_empty() {
            self.force_buffer_reallocation = true;
        }
        self.bounds = bounds;
    }

    pub fn last_submitted_planes(&self) -> &[OverlayPlane] {
        &self.last_submitted_planes
    }

    pub fn cursor_location(&self) -> Point {
        self.cursor_location
    }

    /// Called whenever the controller showing this window changes.
    pub fn set_controller(&mut self, controller: Option<&HardwareDisplayController>) {
        let drm = controller.and_then(HardwareDisplayController::drm_device);
        let same_device = match (drm, &self.cursor_device) {
            (Some(new), Some(old)) => Arc::ptr_eq(new, old),
            (None, None) => true,
            _ => false,
        };
        if !same_device {
            self.cursor_buffers.clear();
            self.cursor_frontbuffer = 0;
            self.cursor_device = drm.cloned();
            if let Some(drm) = drm {
                self.allocate_cursor_buffers(drm);
            }
        }

        if let Some(controller) = controller {
            self.reset_cursor(controller);
        }
    }

    fn allocate_cursor_buffers(&mut self, drm: &Arc<DrmDevice>) {
        let size = drm.cursor_size();
        for _ in 0..CURSOR_BUFFER_COUNT {
            match DumbBuffer::create(drm, size) {
                Ok(buffer) => self.cursor_buffers.push(buffer),
                Err(e) => {
                    log::error!("Failed to allocate {size} cursor buffer: {e}");
                    self.cursor_buffers.clear();
                    return;
                }
            }
        }
    }

    fn reset_cursor(&mut self, controller: &HardwareDisplayController) {
        let visible = match &self.cursor_bitmap {
            Some(bitmap) if !self.cursor_buffers.is_empty() => {
                let back = (self.cursor_frontbuffer + 1) % self.cursor_buffers.len();
                self.cursor_buffers[back].write_argb(bitmap.size, &bitmap.pixels);
                self.cursor_frontbuffer = back;
                Some(&self.cursor_buffers[back])
            }
            _ => None,
        };
        if let Err(e) = controller.set_cursor(visible) {
            log::error!("Failed to set cursor on window {}: {e}", self.widget);
        }
        if visible.is_some() {
            self.move_cursor(self.cursor_location, Some(controller));
        }
    }

    /// Shows `bitmap` at `location`, or hides the cursor when `bitmap` is `None`.
    pub fn set_cursor(
        &mut self,
        bitmap: Option<CursorBitmap>,
        location: Point,
        controller: Option<&HardwareDisplayController>,
    ) {
        self.cursor_bitmap = bitmap.filter(|b| !b.size.is_empty());
        self.cursor_location = location;
        if let Some(controller) = controller {
            self.reset_cursor(controller);
        }
    }

    pub fn move_cursor(&mut self, location: Point, controller: Option<&HardwareDisplayController>) {
        self.cursor_location = location;
        if let Some(controller) = controller {
            if let Err(e) = controller.move_cursor(location) {
                log::error!("Failed to move cursor on window {}: {e}", self.widget);
            }
        }
    }

    /// Presents `planes`. Without a controller the frame is dropped and acknowledged right away.
    pub fn schedule_page_flip(
        &mut self,
        planes: Vec<OverlayPlane>,
        callback: SwapCompletionCallback,
        controller: Option<&mut HardwareDisplayController>,
    ) {
        if self.force_buffer_reallocation {
            self.force_buffer_reallocation = false;
            callback(SwapResult::NakRecreateBuffers);
            return;
        }

        self.last_submitted_planes = planes.clone();
        match controller {
            Some(controller) => controller.schedule_page_flip(planes, callback),
            None => callback(SwapResult::Ack),
        }
    }

    pub fn test_page_flip(
        &self,
        planes: &[OverlayPlane],
        controller: Option<&HardwareDisplayController>,
    ) -> bool {
        match controller {
            Some(controller) => controller.test_page_flip(planes).is_ok(),
            None => true,
        }
    }
}
