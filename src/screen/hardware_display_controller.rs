// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;
use std::sync::Mutex;

use crate::drm::dumb_buffer::DumbBuffer;
use crate::drm::page_flip::PageFlipCallback;
use crate::drm::plane_manager::CrtcCommit;
use crate::drm::plane_manager::PlaneConfig;
use crate::drm::DrmDevice;
use crate::drm::DrmError;
use crate::drm::DrmResult;
use crate::drm::ModeInfo;
use crate::screen::OverlayPlane;
use crate::screen::SwapCompletionCallback;
use crate::screen::SwapResult;
use crate::Point;
use crate::Rect;
use crate::Size;

/// Drives one CRTC/connector pair.
#[derive(Debug)]
pub struct CrtcController {
    drm: Arc<DrmDevice>,
    crtc_id: u32,
    connector_id: u32,
    mode: Option<ModeInfo>,
}

impl CrtcController {
    pub fn new(drm: Arc<DrmDevice>, crtc_id: u32, connector_id: u32) -> Self {
        Self { drm, crtc_id, connector_id, mode: None }
    }

    pub fn drm_device(&self) -> &Arc<DrmDevice> {
        &self.drm
    }

    pub fn crtc_id(&self) -> u32 {
        self.crtc_id
    }

    pub fn connector_id(&self) -> u32 {
        self.connector_id
    }

    pub fn mode(&self) -> Option<&ModeInfo> {
        self.mode.as_ref()
    }

    pub fn is_disabled(&self) -> bool {
        self.mode.is_none()
    }

    fn modeset(&mut self, plane: &OverlayPlane, mode: &ModeInfo) -> DrmResult<()> {
        self.drm.set_crtc(self.crtc_id, plane.buffer.framebuffer_id(), &[self.connector_id], mode)?;
        self.mode = Some(mode.clone());
        Ok(())
    }

    fn disable(&mut self) -> DrmResult<()> {
        if self.mode.is_none() {
            return Ok(());
        }
        self.drm.disable_crtc(self.crtc_id)?;
        self.mode = None;
        Ok(())
    }

    fn set_cursor(&self, cursor: Option<&DumbBuffer>) -> DrmResult<()> {
        match cursor {
            Some(buffer) => self.drm.set_cursor(self.crtc_id, buffer.handle(), buffer.size()),
            None => self.drm.set_cursor(self.crtc_id, 0, Size::default()),
        }
    }
}

#[derive(Default)]
struct FlipState {
    current_planes: Vec<OverlayPlane>,
    pending: Option<(Vec<OverlayPlane>, SwapCompletionCallback)>,
}

/// A set of CRTCs showing the same content at the same position of the desktop.
///
/// More than one CRTC means the display is mirrored. All CRTCs of a controller live on the same
/// device and are flipped together in a single commit.
pub struct HardwareDisplayController {
    crtc_controllers: Vec<CrtcController>,
    origin: Point,
    state: Arc<Mutex<FlipState>>,
}

impl std::fmt::Debug for HardwareDisplayController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareDisplayController")
            .field("crtc_controllers", &self.crtc_controllers)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl HardwareDisplayController {
    pub fn new(controller: CrtcController, origin: Point) -> Self {
        Self { crtc_controllers: vec![controller], origin, state: Default::default() }
    }

    pub fn crtc_controllers(&self) -> &[CrtcController] {
        &self.crtc_controllers
    }

    pub fn drm_device(&self) -> Option<&Arc<DrmDevice>> {
        self.crtc_controllers.first().map(CrtcController::drm_device)
    }

    pub fn origin(&self) -> Point {
        self.origin
    }

    pub fn set_origin(&mut self, origin: Point) {
        self.origin = origin;
    }

    pub fn has_crtc(&self, drm: &Arc<DrmDevice>, crtc_id: u32) -> bool {
        self.crtc_controllers.iter().any(|c| c.crtc_id == crtc_id && Arc::ptr_eq(&c.drm, drm))
    }

    pub fn is_mirrored(&self) -> bool {
        self.crtc_controllers.len() > 1
    }

    pub fn is_disabled(&self) -> bool {
        self.crtc_controllers.iter().all(CrtcController::is_disabled)
    }

    /// Size of the active mode, empty while disabled.
    pub fn mode_size(&self) -> Size {
        self.crtc_controllers
            .iter()
            .find_map(|c| c.mode.as_ref())
            .map_or(Size::default(), ModeInfo::size)
    }

    /// Area of the desktop covered by this controller.
    pub fn bounds(&self) -> Rect {
        let size = self.mode_size();
        Rect::new(self.origin.x, self.origin.y, size.width, size.height)
    }

    pub fn current_planes(&self) -> Vec<OverlayPlane> {
        self.state.lock().unwrap().current_planes.clone()
    }

    pub fn has_pending_flip(&self) -> bool {
        self.state.lock().unwrap().pending.is_some()
    }

    pub fn add_crtc(&mut self, controller: CrtcController) {
        self.crtc_controllers.push(controller);
    }

    pub fn remove_crtc(&mut self, drm: &Arc<DrmDevice>, crtc_id: u32) -> Option<CrtcController> {
        let index = self
            .crtc_controllers
            .iter()
            .position(|c| c.crtc_id == crtc_id && Arc::ptr_eq(&c.drm, drm))?;
        Some(self.crtc_controllers.remove(index))
    }

    /// Sets `mode` on every CRTC, scanning out `primary`.
    pub fn modeset(&mut self, primary: &OverlayPlane, mode: &ModeInfo) -> DrmResult<()> {
        for controller in self.crtc_controllers.iter_mut() {
            controller.modeset(primary, mode)?;
        }
        self.state.lock().unwrap().current_planes = vec![primary.clone()];
        Ok(())
    }

    /// Turns every CRTC off. A flip still waiting for completion reports failure.
    pub fn disable(&mut self) -> DrmResult<()> {
        let mut result = Ok(());
        for controller in self.crtc_controllers.iter_mut() {
            if let Err(e) = controller.disable() {
                log::error!("Failed to disable CRTC {}: {e}", controller.crtc_id);
                result = Err(e);
            }
        }
        self.fail_pending_flip();
        result
    }

    /// Reports [`SwapResult::Failed`] for the flip in flight, if any. Returns whether there was
    /// one.
    pub fn fail_pending_flip(&self) -> bool {
        let pending = self.state.lock().unwrap().pending.take();
        match pending {
            Some((_, callback)) => {
                callback(SwapResult::Failed);
                true
            }
            None => false,
        }
    }

    fn commits(&self, planes: &[OverlayPlane]) -> Vec<CrtcCommit> {
        let configs = planes.iter().map(OverlayPlane::to_plane_config).collect::<Vec<_>>();
        self.commits_for(&configs)
    }

    fn commits_for(&self, configs: &[PlaneConfig]) -> Vec<CrtcCommit> {
        self.crtc_controllers
            .iter()
            .filter(|c| !c.is_disabled())
            .map(|c| CrtcCommit { crtc_id: c.crtc_id, planes: configs.to_vec() })
            .collect()
    }

    /// Presents `planes` on the next vblank. `callback` runs exactly once: when the flip
    /// completes, right away if the controller is disabled, or when the flip fails.
    pub fn schedule_page_flip(
        &mut self,
        planes: Vec<OverlayPlane>,
        callback: SwapCompletionCallback,
    ) {
        if self.is_disabled() {
            callback(SwapResult::Ack);
            return;
        }

        let mode_size = self.mode_size();
        match planes.iter().min_by_key(|p| p.z_order) {
            None => {
                log::error!("Cannot flip without a primary plane");
                callback(SwapResult::Failed);
                return;
            }
            Some(primary) if primary.buffer.size() != mode_size => {
                log::debug!(
                    "Primary plane is {} but the mode is {mode_size}, buffers must be recreated",
                    primary.buffer.size()
                );
                callback(SwapResult::NakRecreateBuffers);
                return;
            }
            Some(_) => (),
        }

        let Some(drm) = self.drm_device().cloned() else {
            callback(SwapResult::Failed);
            return;
        };

        let commits = self.commits(&planes);
        {
            let mut state = self.state.lock().unwrap();
            if state.pending.is_some() {
                drop(state);
                log::error!("A page flip is already pending on {:?}", self.crtc_controllers);
                callback(SwapResult::Failed);
                return;
            }
            state.pending = Some((planes, callback));
        }

        let state = Arc::clone(&self.state);
        let on_flip: PageFlipCallback = Box::new(move |_event| {
            let pending = {
                let mut state = state.lock().unwrap();
                match state.pending.take() {
                    Some((planes, callback)) => {
                        state.current_planes = planes;
                        Some(callback)
                    }
                    None => None,
                }
            };
            if let Some(callback) = pending {
                callback(SwapResult::Ack);
            }
        });

        if let Err(e) = drm.commit_frame(&commits, on_flip) {
            log::error!("Failed to schedule page flip: {e}");
            self.fail_pending_flip();
        }
    }

    /// Checks whether `planes` could be presented, without changing what is on screen.
    pub fn test_page_flip(&self, planes: &[OverlayPlane]) -> DrmResult<()> {
        let configs = planes.iter().map(OverlayPlane::to_plane_config).collect::<Vec<_>>();
        self.test_layers(&configs)
    }

    /// Checks whether `layers` fit on every enabled CRTC of this controller. Layers without a
    /// framebuffer only go through plane assignment.
    pub fn test_layers(&self, layers: &[PlaneConfig]) -> DrmResult<()> {
        let drm = self.drm_device().ok_or_else(|| DrmError::PlaneManager("no CRTC".into()))?;
        for commit in self.commits_for(layers) {
            drm.test_layers(commit.crtc_id, &commit.planes)?;
        }
        Ok(())
    }

    pub fn set_cursor(&self, cursor: Option<&DumbBuffer>) -> DrmResult<()> {
        for controller in self.crtc_controllers.iter().filter(|c| !c.is_disabled()) {
            controller.set_cursor(cursor)?;
        }
        Ok(())
    }

    pub fn move_cursor(&self, location: Point) -> DrmResult<()> {
        for controller in self.crtc_controllers.iter().filter(|c| !c.is_disabled()) {
            controller.drm.move_cursor(controller.crtc_id, location)?;
        }
        Ok(())
    }
}
