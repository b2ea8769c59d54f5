// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decides which surfaces can be promoted to hardware overlay planes.
//!
//! The compositor asks [`DrmOverlayManager::check_overlay_support`] every frame. Answers come
//! from a small cache of previously validated candidate lists. A list seen often enough is sent
//! to the DRM thread for validation, and until the answer comes back every candidate of that list
//! is reported as not handled.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use crate::drm::plane_manager::CropRect;
use crate::drm::plane_manager::PlaneConfig;
use crate::gbm::framebuffer_format;
use crate::gbm::BufferFormat;
use crate::screen::HardwareDisplayController;
use crate::Fourcc;
use crate::Rect;
use crate::Size;
use crate::Widget;

const MAX_CACHE_SIZE: usize = 10;
/// Number of times a candidate list must be seen before it gets validated.
const THROTTLE_REQUEST_SIZE: u32 = 3;

#[derive(Clone, Debug, PartialEq)]
pub struct OverlaySurfaceCandidate {
    pub buffer_size: Size,
    pub format: BufferFormat,
    pub display_rect: Rect,
    pub crop_rect: CropRect,
    pub plane_z_order: i32,
    /// Output of the checks: whether the candidate can be shown in an overlay plane.
    pub overlay_handled: bool,
}

impl OverlaySurfaceCandidate {
    fn is_valid(&self) -> bool {
        !self.buffer_size.is_empty() && !self.display_rect.size.is_empty()
    }

    fn plane_config(&self) -> PlaneConfig {
        PlaneConfig {
            framebuffer_id: 0,
            format: framebuffer_format(Fourcc::from(self.format)).into(),
            z_order: self.plane_z_order,
            display_bounds: self.display_rect,
            crop: self.crop_rect,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OverlayStatus {
    Pending,
    Able,
    NotAble,
}

pub type OverlayStatusCallback = Box<dyn FnOnce(Vec<OverlayStatus>) + Send + 'static>;

/// Runs the actual validation of a candidate list, usually on the DRM thread.
pub trait OverlayValidator: Send {
    /// Validates `candidates` for `widget`. `callback` receives one status per candidate.
    fn request_validation(
        &self,
        widget: Widget,
        candidates: Vec<OverlaySurfaceCandidate>,
        callback: OverlayStatusCallback,
    );
}

impl<V: OverlayValidator + Sync> OverlayValidator for Arc<V> {
    fn request_validation(
        &self,
        widget: Widget,
        candidates: Vec<OverlaySurfaceCandidate>,
        callback: OverlayStatusCallback,
    ) {
        self.as_ref().request_validation(widget, candidates, callback)
    }
}

#[derive(Debug)]
struct CacheEntry {
    widget: Widget,
    candidates: Vec<OverlaySurfaceCandidate>,
    status: Vec<OverlayStatus>,
    times_seen: u32,
}

/// Most recently used entries first.
#[derive(Debug, Default)]
struct OverlayCache {
    entries: VecDeque<CacheEntry>,
}

impl OverlayCache {
    fn position(&self, widget: Widget, candidates: &[OverlaySurfaceCandidate]) -> Option<usize> {
        self.entries.iter().position(|e| e.widget == widget && e.candidates == candidates)
    }

    /// Looks up `candidates`, inserting it with `status` if missing, and moves the entry to the
    /// front.
    fn get_or_insert(
        &mut self,
        widget: Widget,
        candidates: &[OverlaySurfaceCandidate],
        status: impl FnOnce() -> Vec<OverlayStatus>,
    ) -> &mut CacheEntry {
        match self.position(widget, candidates) {
            Some(index) => {
                if let Some(entry) = self.entries.remove(index) {
                    self.entries.push_front(entry);
                }
            }
            None => {
                self.entries.push_front(CacheEntry {
                    widget,
                    candidates: candidates.to_vec(),
                    status: status(),
                    times_seen: 0,
                });
                self.entries.truncate(MAX_CACHE_SIZE);
            }
        }
        &mut self.entries[0]
    }

    fn update(
        &mut self,
        widget: Widget,
        candidates: &[OverlaySurfaceCandidate],
        status: Vec<OverlayStatus>,
    ) {
        match self.position(widget, candidates) {
            Some(index) if status.len() == candidates.len() => {
                self.entries[index].status = status;
            }
            Some(_) => {
                log::error!("Got {} statuses for {} candidates", status.len(), candidates.len())
            }
            // Evicted while the validation was in flight.
            None => (),
        }
    }
}

pub struct DrmOverlayManager {
    validator: Box<dyn OverlayValidator>,
    cache: Arc<Mutex<OverlayCache>>,
}

impl std::fmt::Debug for DrmOverlayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmOverlayManager").field("cache", &self.cache).finish_non_exhaustive()
    }
}

impl DrmOverlayManager {
    pub fn new(validator: Box<dyn OverlayValidator>) -> Self {
        Self { validator, cache: Default::default() }
    }

    /// Sets `overlay_handled` on each of `candidates`.
    ///
    /// Candidates without area are never handled and need no validation. A list where every
    /// candidate is like that gets its answer right away.
    pub fn check_overlay_support(
        &self,
        candidates: &mut [OverlaySurfaceCandidate],
        widget: Widget,
    ) {
        let key = candidates
            .iter()
            .map(|c| OverlaySurfaceCandidate { overlay_handled: c.is_valid(), ..c.clone() })
            .collect::<Vec<_>>();

        let (status, request) = {
            let mut cache = self.cache.lock().unwrap();
            let entry = cache.get_or_insert(widget, &key, || {
                let needs_validation = key.iter().any(|c| c.overlay_handled);
                let status =
                    if needs_validation { OverlayStatus::Pending } else { OverlayStatus::NotAble };
                vec![status; key.len()]
            });
            let pending = entry.status.contains(&OverlayStatus::Pending);
            entry.times_seen = entry.times_seen.saturating_add(1);
            let request = pending && entry.times_seen == THROTTLE_REQUEST_SIZE;
            ((!pending).then(|| entry.status.clone()), request)
        };

        match status {
            Some(status) => {
                for (candidate, status) in candidates.iter_mut().zip(status) {
                    candidate.overlay_handled = status == OverlayStatus::Able;
                }
            }
            None => {
                for candidate in candidates.iter_mut() {
                    candidate.overlay_handled = false;
                }
            }
        }

        if request {
            log::debug!("Validating {} overlay candidates for window {widget}", key.len());
            let cache = Arc::clone(&self.cache);
            let candidates = key.clone();
            self.validator.request_validation(
                widget,
                key,
                Box::new(move |status| {
                    cache.lock().unwrap().update(widget, &candidates, status);
                }),
            );
        }
    }

    /// Forgets every validation result, e.g. after the display configuration changed.
    pub fn reset_cache(&self) {
        self.cache.lock().unwrap().entries.clear();
    }
}

/// Checks which of `candidates` fit on the planes of `controller`.
///
/// Candidates are tried in order, each on top of the ones accepted before it.
pub fn check_overlay_capabilities(
    controller: Option<&HardwareDisplayController>,
    candidates: &[OverlaySurfaceCandidate],
) -> Vec<OverlayStatus> {
    let Some(controller) = controller.filter(|c| !c.is_disabled()) else {
        return vec![OverlayStatus::NotAble; candidates.len()];
    };

    let mut accepted: Vec<PlaneConfig> = vec![];
    candidates
        .iter()
        .map(|candidate| {
            if !candidate.overlay_handled || !candidate.is_valid() {
                return OverlayStatus::NotAble;
            }
            accepted.push(candidate.plane_config());
            match controller.test_layers(&accepted) {
                Ok(()) => OverlayStatus::Able,
                Err(e) => {
                    log::trace!("Overlay candidate {candidate:?} rejected: {e}");
                    accepted.pop();
                    OverlayStatus::NotAble
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::device::tests::new_device_with_allocator;
    use crate::drm::fake::mode;
    use crate::drm::fake::FakeBackend;
    use crate::gbm::fake::FakeAllocator;
    use crate::gbm::BufferUsage;
    use crate::gbm::GbmBuffer;
    use crate::screen::CrtcController;
    use crate::screen::OverlayPlane;
    use crate::Point;

    type Requests = Arc<Mutex<Vec<(Widget, Vec<OverlaySurfaceCandidate>, OverlayStatusCallback)>>>;

    #[derive(Default)]
    struct FakeValidator {
        requests: Requests,
    }

    impl OverlayValidator for FakeValidator {
        fn request_validation(
            &self,
            widget: Widget,
            candidates: Vec<OverlaySurfaceCandidate>,
            callback: OverlayStatusCallback,
        ) {
            self.requests.lock().unwrap().push((widget, candidates, callback));
        }
    }

    fn candidate(size: Size, format: BufferFormat, z: i32) -> OverlaySurfaceCandidate {
        OverlaySurfaceCandidate {
            buffer_size: size,
            format,
            display_rect: Rect::new(0, 0, size.width, size.height),
            crop_rect: CropRect::from_size(size),
            plane_z_order: z,
            overlay_handled: false,
        }
    }

    fn manager() -> (DrmOverlayManager, Requests) {
        let _ = env_logger::try_init();
        let validator = FakeValidator::default();
        let requests = validator.requests.clone();
        (DrmOverlayManager::new(Box::new(validator)), requests)
    }

    #[test]
    fn zero_area_candidate_needs_no_validation() {
        let (manager, requests) = manager();
        let mut candidates = vec![candidate(Size::new(0, 0), BufferFormat::Bgrx8888, 1)];
        for _ in 0..THROTTLE_REQUEST_SIZE + 1 {
            candidates[0].overlay_handled = true;
            manager.check_overlay_support(&mut candidates, 1);
            assert!(!candidates[0].overlay_handled);
        }
        assert!(requests.lock().unwrap().is_empty());
    }

    #[test]
    fn validation_is_throttled_then_cached() {
        let (manager, requests) = manager();
        let mut candidates = vec![
            candidate(Size::new(1920, 1080), BufferFormat::Bgrx8888, 0),
            candidate(Size::new(640, 480), BufferFormat::Yuv420Biplanar, 1),
        ];

        for _ in 0..THROTTLE_REQUEST_SIZE - 1 {
            manager.check_overlay_support(&mut candidates, 7);
        }
        assert!(requests.lock().unwrap().is_empty());

        manager.check_overlay_support(&mut candidates, 7);
        assert!(candidates.iter().all(|c| !c.overlay_handled));
        let (widget, sent, callback) = requests.lock().unwrap().pop().unwrap();
        assert_eq!(widget, 7);
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|c| c.overlay_handled));

        callback(vec![OverlayStatus::Able, OverlayStatus::NotAble]);
        manager.check_overlay_support(&mut candidates, 7);
        assert!(candidates[0].overlay_handled);
        assert!(!candidates[1].overlay_handled);
        assert!(requests.lock().unwrap().is_empty());

        // Same list on another window is a different entry.
        manager.check_overlay_support(&mut candidates, 8);
        assert!(candidates.iter().all(|c| !c.overlay_handled));

        manager.reset_cache();
        manager.check_overlay_support(&mut candidates, 7);
        assert!(candidates.iter().all(|c| !c.overlay_handled));
    }

    #[test]
    fn cache_keeps_most_recent_entries() {
        let (manager, requests) = manager();
        let mut first = vec![candidate(Size::new(100, 100), BufferFormat::Bgrx8888, 1)];
        manager.check_overlay_support(&mut first, 1);
        for i in 0..MAX_CACHE_SIZE as u32 {
            let mut other = vec![candidate(Size::new(200 + i, 100), BufferFormat::Bgrx8888, 1)];
            manager.check_overlay_support(&mut other, 1);
        }
        assert_eq!(manager.cache.lock().unwrap().entries.len(), MAX_CACHE_SIZE);

        // The first list was evicted, so it starts counting again.
        for _ in 0..THROTTLE_REQUEST_SIZE - 1 {
            manager.check_overlay_support(&mut first, 1);
        }
        assert!(requests.lock().unwrap().is_empty());
    }

    fn enabled_controller(use_atomic: bool) -> HardwareDisplayController {
        let fake = FakeBackend::with_displays(1);
        let drm = new_device_with_allocator(&fake, &FakeAllocator::new(), use_atomic);
        let mut controller = HardwareDisplayController::new(
            CrtcController::new(drm.clone(), fake.crtc_ids()[0], fake.connector_ids()[0]),
            Point::default(),
        );
        let size = Size::new(1920, 1080);
        let buffer =
            GbmBuffer::create(&drm, Fourcc::from(b"XR24"), size, BufferUsage::Scanout).unwrap();
        let primary = OverlayPlane::new(
            buffer,
            0,
            Rect::new(0, 0, size.width, size.height),
            CropRect::from_size(size),
        );
        controller.modeset(&primary, &mode(1920, 1080, 60)).unwrap();
        controller
    }

    fn handled(mut candidate: OverlaySurfaceCandidate) -> OverlaySurfaceCandidate {
        candidate.overlay_handled = true;
        candidate
    }

    #[test]
    fn atomic_capabilities_follow_plane_inventory() {
        let _ = env_logger::try_init();
        let controller = enabled_controller(true);
        let candidates = vec![
            handled(candidate(Size::new(1920, 1080), BufferFormat::Bgra8888, 0)),
            handled(candidate(Size::new(640, 480), BufferFormat::Yuv420Biplanar, 1)),
            handled(candidate(Size::new(640, 480), BufferFormat::Rgbx8888, 2)),
            handled(candidate(Size::new(320, 240), BufferFormat::Bgrx8888, 3)),
        ];
        assert_eq!(
            check_overlay_capabilities(Some(&controller), &candidates),
            vec![
                OverlayStatus::Able,
                OverlayStatus::NotAble,
                OverlayStatus::Able,
                OverlayStatus::NotAble
            ]
        );
    }

    #[test]
    fn legacy_and_missing_controllers() {
        let _ = env_logger::try_init();
        let controller = enabled_controller(false);
        let candidates = vec![
            handled(candidate(Size::new(1920, 1080), BufferFormat::Bgrx8888, 0)),
            handled(candidate(Size::new(640, 480), BufferFormat::Bgrx8888, 1)),
        ];
        assert_eq!(
            check_overlay_capabilities(Some(&controller), &candidates),
            vec![OverlayStatus::Able, OverlayStatus::NotAble]
        );
        assert_eq!(
            check_overlay_capabilities(None, &candidates),
            vec![OverlayStatus::NotAble, OverlayStatus::NotAble]
        );
    }
}
