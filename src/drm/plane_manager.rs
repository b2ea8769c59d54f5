// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Assignment of scanout layers to hardware planes.
//!
//! Two flavors exist, selected once when the device is initialized: the legacy manager only knows
//! about one primary plane per CRTC and flips it with `DRM_IOCTL_MODE_PAGE_FLIP`, while the atomic
//! manager discovers every universal plane and commits whole frames with `DRM_IOCTL_MODE_ATOMIC`.

use std::sync::Arc;
use std::sync::Mutex;

use drm_fourcc::DrmFourcc;

use crate::drm::page_flip::PageFlipCallback;
use crate::drm::sys;
use crate::drm::AtomicRequest;
use crate::drm::DrmDevice;
use crate::drm::DrmError;
use crate::drm::DrmResult;
use crate::drm::ObjectType;
use crate::Rect;

/// Source rectangle inside a buffer, in pixels. Fractional values are allowed.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct CropRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl CropRect {
    pub fn from_size(size: crate::Size) -> Self {
        Self { x: 0.0, y: 0.0, width: size.width as f32, height: size.height as f32 }
    }
}

/// One layer to scan out on a CRTC.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PlaneConfig {
    pub framebuffer_id: u32,
    pub format: u32,
    pub z_order: i32,
    pub display_bounds: Rect,
    pub crop: CropRect,
}

/// The layers to present on one CRTC as part of a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct CrtcCommit {
    pub crtc_id: u32,
    pub planes: Vec<PlaneConfig>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlaneType {
    Primary,
    Overlay,
    Cursor,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct PlaneProperties {
    fb_id: u32,
    crtc_id: u32,
    crtc_x: u32,
    crtc_y: u32,
    crtc_w: u32,
    crtc_h: u32,
    src_x: u32,
    src_y: u32,
    src_w: u32,
    src_h: u32,
}

#[derive(Clone, Debug)]
pub struct HardwarePlane {
    pub id: u32,
    pub plane_type: PlaneType,
    pub possible_crtcs: u32,
    pub formats: Vec<u32>,
    props: PlaneProperties,
    owner: Option<u32>,
}

impl HardwarePlane {
    fn can_use_for(&self, crtc_index: usize, format: u32) -> bool {
        self.possible_crtcs & (1 << crtc_index) != 0 && self.formats.contains(&format)
    }
}

/// Planes and CRTCs discovered on a device.
#[derive(Debug, Default)]
struct PlaneInventory {
    crtcs: Vec<u32>,
    planes: Vec<HardwarePlane>,
}

impl PlaneInventory {
    fn crtc_index(&self, crtc_id: u32) -> DrmResult<usize> {
        self.crtcs.iter().position(|&id| id == crtc_id).ok_or(DrmError::NoSuchObject(crtc_id))
    }

    /// Picks a hardware plane for each layer, lowest z-order first. The bottom layer goes to a
    /// primary plane, every other layer to an overlay plane. Returns plane indices in the same
    /// order as `layers`.
    fn assign(
        &self,
        crtc_id: u32,
        layers: &[PlaneConfig],
        taken: &mut Vec<usize>,
    ) -> DrmResult<Vec<usize>> {
        let crtc_index = self.crtc_index(crtc_id)?;
        let mut order: Vec<usize> = (0..layers.len()).collect();
        order.sort_by_key(|&i| layers[i].z_order);

        let mut assignment = vec![0; layers.len()];
        for (rank, &layer_idx) in order.iter().enumerate() {
            let layer = &layers[layer_idx];
            let wanted = if rank == 0 { PlaneType::Primary } else { PlaneType::Overlay };
            let plane = self
                .planes
                .iter()
                .enumerate()
                .filter(|(idx, _)| !taken.contains(idx))
                .find(|(_, plane)| {
                    plane.plane_type == wanted
                        && plane.owner.map_or(true, |owner| owner == crtc_id)
                        && plane.can_use_for(crtc_index, layer.format)
                })
                .map(|(idx, _)| idx)
                .ok_or_else(|| {
                    DrmError::PlaneManager(format!(
                        "no {wanted:?} plane on CRTC {crtc_id} for format {:?}",
                        crate::Fourcc::from(layer.format)
                    ))
                })?;
            taken.push(plane);
            assignment[layer_idx] = plane;
        }
        Ok(assignment)
    }

    fn release(&mut self, crtc_id: u32) {
        for plane in self.planes.iter_mut().filter(|p| p.owner == Some(crtc_id)) {
            plane.owner = None;
        }
    }
}

fn to_16_16(v: f32) -> u64 {
    (v.max(0.0) as f64 * 65536.0) as u64
}

#[derive(Debug, Default)]
pub struct LegacyPlaneManager {
    inventory: PlaneInventory,
}

impl LegacyPlaneManager {
    fn initialize(&mut self, drm: &DrmDevice) -> DrmResult<()> {
        let resources = drm.get_resources()?;
        // Without universal planes the primary plane of each CRTC is implicit.
        self.inventory.planes = resources
            .crtcs
            .iter()
            .enumerate()
            .map(|(idx, _)| HardwarePlane {
                id: 0,
                plane_type: PlaneType::Primary,
                possible_crtcs: 1 << idx,
                formats: vec![
                    DrmFourcc::Xrgb8888 as u32,
                    DrmFourcc::Xbgr8888 as u32,
                    DrmFourcc::Rgb565 as u32,
                ],
                props: Default::default(),
                owner: None,
            })
            .collect();
        self.inventory.crtcs = resources.crtcs;
        Ok(())
    }

    fn primary_layer<'a>(commit: &'a CrtcCommit) -> DrmResult<&'a PlaneConfig> {
        match commit.planes.as_slice() {
            [primary] => Ok(primary),
            [] => Err(DrmError::PlaneManager(format!("no layers for CRTC {}", commit.crtc_id))),
            _ => Err(DrmError::PlaneManager(
                "legacy page flips can only present the primary plane".into(),
            )),
        }
    }

    fn commit(
        &mut self,
        drm: &DrmDevice,
        commits: &[CrtcCommit],
        callback: PageFlipCallback,
    ) -> DrmResult<()> {
        for commit in commits {
            Self::primary_layer(commit)?;
        }

        // One page flip per CRTC, the callback runs once every one of them completed.
        let barrier = Arc::new(Mutex::new(Some((commits.len(), callback))));
        for commit in commits {
            let layer = Self::primary_layer(commit)?;
            let flip_barrier = barrier.clone();
            let result = drm.page_flip(
                commit.crtc_id,
                layer.framebuffer_id,
                Box::new(move |event| {
                    let ready = {
                        let mut pending = flip_barrier.lock().unwrap();
                        match pending.as_mut() {
                            Some((remaining, _)) => {
                                *remaining -= 1;
                                if *remaining == 0 {
                                    pending.take()
                                } else {
                                    None
                                }
                            }
                            None => None,
                        }
                    };
                    if let Some((_, callback)) = ready {
                        callback(event);
                    }
                }),
            );
            if let Err(e) = result {
                // Flips already queued will still complete, but nobody is waiting for them.
                barrier.lock().unwrap().take();
                return Err(e);
            }
        }
        Ok(())
    }

    fn check_layers(&self, crtc_id: u32, layers: &[PlaneConfig]) -> DrmResult<()> {
        match layers {
            [primary] => {
                let index = self.inventory.crtc_index(crtc_id)?;
                let plane = &self.inventory.planes[index];
                if plane.formats.contains(&primary.format) {
                    Ok(())
                } else {
                    Err(DrmError::PlaneManager(format!(
                        "format {:?} not supported by the primary plane",
                        crate::Fourcc::from(primary.format)
                    )))
                }
            }
            _ => Err(DrmError::PlaneManager("legacy scanout supports a single layer".into())),
        }
    }
}

#[derive(Debug, Default)]
pub struct AtomicPlaneManager {
    inventory: PlaneInventory,
}

impl AtomicPlaneManager {
    fn initialize(&mut self, drm: &DrmDevice) -> DrmResult<()> {
        let resources = drm.get_resources()?;
        let plane_ids = drm.get_plane_resources()?;
        let mut planes = Vec::with_capacity(plane_ids.len());

        for plane_id in plane_ids {
            let plane = drm.get_plane(plane_id)?;
            let props = drm.get_named_properties(plane_id, ObjectType::Plane)?;
            let find = |name: &'static str| -> DrmResult<u32> {
                props
                    .iter()
                    .find(|(prop, _)| prop.name == name)
                    .map(|(prop, _)| prop.id)
                    .ok_or(DrmError::MissingProperty(name))
            };

            let plane_type = props
                .iter()
                .find(|(prop, _)| prop.name == "type")
                .and_then(|(prop, value)| prop.enum_name(*value))
                .map(|name| match name {
                    "Primary" => PlaneType::Primary,
                    "Cursor" => PlaneType::Cursor,
                    _ => PlaneType::Overlay,
                })
                .ok_or(DrmError::MissingProperty("type"))?;

            planes.push(HardwarePlane {
                id: plane_id,
                plane_type,
                possible_crtcs: plane.possible_crtcs,
                formats: plane.formats,
                props: PlaneProperties {
                    fb_id: find("FB_ID")?,
                    crtc_id: find("CRTC_ID")?,
                    crtc_x: find("CRTC_X")?,
                    crtc_y: find("CRTC_Y")?,
                    crtc_w: find("CRTC_W")?,
                    crtc_h: find("CRTC_H")?,
                    src_x: find("SRC_X")?,
                    src_y: find("SRC_Y")?,
                    src_w: find("SRC_W")?,
                    src_h: find("SRC_H")?,
                },
                owner: if plane.crtc_id != 0 { Some(plane.crtc_id) } else { None },
            });
        }

        log::debug!(
            "Found {} planes for {} CRTCs ({} overlays)",
            planes.len(),
            resources.crtcs.len(),
            planes.iter().filter(|p| p.plane_type == PlaneType::Overlay).count()
        );
        self.inventory = PlaneInventory { crtcs: resources.crtcs, planes };
        Ok(())
    }

    /// Builds the request for `commits`, disabling planes the CRTCs used before but no longer
    /// need. Returns the request and the planes now owned by each CRTC.
    fn build_request(
        &self,
        commits: &[CrtcCommit],
    ) -> DrmResult<(AtomicRequest, Vec<(u32, Vec<usize>)>)> {
        let mut request = AtomicRequest::new();
        let mut taken = vec![];
        let mut owners = vec![];

        for commit in commits {
            let assignment = self.inventory.assign(commit.crtc_id, &commit.planes, &mut taken)?;
            for (layer, &plane_idx) in commit.planes.iter().zip(&assignment) {
                let plane = &self.inventory.planes[plane_idx];
                let p = &plane.props;
                let bounds = &layer.display_bounds;
                request.add_property(plane.id, p.fb_id, layer.framebuffer_id as u64);
                request.add_property(plane.id, p.crtc_id, commit.crtc_id as u64);
                request.add_property(plane.id, p.crtc_x, bounds.origin.x as i64 as u64);
                request.add_property(plane.id, p.crtc_y, bounds.origin.y as i64 as u64);
                request.add_property(plane.id, p.crtc_w, bounds.size.width as u64);
                request.add_property(plane.id, p.crtc_h, bounds.size.height as u64);
                request.add_property(plane.id, p.src_x, to_16_16(layer.crop.x));
                request.add_property(plane.id, p.src_y, to_16_16(layer.crop.y));
                request.add_property(plane.id, p.src_w, to_16_16(layer.crop.width));
                request.add_property(plane.id, p.src_h, to_16_16(layer.crop.height));
            }

            for (idx, plane) in self.inventory.planes.iter().enumerate() {
                if plane.owner == Some(commit.crtc_id) && !assignment.contains(&idx) {
                    request.add_property(plane.id, plane.props.fb_id, 0);
                    request.add_property(plane.id, plane.props.crtc_id, 0);
                }
            }
            owners.push((commit.crtc_id, assignment));
        }
        Ok((request, owners))
    }

    fn commit(
        &mut self,
        drm: &DrmDevice,
        commits: &[CrtcCommit],
        callback: PageFlipCallback,
    ) -> DrmResult<()> {
        let (request, owners) = self.build_request(commits)?;
        drm.commit_properties(
            &request,
            sys::DRM_MODE_ATOMIC_NONBLOCK | sys::DRM_MODE_PAGE_FLIP_EVENT,
            commits.len() as u32,
            Some(callback),
        )?;

        for (crtc_id, assignment) in owners {
            self.inventory.release(crtc_id);
            for idx in assignment {
                self.inventory.planes[idx].owner = Some(crtc_id);
            }
        }
        Ok(())
    }

    fn test_commit(&self, drm: &DrmDevice, commits: &[CrtcCommit]) -> DrmResult<()> {
        let (request, _) = self.build_request(commits)?;
        drm.commit_properties(&request, sys::DRM_MODE_ATOMIC_TEST_ONLY, 0, None)
    }
}

/// Which flavor of plane management a device ended up with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlaneManagerKind {
    Legacy,
    Atomic,
}

#[derive(Debug)]
pub enum PlaneManager {
    Legacy(LegacyPlaneManager),
    Atomic(AtomicPlaneManager),
}

impl PlaneManager {
    pub fn new(kind: PlaneManagerKind) -> Self {
        match kind {
            PlaneManagerKind::Legacy => Self::Legacy(Default::default()),
            PlaneManagerKind::Atomic => Self::Atomic(Default::default()),
        }
    }

    pub fn kind(&self) -> PlaneManagerKind {
        match self {
            Self::Legacy(_) => PlaneManagerKind::Legacy,
            Self::Atomic(_) => PlaneManagerKind::Atomic,
        }
    }

    fn inventory(&self) -> &PlaneInventory {
        match self {
            Self::Legacy(m) => &m.inventory,
            Self::Atomic(m) => &m.inventory,
        }
    }

    fn inventory_mut(&mut self) -> &mut PlaneInventory {
        match self {
            Self::Legacy(m) => &mut m.inventory,
            Self::Atomic(m) => &mut m.inventory,
        }
    }

    pub fn initialize(&mut self, drm: &DrmDevice) -> DrmResult<()> {
        match self {
            Self::Legacy(m) => m.initialize(drm),
            Self::Atomic(m) => m.initialize(drm),
        }
    }

    pub fn planes(&self) -> &[HardwarePlane] {
        &self.inventory().planes
    }

    /// Formats the primary plane of `crtc_id` can scan out.
    pub fn primary_formats(&self, crtc_id: u32) -> Vec<u32> {
        let inventory = self.inventory();
        let Ok(index) = inventory.crtc_index(crtc_id) else {
            return vec![];
        };
        inventory
            .planes
            .iter()
            .filter(|p| p.plane_type == PlaneType::Primary && p.possible_crtcs & (1 << index) != 0)
            .flat_map(|p| p.formats.iter().copied())
            .collect()
    }

    /// Presents one frame on every CRTC in `commits`. `callback` runs once all of them flipped.
    pub fn commit(
        &mut self,
        drm: &DrmDevice,
        commits: &[CrtcCommit],
        callback: PageFlipCallback,
    ) -> DrmResult<()> {
        match self {
            Self::Legacy(m) => m.commit(drm, commits, callback),
            Self::Atomic(m) => m.commit(drm, commits, callback),
        }
    }

    /// Checks whether `layers` could be presented on `crtc_id` without touching the screen.
    pub fn test_layers(
        &self,
        drm: &DrmDevice,
        crtc_id: u32,
        layers: &[PlaneConfig],
    ) -> DrmResult<()> {
        match self {
            Self::Legacy(m) => m.check_layers(crtc_id, layers),
            Self::Atomic(m) => {
                let commit = CrtcCommit { crtc_id, planes: layers.to_vec() };
                if layers.iter().any(|l| l.framebuffer_id == 0) {
                    // Nothing to hand to the kernel yet, settle for a plane assignment.
                    m.inventory.assign(crtc_id, layers, &mut vec![]).map(|_| ())
                } else {
                    m.test_commit(drm, std::slice::from_ref(&commit))
                }
            }
        }
    }

    /// Forgets plane ownership for a CRTC that got disabled.
    pub fn release_crtc(&mut self, crtc_id: u32) {
        self.inventory_mut().release(crtc_id);
    }
}
