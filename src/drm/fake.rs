// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory [`DrmBackend`] used by unit tests.
//!
//! The fake keeps a small model of a KMS device: CRTCs, connectors, encoders, planes and their
//! properties. Page flips and atomic commits requesting an event queue a completion which only
//! becomes readable from [`DrmBackend::read_events`] once the test calls
//! [`FakeBackend::complete_flips`].

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use drm::ClientCapability;
use drm::DriverCapability;
use nix::errno::Errno;
use nix::libc;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use nix::sys::mman::mmap_anonymous;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;

use crate::drm::backend::DrmBackend;
use crate::drm::backend::DumbAllocation;
use crate::drm::events::encode_vblank_event;
use crate::drm::events::VblankEvent;
use crate::drm::sys;
use crate::drm::AtomicRequest;
use crate::drm::Connection;
use crate::drm::Connector;
use crate::drm::Crtc;
use crate::drm::Encoder;
use crate::drm::FramebufferParams;
use crate::drm::ModeInfo;
use crate::drm::ObjectType;
use crate::drm::Plane;
use crate::drm::Property;
use crate::drm::PropertyValue;
use crate::drm::Resources;

pub(crate) const PLANE_TYPE_OVERLAY: u64 = 0;
pub(crate) const PLANE_TYPE_PRIMARY: u64 = 1;
pub(crate) const PLANE_TYPE_CURSOR: u64 = 2;

pub(crate) const DEFAULT_FORMATS: [u32; 4] = [
    drm_fourcc::DrmFourcc::Xrgb8888 as u32,
    drm_fourcc::DrmFourcc::Argb8888 as u32,
    drm_fourcc::DrmFourcc::Xbgr8888 as u32,
    drm_fourcc::DrmFourcc::Abgr8888 as u32,
];

/// Builds a mode with plausible CEA-like blanking for the given size and refresh rate.
pub(crate) fn mode(width: u16, height: u16, refresh: u32) -> ModeInfo {
    let htotal = width + 280;
    let vtotal = height + 45;
    ModeInfo {
        clock: htotal as u32 * vtotal as u32 * refresh / 1000,
        hdisplay: width,
        hsync_start: width + 88,
        hsync_end: width + 132,
        htotal,
        vdisplay: height,
        vsync_start: height + 4,
        vsync_end: height + 9,
        vtotal,
        vrefresh: refresh,
        type_: sys::DRM_MODE_TYPE_PREFERRED,
        name: format!("{width}x{height}"),
        ..Default::default()
    }
}

#[derive(Default)]
pub(crate) struct FakeState {
    pub resources_error: Option<Errno>,
    pub atomic_supported: bool,
    pub atomic_enabled: bool,
    pub modifiers_supported: bool,
    pub master: bool,
    pub crtcs: Vec<Crtc>,
    pub crtc_connectors: HashMap<u32, Vec<u32>>,
    pub gamma: HashMap<u32, [Vec<u16>; 3]>,
    pub connectors: Vec<Connector>,
    pub encoders: Vec<Encoder>,
    pub planes: Vec<Plane>,
    pub properties: Vec<Property>,
    pub object_properties: HashMap<u32, Vec<PropertyValue>>,
    pub blobs: HashMap<u32, Vec<u8>>,
    pub framebuffers: HashMap<u32, FramebufferParams>,
    pub removed_framebuffers: Vec<u32>,
    pub dumb_buffers: HashMap<u32, DumbAllocation>,
    pub closed_handles: Vec<u32>,
    pub page_flips: Vec<(u32, u32, u64)>,
    pub commits: Vec<(AtomicRequest, u32)>,
    pub cursors: HashMap<u32, (u32, u32, u32)>,
    pub cursor_positions: HashMap<u32, (i32, i32)>,
    pub failures: HashSet<&'static str>,
    pending_events: Vec<VblankEvent>,
    event_data: Vec<u8>,
    next_id: u32,
    frame: u32,
}

impl FakeState {
    fn allocate_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn check(&self, op: &'static str) -> nix::Result<()> {
        if self.failures.contains(op) {
            Err(Errno::EINVAL)
        } else {
            Ok(())
        }
    }

    fn define_property(&mut self, name: &str, flags: u32, enums: &[(u64, &str)]) -> u32 {
        if let Some(prop) = self.properties.iter().find(|p| p.name == name) {
            return prop.id;
        }
        let id = self.allocate_id();
        self.properties.push(Property {
            id,
            name: name.to_string(),
            flags,
            values: vec![],
            enums: enums.iter().map(|(v, n)| (*v, n.to_string())).collect(),
        });
        id
    }

    fn attach(
        &mut self,
        object_id: u32,
        name: &str,
        flags: u32,
        enums: &[(u64, &str)],
        value: u64,
    ) {
        let id = self.define_property(name, flags, enums);
        let props = self.object_properties.entry(object_id).or_default();
        match props.iter_mut().find(|p| p.id == id) {
            Some(existing) => existing.value = value,
            None => props.push(PropertyValue { id, value }),
        }
    }

    pub fn property_id(&self, name: &str) -> Option<u32> {
        self.properties.iter().find(|p| p.name == name).map(|p| p.id)
    }

    pub fn property_value(&self, object_id: u32, name: &str) -> Option<u64> {
        let id = self.property_id(name)?;
        self.object_properties.get(&object_id)?.iter().find(|p| p.id == id).map(|p| p.value)
    }

    fn set_value(&mut self, object_id: u32, property_id: u32) -> nix::Result<&mut PropertyValue> {
        self.object_properties
            .get_mut(&object_id)
            .and_then(|props| props.iter_mut().find(|p| p.id == property_id))
            .ok_or(Errno::ENOENT)
    }

    fn queue_flip_event(&mut self, crtc_id: u32, user_data: u64) {
        self.frame += 1;
        self.pending_events.push(VblankEvent {
            user_data,
            tv_sec: 100,
            tv_usec: self.frame * 1000,
            sequence: self.frame,
            crtc_id,
        });
    }
}

struct FakeInner {
    state: Mutex<FakeState>,
    event_fd: EventFd,
}

/// Cloneable handle to a fake device. Tests keep one clone to inspect the state while the device
/// owns another.
#[derive(Clone)]
pub(crate) struct FakeBackend {
    inner: Arc<FakeInner>,
}

impl FakeBackend {
    pub fn new() -> Self {
        let event_fd =
            EventFd::from_flags(EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC).unwrap();
        let state = FakeState { atomic_supported: true, ..Default::default() };
        Self { inner: Arc::new(FakeInner { state: Mutex::new(state), event_fd }) }
    }

    /// A device with `count` CRTCs, each driving one connected 1920x1080 connector through a
    /// primary plane, plus one overlay plane usable on every CRTC.
    pub fn with_displays(count: usize) -> Self {
        let fake = Self::new();
        let all_crtcs = (1u32 << count) - 1;
        for i in 0..count {
            fake.add_crtc(256);
            fake.add_connector(true, vec![mode(1920, 1080, 60), mode(1280, 720, 60)], 1 << i);
            fake.add_plane(PLANE_TYPE_PRIMARY, 1 << i, &DEFAULT_FORMATS);
            fake.add_plane(PLANE_TYPE_CURSOR, 1 << i, &[drm_fourcc::DrmFourcc::Argb8888 as u32]);
        }
        fake.add_plane(PLANE_TYPE_OVERLAY, all_crtcs, &DEFAULT_FORMATS);
        fake
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.inner.state.lock().unwrap()
    }

    pub fn add_crtc(&self, gamma_size: u32) -> u32 {
        let mut state = self.state();
        let id = state.allocate_id();
        state.crtcs.push(Crtc { id, gamma_size, ..Default::default() });
        state.attach(id, "ACTIVE", sys::DRM_MODE_PROP_RANGE, &[], 0);
        state.attach(id, "MODE_ID", sys::DRM_MODE_PROP_BLOB, &[], 0);
        id
    }

    /// Adds a connector reachable through a new encoder that can drive `possible_crtcs`.
    pub fn add_connector(&self, connected: bool, modes: Vec<ModeInfo>, possible_crtcs: u32) -> u32 {
        let mut state = self.state();
        let encoder_id = state.allocate_id();
        state.encoders.push(Encoder { id: encoder_id, crtc_id: 0, possible_crtcs });
        let id = state.allocate_id();
        let connector_type_id = state.connectors.len() as u32 + 1;
        state.connectors.push(Connector {
            id,
            connector_type: 11,
            connector_type_id,
            connection: if connected { Connection::Connected } else { Connection::Disconnected },
            mm_width: 530,
            mm_height: 300,
            encoder_id: 0,
            encoders: vec![encoder_id],
            modes,
        });
        state.object_properties.entry(id).or_default();
        state.attach(id, "CRTC_ID", sys::DRM_MODE_PROP_RANGE, &[], 0);
        state.attach(
            id,
            "Content Protection",
            sys::DRM_MODE_PROP_ENUM,
            &[(0, "Undesired"), (1, "Desired"), (2, "Enabled")],
            0,
        );
        id
    }

    pub fn add_plane(&self, plane_type: u64, possible_crtcs: u32, formats: &[u32]) -> u32 {
        let mut state = self.state();
        let id = state.allocate_id();
        state.planes.push(Plane {
            id,
            crtc_id: 0,
            fb_id: 0,
            possible_crtcs,
            formats: formats.to_vec(),
        });
        state.attach(
            id,
            "type",
            sys::DRM_MODE_PROP_ENUM | sys::DRM_MODE_PROP_IMMUTABLE,
            &[(0, "Overlay"), (1, "Primary"), (2, "Cursor")],
            plane_type,
        );
        for name in [
            "FB_ID", "CRTC_ID", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H", "SRC_X", "SRC_Y", "SRC_W",
            "SRC_H",
        ] {
            state.attach(id, name, sys::DRM_MODE_PROP_RANGE, &[], 0);
        }
        id
    }

    /// Exposes the color management properties on `crtc_id`.
    pub fn enable_color_management(&self, crtc_id: u32, degamma_size: u64, gamma_size: u64) {
        let mut state = self.state();
        let immutable = sys::DRM_MODE_PROP_RANGE | sys::DRM_MODE_PROP_IMMUTABLE;
        state.attach(crtc_id, "DEGAMMA_LUT", sys::DRM_MODE_PROP_BLOB, &[], 0);
        state.attach(crtc_id, "DEGAMMA_LUT_SIZE", immutable, &[], degamma_size);
        state.attach(crtc_id, "GAMMA_LUT", sys::DRM_MODE_PROP_BLOB, &[], 0);
        state.attach(crtc_id, "GAMMA_LUT_SIZE", immutable, &[], gamma_size);
        state.attach(crtc_id, "CTM", sys::DRM_MODE_PROP_BLOB, &[], 0);
    }

    pub fn crtc_ids(&self) -> Vec<u32> {
        self.state().crtcs.iter().map(|c| c.id).collect()
    }

    pub fn connector_ids(&self) -> Vec<u32> {
        self.state().connectors.iter().map(|c| c.id).collect()
    }

    pub fn fail(&self, op: &'static str) {
        self.state().failures.insert(op);
    }

    pub fn pass(&self, op: &'static str) {
        self.state().failures.remove(op);
    }

    pub fn pending_flip_count(&self) -> usize {
        self.state().pending_events.len()
    }

    /// Makes every queued flip completion readable and signals the event fd.
    pub fn complete_flips(&self) -> usize {
        let mut state = self.state();
        let events = std::mem::take(&mut state.pending_events);
        for event in &events {
            let data = encode_vblank_event(sys::DRM_EVENT_FLIP_COMPLETE, event);
            state.event_data.extend(data);
        }
        if !events.is_empty() {
            let _ = self.inner.event_fd.write(1);
        }
        events.len()
    }
}

impl DrmBackend for FakeBackend {
    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.inner.event_fd.as_fd()
    }

    fn get_cap(&self, capability: DriverCapability) -> nix::Result<u64> {
        let state = self.state();
        match capability {
            DriverCapability::DumbBuffer => Ok(1),
            DriverCapability::CursorWidth | DriverCapability::CursorHeight => Ok(64),
            DriverCapability::AddFB2Modifiers => Ok(state.modifiers_supported as u64),
            _ => Err(Errno::EINVAL),
        }
    }

    fn set_client_cap(&self, capability: ClientCapability, enable: bool) -> nix::Result<()> {
        let mut state = self.state();
        match capability {
            ClientCapability::Atomic if state.atomic_supported => {
                state.atomic_enabled = enable;
                Ok(())
            }
            ClientCapability::UniversalPlanes => Ok(()),
            _ => Err(Errno::EOPNOTSUPP),
        }
    }

    fn set_master(&self) -> nix::Result<()> {
        let mut state = self.state();
        state.check("set_master")?;
        state.master = true;
        Ok(())
    }

    fn drop_master(&self) -> nix::Result<()> {
        let mut state = self.state();
        state.check("drop_master")?;
        state.master = false;
        Ok(())
    }

    fn get_resources(&self) -> nix::Result<Resources> {
        let state = self.state();
        if let Some(errno) = state.resources_error {
            return Err(errno);
        }
        Ok(Resources {
            fbs: state.framebuffers.keys().copied().collect(),
            crtcs: state.crtcs.iter().map(|c| c.id).collect(),
            connectors: state.connectors.iter().map(|c| c.id).collect(),
            encoders: state.encoders.iter().map(|e| e.id).collect(),
            min_width: 0,
            max_width: 8192,
            min_height: 0,
            max_height: 8192,
        })
    }

    fn get_crtc(&self, crtc_id: u32) -> nix::Result<Crtc> {
        self.state().crtcs.iter().find(|c| c.id == crtc_id).cloned().ok_or(Errno::ENOENT)
    }

    fn set_crtc(
        &self,
        crtc_id: u32,
        fb_id: u32,
        x: u32,
        y: u32,
        connectors: &[u32],
        mode: Option<&ModeInfo>,
    ) -> nix::Result<()> {
        let mut state = self.state();
        state.check("set_crtc")?;
        if fb_id != 0 && !state.framebuffers.contains_key(&fb_id) {
            return Err(Errno::ENOENT);
        }
        let crtc = state.crtcs.iter_mut().find(|c| c.id == crtc_id).ok_or(Errno::ENOENT)?;
        crtc.fb_id = fb_id;
        crtc.x = x;
        crtc.y = y;
        crtc.mode = mode.cloned();
        state.crtc_connectors.insert(crtc_id, connectors.to_vec());
        Ok(())
    }

    fn get_connector(&self, connector_id: u32) -> nix::Result<Connector> {
        let state = self.state();
        let mut connector = state
            .connectors
            .iter()
            .find(|c| c.id == connector_id)
            .cloned()
            .ok_or(Errno::ENOENT)?;
        // Report the encoder as routed once some CRTC drives this connector.
        if state.crtc_connectors.values().any(|conns| conns.contains(&connector_id)) {
            connector.encoder_id = connector.encoders.first().copied().unwrap_or(0);
        }
        Ok(connector)
    }

    fn get_encoder(&self, encoder_id: u32) -> nix::Result<Encoder> {
        let state = self.state();
        let mut encoder =
            state.encoders.iter().find(|e| e.id == encoder_id).cloned().ok_or(Errno::ENOENT)?;
        let connector = state.connectors.iter().find(|c| c.encoders.contains(&encoder_id));
        if let Some(connector) = connector {
            if let Some((crtc_id, _)) =
                state.crtc_connectors.iter().find(|(_, conns)| conns.contains(&connector.id))
            {
                encoder.crtc_id = *crtc_id;
            }
        }
        Ok(encoder)
    }

    fn get_plane_resources(&self) -> nix::Result<Vec<u32>> {
        let state = self.state();
        state.check("get_plane_resources")?;
        Ok(state.planes.iter().map(|p| p.id).collect())
    }

    fn get_plane(&self, plane_id: u32) -> nix::Result<Plane> {
        self.state().planes.iter().find(|p| p.id == plane_id).cloned().ok_or(Errno::ENOENT)
    }

    fn get_object_properties(
        &self,
        object_id: u32,
        _object_type: ObjectType,
    ) -> nix::Result<Vec<PropertyValue>> {
        self.state().object_properties.get(&object_id).cloned().ok_or(Errno::ENOENT)
    }

    fn get_property(&self, property_id: u32) -> nix::Result<Property> {
        self.state().properties.iter().find(|p| p.id == property_id).cloned().ok_or(Errno::ENOENT)
    }

    fn set_object_property(
        &self,
        object_id: u32,
        _object_type: ObjectType,
        property_id: u32,
        value: u64,
    ) -> nix::Result<()> {
        let mut state = self.state();
        state.check("set_object_property")?;
        state.set_value(object_id, property_id)?.value = value;
        Ok(())
    }

    fn get_property_blob(&self, blob_id: u32) -> nix::Result<Vec<u8>> {
        self.state().blobs.get(&blob_id).cloned().ok_or(Errno::ENOENT)
    }

    fn create_property_blob(&self, data: &[u8]) -> nix::Result<u32> {
        let mut state = self.state();
        state.check("create_property_blob")?;
        let id = state.allocate_id();
        state.blobs.insert(id, data.to_vec());
        Ok(id)
    }

    fn destroy_property_blob(&self, blob_id: u32) -> nix::Result<()> {
        // The kernel keeps blobs referenced by a property alive, so the fake simply forgets the
        // handle and keeps the data readable.
        let state = self.state();
        if state.blobs.contains_key(&blob_id) {
            Ok(())
        } else {
            Err(Errno::ENOENT)
        }
    }

    fn add_framebuffer2(&self, params: &FramebufferParams) -> nix::Result<u32> {
        let mut state = self.state();
        state.check("add_framebuffer2")?;
        if params.use_modifiers && !state.modifiers_supported {
            return Err(Errno::EINVAL);
        }
        let id = state.allocate_id();
        state.framebuffers.insert(id, params.clone());
        Ok(id)
    }

    fn remove_framebuffer(&self, fb_id: u32) -> nix::Result<()> {
        let mut state = self.state();
        state.framebuffers.remove(&fb_id).ok_or(Errno::ENOENT)?;
        state.removed_framebuffers.push(fb_id);
        Ok(())
    }

    fn page_flip(&self, crtc_id: u32, fb_id: u32, flags: u32, user_data: u64) -> nix::Result<()> {
        let mut state = self.state();
        state.check("page_flip")?;
        if !state.framebuffers.contains_key(&fb_id) {
            return Err(Errno::ENOENT);
        }
        let crtc = state.crtcs.iter_mut().find(|c| c.id == crtc_id).ok_or(Errno::ENOENT)?;
        crtc.fb_id = fb_id;
        state.page_flips.push((crtc_id, fb_id, user_data));
        if flags & sys::DRM_MODE_PAGE_FLIP_EVENT != 0 {
            state.queue_flip_event(crtc_id, user_data);
        }
        Ok(())
    }

    fn atomic_commit(
        &self,
        request: &AtomicRequest,
        flags: u32,
        user_data: u64,
    ) -> nix::Result<()> {
        let mut state = self.state();
        if !state.atomic_enabled {
            return Err(Errno::EINVAL);
        }
        if flags & sys::DRM_MODE_ATOMIC_TEST_ONLY != 0 {
            state.check("atomic_test")?;
        } else {
            state.check("atomic_commit")?;
        }
        for (object_id, props) in request.objects() {
            for prop in props {
                state.set_value(*object_id, prop.id)?;
            }
        }
        state.commits.push((request.clone(), flags));
        if flags & sys::DRM_MODE_ATOMIC_TEST_ONLY != 0 {
            return Ok(());
        }

        for (object_id, props) in request.objects() {
            for prop in props {
                state.set_value(*object_id, prop.id)?.value = prop.value;
            }
        }

        if flags & sys::DRM_MODE_PAGE_FLIP_EVENT != 0 {
            let crtc_prop = state.property_id("CRTC_ID");
            let mut crtcs = vec![];
            for (object_id, props) in request.objects() {
                if state.crtcs.iter().any(|c| c.id == *object_id) {
                    crtcs.push(*object_id);
                }
                for prop in props {
                    if Some(prop.id) == crtc_prop && prop.value != 0 {
                        crtcs.push(prop.value as u32);
                    }
                }
            }
            crtcs.sort_unstable();
            crtcs.dedup();
            for crtc_id in crtcs {
                state.queue_flip_event(crtc_id, user_data);
            }
        }
        Ok(())
    }

    fn set_cursor(&self, crtc_id: u32, handle: u32, width: u32, height: u32) -> nix::Result<()> {
        let mut state = self.state();
        state.check("set_cursor")?;
        state.cursors.insert(crtc_id, (handle, width, height));
        Ok(())
    }

    fn move_cursor(&self, crtc_id: u32, x: i32, y: i32) -> nix::Result<()> {
        let mut state = self.state();
        state.check("move_cursor")?;
        state.cursor_positions.insert(crtc_id, (x, y));
        Ok(())
    }

    fn get_gamma(&self, crtc_id: u32, size: usize) -> nix::Result<[Vec<u16>; 3]> {
        let state = self.state();
        Ok(state.gamma.get(&crtc_id).cloned().unwrap_or_else(|| {
            [vec![0; size], vec![0; size], vec![0; size]]
        }))
    }

    fn set_gamma(
        &self,
        crtc_id: u32,
        red: &[u16],
        green: &[u16],
        blue: &[u16],
    ) -> nix::Result<()> {
        let mut state = self.state();
        state.check("set_gamma")?;
        let crtc = state.crtcs.iter().find(|c| c.id == crtc_id).ok_or(Errno::ENOENT)?;
        if red.len() != crtc.gamma_size as usize
            || green.len() != red.len()
            || blue.len() != red.len()
        {
            return Err(Errno::EINVAL);
        }
        state.gamma.insert(crtc_id, [red.to_vec(), green.to_vec(), blue.to_vec()]);
        Ok(())
    }

    fn create_dumb_buffer(&self, width: u32, height: u32, bpp: u32) -> nix::Result<DumbAllocation> {
        let mut state = self.state();
        state.check("create_dumb_buffer")?;
        let pitch = (width * bpp / 8 + 63) & !63;
        let handle = state.allocate_id();
        let allocation = DumbAllocation { handle, pitch, size: pitch as u64 * height as u64 };
        state.dumb_buffers.insert(handle, allocation);
        Ok(allocation)
    }

    fn map_dumb_buffer(&self, handle: u32, len: usize) -> nix::Result<NonNull<libc::c_void>> {
        let state = self.state();
        state.check("map_dumb_buffer")?;
        if !state.dumb_buffers.contains_key(&handle) {
            return Err(Errno::ENOENT);
        }
        let len = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
        // SAFETY: a fresh anonymous mapping aliases nothing.
        unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
    }

    fn destroy_dumb_buffer(&self, handle: u32) -> nix::Result<()> {
        self.state().dumb_buffers.remove(&handle).map(|_| ()).ok_or(Errno::ENOENT)
    }

    fn close_gem_handle(&self, handle: u32) -> nix::Result<()> {
        self.state().closed_handles.push(handle);
        Ok(())
    }

    fn prime_fd_to_handle(&self, _fd: BorrowedFd<'_>) -> nix::Result<u32> {
        let mut state = self.state();
        state.check("prime_fd_to_handle")?;
        Ok(state.allocate_id())
    }

    fn prime_handle_to_fd(&self, _handle: u32) -> nix::Result<OwnedFd> {
        let file = File::open("/dev/null").map_err(|_| Errno::EIO)?;
        Ok(OwnedFd::from(file))
    }

    fn read_events(&self, buf: &mut [u8]) -> nix::Result<usize> {
        let mut state = self.state();
        let _ = self.inner.event_fd.read();
        if state.event_data.is_empty() {
            return Err(Errno::EAGAIN);
        }
        let record = std::mem::size_of::<sys::drm_event_vblank>();
        let len = state.event_data.len().min(buf.len() / record * record);
        buf[..len].copy_from_slice(&state.event_data[..len]);
        state.event_data.drain(..len);
        if !state.event_data.is_empty() {
            let _ = self.inner.event_fd.write(1);
        }
        Ok(len)
    }
}
