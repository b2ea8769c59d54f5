// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::os::fd::BorrowedFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use drm::ClientCapability;
use drm::DriverCapability;
use nix::errno::Errno;

use crate::drm::backend::DrmBackend;
use crate::drm::backend::DumbAllocation;
use crate::drm::color;
use crate::drm::color::GammaRampRgbEntry;
use crate::drm::events::DrmEvent;
use crate::drm::events::EventIterator;
use crate::drm::page_flip::PageFlipCallback;
use crate::drm::page_flip::PageFlipEvent;
use crate::drm::page_flip::PageFlipManager;
use crate::drm::plane_manager::CrtcCommit;
use crate::drm::plane_manager::PlaneConfig;
use crate::drm::plane_manager::PlaneManager;
use crate::drm::plane_manager::PlaneManagerKind;
use crate::drm::sys;
use crate::drm::AtomicRequest;
use crate::drm::Connector;
use crate::drm::Crtc;
use crate::drm::DrmError;
use crate::drm::DrmResult;
use crate::drm::Encoder;
use crate::drm::FramebufferParams;
use crate::drm::IoctlResultExt;
use crate::drm::ModeInfo;
use crate::drm::ObjectType;
use crate::drm::Plane;
use crate::drm::Property;
use crate::drm::Resources;
use crate::gbm::BufferAllocator;

/// Size of the buffer used to drain the event stream. Flip events are 32 bytes each.
const EVENT_BUFFER_SIZE: usize = 1024;

/// One open DRM device.
///
/// Shared as `Arc<DrmDevice>` between the DRM thread, the buffers registered on it and the display
/// controllers driving its CRTCs. Every method issues its ioctls synchronously and reports kernel
/// failures as errors; nothing is retried.
pub struct DrmDevice {
    path: PathBuf,
    backend: Box<dyn DrmBackend>,
    allocator: Option<Box<dyn BufferAllocator>>,
    is_primary_device: bool,
    plane_manager: Mutex<Option<PlaneManager>>,
    page_flip_manager: Mutex<PageFlipManager>,
}

impl std::fmt::Debug for DrmDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmDevice")
            .field("path", &self.path)
            .field("is_primary_device", &self.is_primary_device)
            .finish_non_exhaustive()
    }
}

impl DrmDevice {
    pub fn new(
        path: impl AsRef<Path>,
        backend: Box<dyn DrmBackend>,
        allocator: Option<Box<dyn BufferAllocator>>,
        is_primary_device: bool,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            backend,
            allocator,
            is_primary_device,
            plane_manager: Mutex::new(None),
            page_flip_manager: Mutex::new(PageFlipManager::new()),
        }
    }

    /// Probes the device and sets up the plane manager.
    ///
    /// Fails with [`DrmError::NotModesetting`] if the device cannot report its resources. The
    /// atomic plane manager is used when `use_atomic` is set and the kernel accepts the atomic
    /// client capability, the legacy one otherwise.
    pub fn initialize(&self, use_atomic: bool) -> DrmResult<()> {
        if let Err(e) = self.backend.get_resources() {
            log::error!(
                "{}: cannot query for resources ({e}), not a modesetting device",
                self.path.display()
            );
            return Err(DrmError::NotModesetting);
        }

        if let Err(e) = self.backend.set_client_cap(ClientCapability::UniversalPlanes, true) {
            log::debug!("{}: universal planes not supported: {e}", self.path.display());
        }

        let kind = if use_atomic
            && self.backend.set_client_cap(ClientCapability::Atomic, true).is_ok()
        {
            PlaneManagerKind::Atomic
        } else {
            PlaneManagerKind::Legacy
        };

        let mut plane_manager = PlaneManager::new(kind);
        plane_manager.initialize(self).map_err(|e| {
            log::error!(
                "{}: failed to initialize {kind:?} plane manager: {e}",
                self.path.display()
            );
            DrmError::PlaneManager(e.to_string())
        })?;

        log::info!("{}: using {kind:?} plane manager", self.path.display());
        *self.plane_manager.lock().unwrap() = Some(plane_manager);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_primary_device(&self) -> bool {
        self.is_primary_device
    }

    pub fn plane_manager_kind(&self) -> Option<PlaneManagerKind> {
        self.plane_manager.lock().unwrap().as_ref().map(PlaneManager::kind)
    }

    /// The buffer allocator bound to this device, if any.
    pub fn allocator(&self) -> Option<&dyn BufferAllocator> {
        self.allocator.as_deref()
    }

    /// File descriptor becoming readable when page flip events are pending.
    pub fn poll_fd(&self) -> BorrowedFd<'_> {
        self.backend.poll_fd()
    }

    pub fn supports_modifiers(&self) -> bool {
        self.backend.get_cap(DriverCapability::AddFB2Modifiers).map_or(false, |v| v != 0)
    }

    pub fn cursor_size(&self) -> crate::Size {
        let width = self.backend.get_cap(DriverCapability::CursorWidth).unwrap_or(64);
        let height = self.backend.get_cap(DriverCapability::CursorHeight).unwrap_or(64);
        crate::Size::new(width as u32, height as u32)
    }

    pub fn set_master(&self) -> DrmResult<()> {
        self.backend.set_master().ioctl("DRM_IOCTL_SET_MASTER")
    }

    pub fn drop_master(&self) -> DrmResult<()> {
        self.backend.drop_master().ioctl("DRM_IOCTL_DROP_MASTER")
    }

    pub fn get_resources(&self) -> DrmResult<Resources> {
        self.backend.get_resources().ioctl("DRM_IOCTL_MODE_GETRESOURCES")
    }

    pub fn get_crtc(&self, crtc_id: u32) -> Option<Crtc> {
        self.backend
            .get_crtc(crtc_id)
            .map_err(|e| log::error!("Failed to get CRTC {crtc_id}: {e}"))
            .ok()
    }

    pub fn get_connector(&self, connector_id: u32) -> Option<Connector> {
        self.backend
            .get_connector(connector_id)
            .map_err(|e| log::error!("Failed to get connector {connector_id}: {e}"))
            .ok()
    }

    pub fn get_encoder(&self, encoder_id: u32) -> Option<Encoder> {
        self.backend.get_encoder(encoder_id).ok()
    }

    pub fn get_plane_resources(&self) -> DrmResult<Vec<u32>> {
        self.backend.get_plane_resources().ioctl("DRM_IOCTL_MODE_GETPLANERESOURCES")
    }

    pub fn get_plane(&self, plane_id: u32) -> DrmResult<Plane> {
        self.backend.get_plane(plane_id).ioctl("DRM_IOCTL_MODE_GETPLANE")
    }

    pub fn get_property(&self, property_id: u32) -> Option<Property> {
        self.backend.get_property(property_id).ok()
    }

    /// Properties of an object together with their current values.
    pub fn get_named_properties(
        &self,
        object_id: u32,
        object_type: ObjectType,
    ) -> DrmResult<Vec<(Property, u64)>> {
        let values = self
            .backend
            .get_object_properties(object_id, object_type)
            .ioctl("DRM_IOCTL_MODE_OBJ_GETPROPERTIES")?;
        values
            .into_iter()
            .map(|v| {
                let prop = self.backend.get_property(v.id).ioctl("DRM_IOCTL_MODE_GETPROPERTY")?;
                Ok((prop, v.value))
            })
            .collect()
    }

    /// Looks up the property called `name` on an object.
    pub fn find_property(
        &self,
        object_id: u32,
        object_type: ObjectType,
        name: &str,
    ) -> Option<(Property, u64)> {
        self.get_named_properties(object_id, object_type)
            .ok()?
            .into_iter()
            .find(|(prop, _)| prop.name == name)
    }

    /// Contents of the blob referenced by property `name` of `object_id`.
    pub fn get_property_blob(
        &self,
        object_id: u32,
        object_type: ObjectType,
        name: &str,
    ) -> Option<Vec<u8>> {
        let (prop, value) = self.find_property(object_id, object_type, name)?;
        if !prop.is_blob() || value == 0 {
            return None;
        }
        self.backend.get_property_blob(value as u32).ok()
    }

    pub fn set_property(
        &self,
        object_id: u32,
        object_type: ObjectType,
        property_id: u32,
        value: u64,
    ) -> DrmResult<()> {
        self.backend
            .set_object_property(object_id, object_type, property_id, value)
            .ioctl("DRM_IOCTL_MODE_OBJ_SETPROPERTY")
    }

    pub fn create_property_blob(&self, data: &[u8]) -> DrmResult<u32> {
        self.backend.create_property_blob(data).ioctl("DRM_IOCTL_MODE_CREATEPROPBLOB")
    }

    pub fn destroy_property_blob(&self, blob_id: u32) -> DrmResult<()> {
        self.backend.destroy_property_blob(blob_id).ioctl("DRM_IOCTL_MODE_DESTROYPROPBLOB")
    }

    pub fn set_crtc(
        &self,
        crtc_id: u32,
        framebuffer_id: u32,
        connectors: &[u32],
        mode: &ModeInfo,
    ) -> DrmResult<()> {
        log::debug!("Set CRTC {crtc_id} to framebuffer {framebuffer_id} with mode {}", mode.name);
        self.backend
            .set_crtc(crtc_id, framebuffer_id, 0, 0, connectors, Some(mode))
            .ioctl("DRM_IOCTL_MODE_SETCRTC")
    }

    pub fn disable_crtc(&self, crtc_id: u32) -> DrmResult<()> {
        log::debug!("Disable CRTC {crtc_id}");
        self.backend.set_crtc(crtc_id, 0, 0, 0, &[], None).ioctl("DRM_IOCTL_MODE_SETCRTC")?;
        if let Some(plane_manager) = self.plane_manager.lock().unwrap().as_mut() {
            plane_manager.release_crtc(crtc_id);
        }
        Ok(())
    }

    pub fn add_framebuffer2(&self, params: &FramebufferParams) -> DrmResult<u32> {
        self.backend.add_framebuffer2(params).ioctl("DRM_IOCTL_MODE_ADDFB2")
    }

    pub fn remove_framebuffer(&self, framebuffer_id: u32) -> DrmResult<()> {
        self.backend.remove_framebuffer(framebuffer_id).ioctl("DRM_IOCTL_MODE_RMFB")
    }

    /// Queues a flip of `crtc_id` to `framebuffer_id`.
    ///
    /// `callback` runs exactly once from [`DrmDevice::process_events`] after the kernel reported
    /// completion. It never runs if this returns an error.
    pub fn page_flip(
        &self,
        crtc_id: u32,
        framebuffer_id: u32,
        callback: PageFlipCallback,
    ) -> DrmResult<()> {
        // Register first, the event may be read before the ioctl returns.
        let id = {
            let mut manager = self.page_flip_manager.lock().unwrap();
            let id = manager.next_id();
            manager.register(id, 1, callback);
            id
        };

        let result = self
            .backend
            .page_flip(crtc_id, framebuffer_id, sys::DRM_MODE_PAGE_FLIP_EVENT, id)
            .ioctl("DRM_IOCTL_MODE_PAGE_FLIP");
        if let Err(e) = &result {
            log::error!("Failed to flip CRTC {crtc_id} to framebuffer {framebuffer_id}: {e}");
            self.page_flip_manager.lock().unwrap().unregister(id);
        }
        result
    }

    /// Submits an atomic commit. When `flags` requests a page flip event, `callback` runs once
    /// `crtc_count` completion events have been received.
    pub fn commit_properties(
        &self,
        request: &AtomicRequest,
        flags: u32,
        crtc_count: u32,
        callback: Option<PageFlipCallback>,
    ) -> DrmResult<()> {
        let wants_event = flags & sys::DRM_MODE_PAGE_FLIP_EVENT != 0;
        let id = match (wants_event, callback) {
            (true, Some(callback)) => {
                let mut manager = self.page_flip_manager.lock().unwrap();
                let id = manager.next_id();
                manager.register(id, crtc_count, callback);
                Some(id)
            }
            (true, None) => {
                return Err(DrmError::Other(anyhow::anyhow!(
                    "page flip event requested without a callback"
                )))
            }
            (false, _) => None,
        };

        let result = self
            .backend
            .atomic_commit(request, flags, id.unwrap_or(0))
            .ioctl("DRM_IOCTL_MODE_ATOMIC");
        if let Err(e) = &result {
            if flags & sys::DRM_MODE_ATOMIC_TEST_ONLY == 0 {
                log::error!("Atomic commit failed: {e}");
            }
            if let Some(id) = id {
                self.page_flip_manager.lock().unwrap().unregister(id);
            }
        }
        result
    }

    /// Presents one frame through the plane manager.
    pub fn commit_frame(
        &self,
        commits: &[CrtcCommit],
        callback: PageFlipCallback,
    ) -> DrmResult<()> {
        let mut plane_manager = self.plane_manager.lock().unwrap();
        let plane_manager = plane_manager
            .as_mut()
            .ok_or_else(|| DrmError::PlaneManager("device not initialized".into()))?;
        plane_manager.commit(self, commits, callback)
    }

    /// Checks whether `layers` could be scanned out together on `crtc_id`.
    pub fn test_layers(&self, crtc_id: u32, layers: &[PlaneConfig]) -> DrmResult<()> {
        let plane_manager = self.plane_manager.lock().unwrap();
        let plane_manager = plane_manager
            .as_ref()
            .ok_or_else(|| DrmError::PlaneManager("device not initialized".into()))?;
        plane_manager.test_layers(self, crtc_id, layers)
    }

    pub fn primary_formats(&self, crtc_id: u32) -> Vec<u32> {
        self.plane_manager
            .lock()
            .unwrap()
            .as_ref()
            .map(|pm| pm.primary_formats(crtc_id))
            .unwrap_or_default()
    }

    pub fn set_cursor(&self, crtc_id: u32, handle: u32, size: crate::Size) -> DrmResult<()> {
        self.backend
            .set_cursor(crtc_id, handle, size.width, size.height)
            .ioctl("DRM_IOCTL_MODE_CURSOR2")
    }

    pub fn move_cursor(&self, crtc_id: u32, location: crate::Point) -> DrmResult<()> {
        self.backend.move_cursor(crtc_id, location.x, location.y).ioctl("DRM_IOCTL_MODE_CURSOR2")
    }

    /// Programs the legacy gamma table of `crtc_id`.
    ///
    /// An empty `lut` installs an identity ramp. Otherwise `lut` must match the size reported by
    /// the kernel exactly.
    pub fn set_gamma_ramp(&self, crtc_id: u32, lut: &[GammaRampRgbEntry]) -> DrmResult<()> {
        let crtc = self.get_crtc(crtc_id).ok_or(DrmError::NoSuchObject(crtc_id))?;
        let gamma_size = crtc.gamma_size as usize;

        let ramp;
        let lut = if lut.is_empty() {
            ramp = color::linear_ramp(gamma_size);
            &ramp
        } else if lut.len() != gamma_size {
            log::error!(
                "Gamma table for CRTC {crtc_id} has {} entries, kernel expects {gamma_size}",
                lut.len()
            );
            return Err(DrmError::LutSizeMismatch { expected: gamma_size, actual: lut.len() });
        } else {
            lut
        };

        let [red, green, blue] = color::split_channels(lut);
        self.backend.set_gamma(crtc_id, &red, &green, &blue).ioctl("DRM_IOCTL_MODE_SETGAMMA")
    }

    fn set_blob_property(
        &self,
        crtc_id: u32,
        properties: &[(Property, u64)],
        name: &'static str,
        data: Option<Vec<u8>>,
    ) -> DrmResult<()> {
        let (prop, _) = properties
            .iter()
            .find(|(prop, _)| prop.name == name)
            .ok_or(DrmError::MissingProperty(name))?;

        let blob_id = match data {
            Some(data) => self.create_property_blob(&data)?,
            None => 0,
        };
        let result = self.set_property(crtc_id, ObjectType::Crtc, prop.id, blob_id as u64);
        // The property holds its own reference to the blob.
        if blob_id != 0 {
            if let Err(e) = self.destroy_property_blob(blob_id) {
                log::warn!("Failed to release {name} blob {blob_id}: {e}");
            }
        }
        result
    }

    /// Applies degamma, gamma and color transform matrix to `crtc_id`.
    ///
    /// CRTCs without `DEGAMMA_LUT_SIZE`/`GAMMA_LUT_SIZE` fall back to the legacy gamma ramp, in
    /// which case only `gamma_lut` is used. Otherwise the tables are resampled to the kernel sizes
    /// and set as blobs, an empty table or matrix clearing its property. The three properties are
    /// set one after the other; a failure leaves the earlier ones applied.
    pub fn set_color_correction(
        &self,
        crtc_id: u32,
        degamma_lut: &[GammaRampRgbEntry],
        gamma_lut: &[GammaRampRgbEntry],
        correction_matrix: &[f32],
    ) -> DrmResult<()> {
        let properties = self.get_named_properties(crtc_id, ObjectType::Crtc)?;
        let size_of = |name: &str| {
            properties.iter().find(|(prop, _)| prop.name == name).map(|(_, v)| *v as usize)
        };

        let (degamma_size, gamma_size) =
            match (size_of("DEGAMMA_LUT_SIZE"), size_of("GAMMA_LUT_SIZE")) {
                (Some(degamma), Some(gamma)) if degamma > 0 && gamma > 0 => (degamma, gamma),
                _ => {
                    log::debug!("CRTC {crtc_id} has no color management, using legacy gamma");
                    if !degamma_lut.is_empty() || !correction_matrix.is_empty() {
                        log::warn!("Degamma and color matrix ignored on CRTC {crtc_id}");
                    }
                    return self.set_gamma_ramp(crtc_id, gamma_lut);
                }
            };

        let degamma = (!degamma_lut.is_empty())
            .then(|| color::lut_blob(&color::resample_lut(degamma_lut, degamma_size)));
        let gamma = (!gamma_lut.is_empty())
            .then(|| color::lut_blob(&color::resample_lut(gamma_lut, gamma_size)));
        let ctm = if correction_matrix.is_empty() {
            None
        } else {
            Some(color::ctm_blob(correction_matrix).ok_or_else(|| {
                DrmError::Other(anyhow::anyhow!(
                    "color matrix needs 9 coefficients, got {}",
                    correction_matrix.len()
                ))
            }))
        };

        self.set_blob_property(crtc_id, &properties, "DEGAMMA_LUT", degamma)?;
        self.set_blob_property(crtc_id, &properties, "GAMMA_LUT", gamma)?;
        let ctm = ctm.transpose().map_err(|e| {
            log::error!("CRTC {crtc_id}: {e}, degamma and gamma stay applied");
            e
        })?;
        self.set_blob_property(crtc_id, &properties, "CTM", ctm)
    }

    pub fn create_dumb_buffer(&self, size: crate::Size) -> DrmResult<DumbAllocation> {
        self.backend
            .create_dumb_buffer(size.width, size.height, 32)
            .ioctl("DRM_IOCTL_MODE_CREATE_DUMB")
    }

    pub fn map_dumb_buffer(
        &self,
        handle: u32,
        len: usize,
    ) -> DrmResult<std::ptr::NonNull<nix::libc::c_void>> {
        self.backend.map_dumb_buffer(handle, len).ioctl("DRM_IOCTL_MODE_MAP_DUMB")
    }

    pub fn destroy_dumb_buffer(&self, handle: u32) -> DrmResult<()> {
        self.backend.destroy_dumb_buffer(handle).ioctl("DRM_IOCTL_MODE_DESTROY_DUMB")
    }

    pub fn close_gem_handle(&self, handle: u32) -> DrmResult<()> {
        self.backend.close_gem_handle(handle).ioctl("DRM_IOCTL_GEM_CLOSE")
    }

    pub fn prime_fd_to_handle(&self, fd: BorrowedFd<'_>) -> DrmResult<u32> {
        self.backend.prime_fd_to_handle(fd).ioctl("DRM_IOCTL_PRIME_FD_TO_HANDLE")
    }

    /// Reads pending kernel events and runs the callbacks of completed flips. Returns the number
    /// of callbacks that ran.
    pub fn process_events(&self) -> DrmResult<usize> {
        let mut buf = [0u8; EVENT_BUFFER_SIZE];
        let len = match self.backend.read_events(&mut buf) {
            Ok(len) => len,
            Err(Errno::EAGAIN) => return Ok(0),
            Err(errno) => return Err(DrmError::Ioctl { op: "read events", errno }),
        };

        let mut completed = vec![];
        {
            let mut manager = self.page_flip_manager.lock().unwrap();
            for event in EventIterator::new(&buf[..len]) {
                match event {
                    DrmEvent::FlipComplete(flip) => {
                        let event = PageFlipEvent {
                            frame: flip.sequence,
                            seconds: flip.tv_sec,
                            useconds: flip.tv_usec,
                        };
                        completed.extend(manager.on_page_flip(flip.user_data, event));
                    }
                    DrmEvent::Vblank(vblank) => {
                        log::trace!("Ignoring vblank on CRTC {}", vblank.crtc_id)
                    }
                    DrmEvent::Unknown { type_, .. } => {
                        log::debug!("Ignoring DRM event of type {type_:#x}")
                    }
                }
            }
        }

        let count = completed.len();
        for (callback, event) in completed {
            callback(event);
        }
        Ok(count)
    }

    pub fn pending_page_flips(&self) -> usize {
        self.page_flip_manager.lock().unwrap().pending_count()
    }

    /// Drops every outstanding page flip. Called when the device goes away and the kernel will
    /// never deliver their events.
    pub fn abandon_page_flips(&self) -> usize {
        self.page_flip_manager.lock().unwrap().abandon_all()
    }
}
