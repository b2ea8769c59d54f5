// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::ffi::CStr;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::ops::Bound;
use std::ops::RangeBounds;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

use drm::buffer;
use drm::buffer::DrmFourcc;
use drm::buffer::DrmModifier;
use drm::buffer::PlanarBuffer;
use drm::control;
use drm::control::connector;
use drm::control::crtc;
use drm::control::encoder;
use drm::control::framebuffer;
use drm::control::plane;
use drm::control::property;
use drm::control::Device as ControlDevice;
use drm::control::FbCmd2Flags;
use drm::control::Mode;
use drm::ClientCapability;
use drm::Device;
use drm::DriverCapability;
use nix::errno::Errno;
use nix::libc;
use nix::sys::mman::mmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use nix::unistd::read;

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

/// Result of a dumb buffer allocation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DumbAllocation {
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

/// The kernel DRM/KMS surface used by [`crate::drm::DrmDevice`].
///
/// Every method maps to one kernel request (or one read of the event stream) and reports the raw
/// errno on failure. Implementations must be callable from any thread, but the crate only drives
/// them from the DRM thread.
pub trait DrmBackend: Send + Sync {
    /// File descriptor to watch for readable DRM events.
    fn poll_fd(&self) -> BorrowedFd<'_>;

    fn get_cap(&self, capability: DriverCapability) -> nix::Result<u64>;
    fn set_client_cap(&self, capability: ClientCapability, enable: bool) -> nix::Result<()>;
    fn set_master(&self) -> nix::Result<()>;
    fn drop_master(&self) -> nix::Result<()>;

    fn get_resources(&self) -> nix::Result<Resources>;
    fn get_crtc(&self, crtc_id: u32) -> nix::Result<Crtc>;
    fn set_crtc(
        &self,
        crtc_id: u32,
        fb_id: u32,
        x: u32,
        y: u32,
        connectors: &[u32],
        mode: Option<&ModeInfo>,
    ) -> nix::Result<()>;
    fn get_connector(&self, connector_id: u32) -> nix::Result<Connector>;
    fn get_encoder(&self, encoder_id: u32) -> nix::Result<Encoder>;
    fn get_plane_resources(&self) -> nix::Result<Vec<u32>>;
    fn get_plane(&self, plane_id: u32) -> nix::Result<Plane>;

    fn get_object_properties(
        &self,
        object_id: u32,
        object_type: ObjectType,
    ) -> nix::Result<Vec<PropertyValue>>;
    fn get_property(&self, property_id: u32) -> nix::Result<Property>;
    fn set_object_property(
        &self,
        object_id: u32,
        object_type: ObjectType,
        property_id: u32,
        value: u64,
    ) -> nix::Result<()>;
    fn get_property_blob(&self, blob_id: u32) -> nix::Result<Vec<u8>>;
    fn create_property_blob(&self, data: &[u8]) -> nix::Result<u32>;
    fn destroy_property_blob(&self, blob_id: u32) -> nix::Result<()>;

    fn add_framebuffer2(&self, params: &FramebufferParams) -> nix::Result<u32>;
    fn remove_framebuffer(&self, fb_id: u32) -> nix::Result<()>;
    fn page_flip(&self, crtc_id: u32, fb_id: u32, flags: u32, user_data: u64) -> nix::Result<()>;
    fn atomic_commit(&self, request: &AtomicRequest, flags: u32, user_data: u64)
        -> nix::Result<()>;

    fn set_cursor(&self, crtc_id: u32, handle: u32, width: u32, height: u32) -> nix::Result<()>;
    fn move_cursor(&self, crtc_id: u32, x: i32, y: i32) -> nix::Result<()>;

    fn get_gamma(&self, crtc_id: u32, size: usize) -> nix::Result<[Vec<u16>; 3]>;
    fn set_gamma(&self, crtc_id: u32, red: &[u16], green: &[u16], blue: &[u16])
        -> nix::Result<()>;

    fn create_dumb_buffer(&self, width: u32, height: u32, bpp: u32) -> nix::Result<DumbAllocation>;
    /// Maps `len` bytes of a dumb buffer into the address space of the process.
    fn map_dumb_buffer(&self, handle: u32, len: usize) -> nix::Result<NonNull<libc::c_void>>;
    fn destroy_dumb_buffer(&self, handle: u32) -> nix::Result<()>;
    fn close_gem_handle(&self, handle: u32) -> nix::Result<()>;
    fn prime_fd_to_handle(&self, fd: BorrowedFd<'_>) -> nix::Result<u32>;
    fn prime_handle_to_fd(&self, handle: u32) -> nix::Result<OwnedFd>;

    /// Reads pending DRM events into `buf`, returning the number of bytes read.
    fn read_events(&self, buf: &mut [u8]) -> nix::Result<usize>;
}


/// An open DRM device file driven through the `drm` crate.
#[derive(Debug)]
struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

/// [`DrmBackend`] talking to the kernel through an open DRM device file.
#[derive(Debug)]
pub struct KernelBackend {
    card: Card,
}

impl KernelBackend {
    pub fn new(file: File) -> Self {
        Self { card: Card(file) }
    }

    fn raw_fd(&self) -> libc::c_int {
        self.card.as_fd().as_raw_fd()
    }

    /// Turns a `possible_crtcs` filter back into the bitmask of CRTC indices the kernel reported.
    fn crtc_mask(&self, filter: control::CrtcListFilter) -> nix::Result<u32> {
        let res = self.card.resource_handles().map_err(errno)?;
        let allowed = res.filter_crtcs(filter);
        Ok(res
            .crtcs()
            .iter()
            .enumerate()
            .filter(|(_, crtc)| allowed.contains(crtc))
            .fold(0, |mask, (index, _)| mask | 1 << index))
    }
}

fn errno(err: io::Error) -> Errno {
    err.raw_os_error().map_or(Errno::EIO, Errno::from_raw)
}

fn handle<T: From<control::RawResourceHandle>>(id: u32) -> nix::Result<T> {
    control::from_u32(id).ok_or(Errno::EINVAL)
}

fn raw_id<T: Into<u32>>(handle: Option<T>) -> u32 {
    handle.map_or(0, Into::into)
}

fn range(bounds: impl RangeBounds<u32>) -> (u32, u32) {
    let min = match bounds.start_bound() {
        Bound::Included(&v) => v,
        Bound::Excluded(&v) => v.saturating_add(1),
        Bound::Unbounded => 0,
    };
    let max = match bounds.end_bound() {
        Bound::Included(&v) => v,
        Bound::Excluded(&v) => v.saturating_sub(1),
        Bound::Unbounded => u32::MAX,
    };
    (min, max)
}

fn ptr_of<T>(v: &mut [T]) -> u64 {
    if v.is_empty() {
        0
    } else {
        v.as_mut_ptr() as u64
    }
}

fn lossy(name: &CStr) -> String {
    name.to_string_lossy().into_owned()
}

impl From<&Mode> for ModeInfo {
    fn from(mode: &Mode) -> Self {
        let (hdisplay, vdisplay) = mode.size();
        let (hsync_start, hsync_end, htotal) = mode.hsync();
        let (vsync_start, vsync_end, vtotal) = mode.vsync();
        Self {
            clock: mode.clock(),
            hdisplay,
            hsync_start,
            hsync_end,
            htotal,
            hskew: mode.hskew(),
            vdisplay,
            vsync_start,
            vsync_end,
            vtotal,
            vscan: mode.vscan(),
            vrefresh: mode.vrefresh(),
            flags: mode.flags().bits(),
            type_: mode.mode_type().bits(),
            name: lossy(mode.name()),
        }
    }
}

/// Builds the kernel mode for `mode`, truncating the name to fit the fixed size field.
fn kernel_mode(mode: &ModeInfo) -> Mode {
    let mut name = [0 as libc::c_char; sys::DRM_DISPLAY_MODE_LEN];
    for (dst, &src) in name[..sys::DRM_DISPLAY_MODE_LEN - 1].iter_mut().zip(mode.name.as_bytes()) {
        *dst = src as libc::c_char;
    }
    Mode::from(drm_ffi::drm_mode_modeinfo {
        clock: mode.clock,
        hdisplay: mode.hdisplay,
        hsync_start: mode.hsync_start,
        hsync_end: mode.hsync_end,
        htotal: mode.htotal,
        hskew: mode.hskew,
        vdisplay: mode.vdisplay,
        vsync_start: mode.vsync_start,
        vsync_end: mode.vsync_end,
        vtotal: mode.vtotal,
        vscan: mode.vscan,
        vrefresh: mode.vrefresh,
        flags: mode.flags,
        type_: mode.type_,
        name,
    })
}

/// A framebuffer registration expressed as the planar buffer the `drm` crate expects.
struct FramebufferPlanes<'a> {
    params: &'a FramebufferParams,
    format: DrmFourcc,
}

impl PlanarBuffer for FramebufferPlanes<'_> {
    fn size(&self) -> (u32, u32) {
        (self.params.width, self.params.height)
    }

    fn format(&self) -> DrmFourcc {
        self.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        self.params.use_modifiers.then(|| DrmModifier::from(self.params.modifiers[0]))
    }

    fn pitches(&self) -> [u32; 4] {
        self.params.pitches
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        self.params.handles.map(control::from_u32)
    }

    fn offsets(&self) -> [u32; 4] {
        self.params.offsets
    }
}

/// A cursor image known only by its GEM handle.
struct CursorImage {
    handle: buffer::Handle,
    width: u32,
    height: u32,
}

impl buffer::Buffer for CursorImage {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn format(&self) -> DrmFourcc {
        DrmFourcc::Argb8888
    }

    fn pitch(&self) -> u32 {
        self.width * 4
    }

    fn handle(&self) -> buffer::Handle {
        self.handle
    }
}

impl DrmBackend for KernelBackend {
    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.card.as_fd()
    }

    fn get_cap(&self, capability: DriverCapability) -> nix::Result<u64> {
        self.card.get_driver_capability(capability).map_err(errno)
    }

    fn set_client_cap(&self, capability: ClientCapability, enable: bool) -> nix::Result<()> {
        self.card.set_client_capability(capability, enable).map_err(errno)
    }

    fn set_master(&self) -> nix::Result<()> {
        self.card.acquire_master_lock().map_err(errno)
    }

    fn drop_master(&self) -> nix::Result<()> {
        self.card.release_master_lock().map_err(errno)
    }

    fn get_resources(&self) -> nix::Result<Resources> {
        let res = self.card.resource_handles().map_err(errno)?;
        let (min_width, max_width) = range(res.supported_fb_width());
        let (min_height, max_height) = range(res.supported_fb_height());
        Ok(Resources {
            fbs: res.framebuffers().iter().copied().map(u32::from).collect(),
            crtcs: res.crtcs().iter().copied().map(u32::from).collect(),
            connectors: res.connectors().iter().copied().map(u32::from).collect(),
            encoders: res.encoders().iter().copied().map(u32::from).collect(),
            min_width,
            max_width,
            min_height,
            max_height,
        })
    }

    fn get_crtc(&self, crtc_id: u32) -> nix::Result<Crtc> {
        let info = self.card.get_crtc(handle(crtc_id)?).map_err(errno)?;
        let (x, y) = info.position();
        Ok(Crtc {
            id: crtc_id,
            fb_id: raw_id(info.framebuffer()),
            x,
            y,
            gamma_size: info.gamma_length(),
            mode: info.mode().as_ref().map(ModeInfo::from),
        })
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
        let connectors = connectors
            .iter()
            .map(|&id| handle::<connector::Handle>(id))
            .collect::<nix::Result<Vec<_>>>()?;
        self.card
            .set_crtc(
                handle(crtc_id)?,
                control::from_u32::<framebuffer::Handle>(fb_id),
                (x, y),
                &connectors,
                mode.map(kernel_mode),
            )
            .map_err(errno)
    }

    fn get_connector(&self, connector_id: u32) -> nix::Result<Connector> {
        let info = self.card.get_connector(handle(connector_id)?, true).map_err(errno)?;
        let (mm_width, mm_height) = info.size().unwrap_or((0, 0));
        Ok(Connector {
            id: connector_id,
            connector_type: u32::from(info.interface()),
            connector_type_id: info.interface_id(),
            connection: match info.state() {
                connector::State::Connected => Connection::Connected,
                connector::State::Disconnected => Connection::Disconnected,
                _ => Connection::Unknown,
            },
            mm_width,
            mm_height,
            encoder_id: raw_id(info.current_encoder()),
            encoders: info.encoders().iter().copied().map(u32::from).collect(),
            modes: info.modes().iter().map(ModeInfo::from).collect(),
        })
    }

    fn get_encoder(&self, encoder_id: u32) -> nix::Result<Encoder> {
        let info = self.card.get_encoder(handle::<encoder::Handle>(encoder_id)?).map_err(errno)?;
        Ok(Encoder {
            id: encoder_id,
            crtc_id: raw_id(info.crtc()),
            possible_crtcs: self.crtc_mask(info.possible_crtcs())?,
        })
    }

    fn get_plane_resources(&self) -> nix::Result<Vec<u32>> {
        let planes = self.card.plane_handles().map_err(errno)?;
        Ok(planes.into_iter().map(u32::from).collect())
    }

    fn get_plane(&self, plane_id: u32) -> nix::Result<Plane> {
        let info = self.card.get_plane(handle::<plane::Handle>(plane_id)?).map_err(errno)?;
        Ok(Plane {
            id: plane_id,
            crtc_id: raw_id(info.crtc()),
            fb_id: raw_id(info.framebuffer()),
            possible_crtcs: self.crtc_mask(info.possible_crtcs())?,
            formats: info.formats().to_vec(),
        })
    }

    fn get_object_properties(
        &self,
        object_id: u32,
        object_type: ObjectType,
    ) -> nix::Result<Vec<PropertyValue>> {
        let props = match object_type {
            ObjectType::Crtc => self.card.get_properties(handle::<crtc::Handle>(object_id)?),
            ObjectType::Connector => {
                self.card.get_properties(handle::<connector::Handle>(object_id)?)
            }
            ObjectType::Encoder => self.card.get_properties(handle::<encoder::Handle>(object_id)?),
            ObjectType::Plane => self.card.get_properties(handle::<plane::Handle>(object_id)?),
        }
        .map_err(errno)?;
        let (ids, values) = props.as_props_and_values();
        Ok(ids
            .iter()
            .zip(values)
            .map(|(&id, &value)| PropertyValue { id: id.into(), value })
            .collect())
    }

    fn get_property(&self, property_id: u32) -> nix::Result<Property> {
        let info = self.card.get_property(handle(property_id)?).map_err(errno)?;
        let mut flags = if info.mutable() { 0 } else { sys::DRM_MODE_PROP_IMMUTABLE };
        let mut values = vec![];
        let mut enums = vec![];
        match info.value_type() {
            property::ValueType::Boolean => {
                flags |= sys::DRM_MODE_PROP_RANGE;
                values = vec![0, 1];
            }
            property::ValueType::UnsignedRange(min, max) => {
                flags |= sys::DRM_MODE_PROP_RANGE;
                values = vec![min, max];
            }
            property::ValueType::SignedRange(min, max) => {
                flags |= sys::DRM_MODE_PROP_RANGE;
                values = vec![min as u64, max as u64];
            }
            property::ValueType::Enum(list) => {
                flags |= sys::DRM_MODE_PROP_ENUM;
                let (_, entries) = list.values();
                enums = entries.iter().map(|e| (e.value(), lossy(e.name()))).collect();
            }
            property::ValueType::Bitmask => flags |= sys::DRM_MODE_PROP_BITMASK,
            property::ValueType::Blob => flags |= sys::DRM_MODE_PROP_BLOB,
            _ => (),
        }
        Ok(Property { id: property_id, name: lossy(info.name()), flags, values, enums })
    }

    fn set_object_property(
        &self,
        object_id: u32,
        object_type: ObjectType,
        property_id: u32,
        value: u64,
    ) -> nix::Result<()> {
        let prop = handle::<property::Handle>(property_id)?;
        match object_type {
            ObjectType::Crtc => {
                self.card.set_property(handle::<crtc::Handle>(object_id)?, prop, value)
            }
            ObjectType::Connector => {
                self.card.set_property(handle::<connector::Handle>(object_id)?, prop, value)
            }
            ObjectType::Encoder => {
                self.card.set_property(handle::<encoder::Handle>(object_id)?, prop, value)
            }
            ObjectType::Plane => {
                self.card.set_property(handle::<plane::Handle>(object_id)?, prop, value)
            }
        }
        .map_err(errno)
    }

    fn get_property_blob(&self, blob_id: u32) -> nix::Result<Vec<u8>> {
        self.card.get_property_blob(blob_id as u64).map_err(errno)
    }

    fn create_property_blob(&self, data: &[u8]) -> nix::Result<u32> {
        // The `drm` crate only creates blobs from fixed size values, LUTs vary per CRTC.
        let mut data = data.to_vec();
        let blob =
            drm_ffi::mode::create_property_blob(self.card.as_fd(), &mut data).map_err(errno)?;
        Ok(blob.blob_id)
    }

    fn destroy_property_blob(&self, blob_id: u32) -> nix::Result<()> {
        self.card.destroy_property_blob(blob_id as u64).map_err(errno)
    }

    fn add_framebuffer2(&self, params: &FramebufferParams) -> nix::Result<u32> {
        let format = DrmFourcc::try_from(params.format).map_err(|_| Errno::EINVAL)?;
        let flags =
            if params.use_modifiers { FbCmd2Flags::MODIFIERS } else { FbCmd2Flags::empty() };
        let fb = self
            .card
            .add_planar_framebuffer(&FramebufferPlanes { params, format }, flags)
            .map_err(errno)?;
        Ok(fb.into())
    }

    fn remove_framebuffer(&self, fb_id: u32) -> nix::Result<()> {
        self.card.destroy_framebuffer(handle(fb_id)?).map_err(errno)
    }

    // Page flips and atomic commits go through raw ioctls: the `drm` crate fills the event
    // `user_data` with the CRTC id, and flips are matched back by their own id.
    fn page_flip(&self, crtc_id: u32, fb_id: u32, flags: u32, user_data: u64) -> nix::Result<()> {
        let mut flip =
            sys::drm_mode_crtc_page_flip { crtc_id, fb_id, flags, reserved: 0, user_data };
        unsafe { sys::drm_ioctl_mode_page_flip(self.raw_fd(), &mut flip) }?;
        Ok(())
    }

    fn atomic_commit(
        &self,
        request: &AtomicRequest,
        flags: u32,
        user_data: u64,
    ) -> nix::Result<()> {
        let mut objs = vec![];
        let mut count_props = vec![];
        let mut props = vec![];
        let mut values = vec![];
        for (object_id, properties) in request.objects() {
            objs.push(*object_id);
            count_props.push(properties.len() as u32);
            for prop in properties {
                props.push(prop.id);
                values.push(prop.value);
            }
        }
        let mut atomic = sys::drm_mode_atomic {
            flags,
            count_objs: objs.len() as u32,
            objs_ptr: ptr_of(&mut objs),
            count_props_ptr: ptr_of(&mut count_props),
            props_ptr: ptr_of(&mut props),
            prop_values_ptr: ptr_of(&mut values),
            reserved: 0,
            user_data,
        };
        unsafe { sys::drm_ioctl_mode_atomic(self.raw_fd(), &mut atomic) }?;
        Ok(())
    }

    fn set_cursor(&self, crtc_id: u32, handle_id: u32, width: u32, height: u32) -> nix::Result<()> {
        let image =
            control::from_u32(handle_id).map(|handle| CursorImage { handle, width, height });
        self.card.set_cursor2(handle(crtc_id)?, image.as_ref(), (0, 0)).map_err(errno)
    }

    fn move_cursor(&self, crtc_id: u32, x: i32, y: i32) -> nix::Result<()> {
        self.card.move_cursor(handle(crtc_id)?, (x, y)).map_err(errno)
    }

    fn get_gamma(&self, crtc_id: u32, size: usize) -> nix::Result<[Vec<u16>; 3]> {
        let mut red = vec![0u16; size];
        let mut green = vec![0u16; size];
        let mut blue = vec![0u16; size];
        self.card
            .get_gamma(handle(crtc_id)?, &mut red, &mut green, &mut blue)
            .map_err(errno)?;
        Ok([red, green, blue])
    }

    fn set_gamma(
        &self,
        crtc_id: u32,
        red: &[u16],
        green: &[u16],
        blue: &[u16],
    ) -> nix::Result<()> {
        if red.len() != green.len() || red.len() != blue.len() {
            return Err(Errno::EINVAL);
        }
        self.card.set_gamma(handle(crtc_id)?, red, green, blue).map_err(errno)
    }

    // Dumb buffers are tracked by GEM handle, which the `drm` crate's borrowing `DumbBuffer`
    // mapping cannot express, so they use the crate's ffi layer.
    fn create_dumb_buffer(&self, width: u32, height: u32, bpp: u32) -> nix::Result<DumbAllocation> {
        let create = drm_ffi::mode::dumbbuffer::create(self.card.as_fd(), width, height, bpp, 0)
            .map_err(errno)?;
        Ok(DumbAllocation { handle: create.handle, pitch: create.pitch, size: create.size })
    }

    fn map_dumb_buffer(&self, handle: u32, len: usize) -> nix::Result<NonNull<libc::c_void>> {
        let map =
            drm_ffi::mode::dumbbuffer::map(self.card.as_fd(), handle, 0, 0).map_err(errno)?;
        let len = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
        unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                self.card.as_fd(),
                map.offset as libc::off_t,
            )
        }
    }

    fn destroy_dumb_buffer(&self, handle: u32) -> nix::Result<()> {
        drm_ffi::mode::dumbbuffer::destroy(self.card.as_fd(), handle).map_err(errno)?;
        Ok(())
    }

    fn close_gem_handle(&self, handle_id: u32) -> nix::Result<()> {
        self.card.close_buffer(handle(handle_id)?).map_err(errno)
    }

    fn prime_fd_to_handle(&self, fd: BorrowedFd<'_>) -> nix::Result<u32> {
        let handle = self.card.prime_fd_to_buffer(fd).map_err(errno)?;
        Ok(handle.into())
    }

    fn prime_handle_to_fd(&self, handle_id: u32) -> nix::Result<OwnedFd> {
        let flags = (libc::O_CLOEXEC | libc::O_RDWR) as u32;
        self.card.buffer_to_prime_fd(handle(handle_id)?, flags).map_err(errno)
    }

    fn read_events(&self, buf: &mut [u8]) -> nix::Result<usize> {
        loop {
            match read(self.raw_fd(), buf) {
                Err(Errno::EINTR) => continue,
                result => return result,
            }
        }
    }
}
