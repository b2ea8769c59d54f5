// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Synchronous access to a single DRM/KMS device.
//!
//! [`device::DrmDevice`] wraps one open DRM file and everything that is tied to it: the plane
//! manager chosen at initialization, the registry of pending page flips and the property blob
//! helpers used for color correction. The kernel itself is abstracted behind
//! [`backend::DrmBackend`] so that the rest of the crate never issues ioctls directly.

use nix::errno::Errno;
use thiserror::Error;

pub mod backend;
pub mod color;
pub mod device;
pub mod dumb_buffer;
pub mod events;
#[cfg(test)]
pub(crate) mod fake;
pub mod page_flip;
pub mod plane_manager;
pub mod sys;

pub use device::DrmDevice;

#[derive(Debug, Error)]
pub enum DrmError {
    #[error("{op} failed: {errno}")]
    Ioctl { op: &'static str, errno: Errno },
    #[error("device file is not valid")]
    InvalidFile,
    #[error("device cannot be queried for resources, not a modesetting device")]
    NotModesetting,
    #[error("plane manager error: {0}")]
    PlaneManager(String),
    #[error("lookup table size mismatch: kernel expects {expected} entries, got {actual}")]
    LutSizeMismatch { expected: usize, actual: usize },
    #[error("missing property {0}")]
    MissingProperty(&'static str),
    #[error("no such object {0}")]
    NoSuchObject(u32),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type DrmResult<T> = Result<T, DrmError>;

/// Adapts a raw `nix` result into a [`DrmError::Ioctl`] carrying the name of the failed call.
pub(crate) trait IoctlResultExt<T> {
    fn ioctl(self, op: &'static str) -> DrmResult<T>;
}

impl<T> IoctlResultExt<T> for nix::Result<T> {
    fn ioctl(self, op: &'static str) -> DrmResult<T> {
        self.map_err(|errno| DrmError::Ioctl { op, errno })
    }
}

/// KMS object types, as tagged in property queries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, enumn::N)]
#[repr(u32)]
pub enum ObjectType {
    Crtc = sys::DRM_MODE_OBJECT_CRTC,
    Connector = sys::DRM_MODE_OBJECT_CONNECTOR,
    Encoder = sys::DRM_MODE_OBJECT_ENCODER,
    Plane = sys::DRM_MODE_OBJECT_PLANE,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, enumn::N)]
#[repr(u32)]
pub enum Connection {
    Connected = 1,
    Disconnected = 2,
    Unknown = 3,
}

/// A display timing, as reported by a connector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModeInfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub type_: u32,
    pub name: String,
}

impl ModeInfo {
    pub fn size(&self) -> crate::Size {
        crate::Size::new(self.hdisplay as u32, self.vdisplay as u32)
    }

    pub fn is_preferred(&self) -> bool {
        self.type_ & sys::DRM_MODE_TYPE_PREFERRED != 0
    }

    /// Refresh rate in Hz computed from the pixel clock, falling back to the kernel's rounded
    /// value when the timings are incomplete.
    pub fn refresh_rate(&self) -> f32 {
        if self.htotal == 0 || self.vtotal == 0 {
            return self.vrefresh as f32;
        }
        let clock = self.clock as f32 * 1000.0;
        clock / (self.htotal as f32 * self.vtotal as f32)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resources {
    pub fbs: Vec<u32>,
    pub crtcs: Vec<u32>,
    pub connectors: Vec<u32>,
    pub encoders: Vec<u32>,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Crtc {
    pub id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub gamma_size: u32,
    pub mode: Option<ModeInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connector {
    pub id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: Connection,
    pub mm_width: u32,
    pub mm_height: u32,
    pub encoder_id: u32,
    pub encoders: Vec<u32>,
    pub modes: Vec<ModeInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Encoder {
    pub id: u32,
    pub crtc_id: u32,
    pub possible_crtcs: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plane {
    pub id: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub possible_crtcs: u32,
    pub formats: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Property {
    pub id: u32,
    pub name: String,
    pub flags: u32,
    pub values: Vec<u64>,
    pub enums: Vec<(u64, String)>,
}

impl Property {
    pub fn is_blob(&self) -> bool {
        self.flags & sys::DRM_MODE_PROP_BLOB != 0
    }

    /// Looks up the value of a named enum entry.
    pub fn enum_value(&self, name: &str) -> Option<u64> {
        self.enums.iter().find(|(_, n)| n == name).map(|(v, _)| *v)
    }

    pub fn enum_name(&self, value: u64) -> Option<&str> {
        self.enums.iter().find(|(v, _)| *v == value).map(|(_, n)| n.as_str())
    }
}

/// A property id and the current value it has on some object.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PropertyValue {
    pub id: u32,
    pub value: u64,
}

/// Parameters of a framebuffer registration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FramebufferParams {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    /// Per plane format modifiers. Only passed to the kernel when `use_modifiers` is set.
    pub modifiers: [u64; 4],
    pub use_modifiers: bool,
}

/// Property assignments for one atomic commit, grouped by object in insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AtomicRequest {
    objects: Vec<(u32, Vec<PropertyValue>)>,
}

impl AtomicRequest {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_property(&mut self, object_id: u32, property_id: u32, value: u64) {
        let prop = PropertyValue { id: property_id, value };
        match self.objects.iter_mut().find(|(id, _)| *id == object_id) {
            Some((_, props)) => match props.iter_mut().find(|p| p.id == property_id) {
                Some(existing) => existing.value = value,
                None => props.push(prop),
            },
            None => self.objects.push((object_id, vec![prop])),
        }
    }

    pub fn objects(&self) -> &[(u32, Vec<PropertyValue>)] {
        &self.objects
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn value_of(&self, object_id: u32, property_id: u32) -> Option<u64> {
        self.objects
            .iter()
            .find(|(id, _)| *id == object_id)
            .and_then(|(_, props)| props.iter().find(|p| p.id == property_id))
            .map(|p| p.value)
    }
}
