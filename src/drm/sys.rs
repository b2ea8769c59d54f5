// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Kernel DRM/KMS uAPI definitions the `drm` crate does not expose.
//!
//! Covers page flips and atomic commits carrying caller chosen `user_data`, the event records
//! that hand it back, and the color management blob layouts. Layouts follow
//! include/uapi/drm/drm.h and include/uapi/drm/drm_mode.h and must stay bit-exact.

#![allow(non_camel_case_types)]

use nix::ioctl_readwrite;

const DRM_IOCTL_BASE: u8 = b'd';

pub const DRM_DISPLAY_MODE_LEN: usize = 32;

pub const DRM_MODE_PAGE_FLIP_EVENT: u32 = 0x01;

pub const DRM_MODE_ATOMIC_TEST_ONLY: u32 = 0x0100;
pub const DRM_MODE_ATOMIC_NONBLOCK: u32 = 0x0200;

pub const DRM_MODE_PROP_RANGE: u32 = 1 << 1;
pub const DRM_MODE_PROP_IMMUTABLE: u32 = 1 << 2;
pub const DRM_MODE_PROP_ENUM: u32 = 1 << 3;
pub const DRM_MODE_PROP_BLOB: u32 = 1 << 4;
pub const DRM_MODE_PROP_BITMASK: u32 = 1 << 5;

pub const DRM_MODE_OBJECT_CRTC: u32 = 0xcccccccc;
pub const DRM_MODE_OBJECT_CONNECTOR: u32 = 0xc0c0c0c0;
pub const DRM_MODE_OBJECT_ENCODER: u32 = 0xe0e0e0e0;
pub const DRM_MODE_OBJECT_PLANE: u32 = 0xeeeeeeee;

pub const DRM_MODE_TYPE_PREFERRED: u32 = 1 << 3;

pub const DRM_EVENT_VBLANK: u32 = 0x01;
pub const DRM_EVENT_FLIP_COMPLETE: u32 = 0x02;

pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_crtc_page_flip {
    pub crtc_id: u32,
    pub fb_id: u32,
    pub flags: u32,
    pub reserved: u32,
    pub user_data: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_atomic {
    pub flags: u32,
    pub count_objs: u32,
    pub objs_ptr: u64,
    pub count_props_ptr: u64,
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub reserved: u64,
    pub user_data: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_event {
    pub type_: u32,
    pub length: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_event_vblank {
    pub base: drm_event,
    pub user_data: u64,
    pub tv_sec: u32,
    pub tv_usec: u32,
    pub sequence: u32,
    pub crtc_id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_color_lut {
    pub red: u16,
    pub green: u16,
    pub blue: u16,
    pub reserved: u16,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_color_ctm {
    /// Sign-magnitude S31.32 fixed point, row major.
    pub matrix: [u64; 9],
}

ioctl_readwrite!(drm_ioctl_mode_page_flip, DRM_IOCTL_BASE, 0xb0, drm_mode_crtc_page_flip);
ioctl_readwrite!(drm_ioctl_mode_atomic, DRM_IOCTL_BASE, 0xbc, drm_mode_atomic);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uapi_layouts() {
        assert_eq!(std::mem::size_of::<drm_mode_crtc_page_flip>(), 24);
        assert_eq!(std::mem::size_of::<drm_mode_atomic>(), 56);
        assert_eq!(std::mem::size_of::<drm_event_vblank>(), 32);
        assert_eq!(std::mem::size_of::<drm_color_lut>(), 8);
        assert_eq!(std::mem::size_of::<drm_color_ctm>(), 72);
    }
}
