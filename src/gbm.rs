// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! GPU buffer allocation and sharing.
//!
//! Buffers are allocated through a [`BufferAllocator`] bound to a [`crate::drm::DrmDevice`]. With
//! the `gbm` feature enabled, [`device::GbmDevice`] provides one backed by libgbm.

use std::os::fd::OwnedFd;
use std::path::PathBuf;

use drm_fourcc::DrmFourcc;
use nix::errno::Errno;
use thiserror::Error;

use crate::drm::DrmError;
use crate::Fourcc;
use crate::Size;

pub mod buffer;
#[cfg(feature = "gbm")]
pub mod device;
#[cfg(test)]
pub(crate) mod fake;
pub mod pixmap;

pub use buffer::GbmBuffer;
pub use pixmap::GbmPixmap;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("failed to allocate {format:?} buffer of size {size}")]
    Allocation { format: Fourcc, size: Size },
    #[error("failed to import buffer: {0}")]
    Import(String),
    #[error("failed to export plane {plane}: {errno}")]
    Export { plane: usize, errno: Errno },
    #[error("no buffer allocator for {0}")]
    NoAllocator(PathBuf),
    #[error("unsupported buffer format {0:?}")]
    UnsupportedFormat(Fourcc),
    #[error("failed to register framebuffer: {0}")]
    Framebuffer(#[from] DrmError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BufferError>;

/// Buffer pixel formats, named by their in-memory byte order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BufferFormat {
    Bgra8888,
    Bgrx8888,
    Rgba8888,
    Rgbx8888,
    Bgr565,
    Bgra1010102,
    Rgba1010102,
    Yvu420,
    Yuv420Biplanar,
}

impl BufferFormat {
    pub fn num_planes(&self) -> usize {
        match self {
            BufferFormat::Yvu420 => 3,
            BufferFormat::Yuv420Biplanar => 2,
            _ => 1,
        }
    }
}

/// How a buffer is going to be used. Decides the allocation flags and whether the buffer gets a
/// kernel framebuffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    GpuRead,
    Scanout,
    ScanoutCpuReadWrite,
    ScanoutVdaWrite,
    GpuReadCpuReadWrite,
}

pub const GBM_BO_USE_SCANOUT: u32 = 1 << 0;
pub const GBM_BO_USE_CURSOR: u32 = 1 << 1;
pub const GBM_BO_USE_RENDERING: u32 = 1 << 2;
pub const GBM_BO_USE_LINEAR: u32 = 1 << 4;
// minigbm use flags that gbm_sys does not know about.
pub const GBM_BO_USE_TEXTURING: u32 = 1 << 5;
pub const GBM_BO_USE_HW_VIDEO_DECODER: u32 = 1 << 13;

impl BufferUsage {
    pub fn is_scanout(&self) -> bool {
        matches!(
            self,
            BufferUsage::Scanout | BufferUsage::ScanoutCpuReadWrite | BufferUsage::ScanoutVdaWrite
        )
    }

    pub fn gbm_flags(&self) -> u32 {
        match self {
            BufferUsage::GpuRead => GBM_BO_USE_TEXTURING,
            BufferUsage::Scanout => {
                GBM_BO_USE_SCANOUT | GBM_BO_USE_RENDERING | GBM_BO_USE_TEXTURING
            }
            BufferUsage::ScanoutCpuReadWrite => {
                GBM_BO_USE_SCANOUT | GBM_BO_USE_LINEAR | GBM_BO_USE_TEXTURING
            }
            BufferUsage::ScanoutVdaWrite => {
                GBM_BO_USE_SCANOUT | GBM_BO_USE_TEXTURING | GBM_BO_USE_HW_VIDEO_DECODER
            }
            BufferUsage::GpuReadCpuReadWrite => GBM_BO_USE_LINEAR | GBM_BO_USE_TEXTURING,
        }
    }
}

impl From<BufferFormat> for Fourcc {
    fn from(format: BufferFormat) -> Self {
        let fourcc = match format {
            BufferFormat::Bgra8888 => DrmFourcc::Argb8888,
            BufferFormat::Bgrx8888 => DrmFourcc::Xrgb8888,
            BufferFormat::Rgba8888 => DrmFourcc::Abgr8888,
            BufferFormat::Rgbx8888 => DrmFourcc::Xbgr8888,
            BufferFormat::Bgr565 => DrmFourcc::Rgb565,
            BufferFormat::Bgra1010102 => DrmFourcc::Argb2101010,
            BufferFormat::Rgba1010102 => DrmFourcc::Abgr2101010,
            BufferFormat::Yvu420 => DrmFourcc::Yvu420,
            BufferFormat::Yuv420Biplanar => DrmFourcc::Nv12,
        };
        Fourcc::from(fourcc as u32)
    }
}

impl TryFrom<Fourcc> for BufferFormat {
    type Error = BufferError;

    fn try_from(fourcc: Fourcc) -> Result<Self> {
        let format = DrmFourcc::try_from(u32::from(fourcc))
            .map_err(|_| BufferError::UnsupportedFormat(fourcc))?;
        Ok(match format {
            DrmFourcc::Argb8888 => BufferFormat::Bgra8888,
            DrmFourcc::Xrgb8888 => BufferFormat::Bgrx8888,
            DrmFourcc::Abgr8888 => BufferFormat::Rgba8888,
            DrmFourcc::Xbgr8888 => BufferFormat::Rgbx8888,
            DrmFourcc::Rgb565 => BufferFormat::Bgr565,
            DrmFourcc::Argb2101010 => BufferFormat::Bgra1010102,
            DrmFourcc::Abgr2101010 => BufferFormat::Rgba1010102,
            DrmFourcc::Yvu420 => BufferFormat::Yvu420,
            DrmFourcc::Nv12 => BufferFormat::Yuv420Biplanar,
            _ => return Err(BufferError::UnsupportedFormat(fourcc)),
        })
    }
}

/// Format to register a buffer with in the kernel framebuffer table.
///
/// Scanout ignores alpha, and a number of drivers reject framebuffers with an alpha channel, so
/// alpha formats are registered as their opaque counterpart.
pub fn framebuffer_format(fourcc: Fourcc) -> Fourcc {
    let opaque = match DrmFourcc::try_from(u32::from(fourcc)) {
        Ok(DrmFourcc::Argb8888) => DrmFourcc::Xrgb8888,
        Ok(DrmFourcc::Abgr8888) => DrmFourcc::Xbgr8888,
        Ok(DrmFourcc::Rgba8888) => DrmFourcc::Rgbx8888,
        Ok(DrmFourcc::Bgra8888) => DrmFourcc::Bgrx8888,
        Ok(DrmFourcc::Argb2101010) => DrmFourcc::Xrgb2101010,
        Ok(DrmFourcc::Abgr2101010) => DrmFourcc::Xbgr2101010,
        _ => return fourcc,
    };
    Fourcc::from(opaque as u32)
}

/// Layout of one plane of a shared buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NativePixmapPlane {
    pub stride: u32,
    pub offset: u32,
    pub size: u64,
    pub modifier: u64,
}

/// Everything needed to share a buffer with another process or device: DMA-BUF fds and the
/// layout of each plane.
///
/// Whoever holds the handle owns one reference to each fd.
#[derive(Debug, Default)]
pub struct NativePixmapHandle {
    pub fds: Vec<OwnedFd>,
    pub planes: Vec<NativePixmapPlane>,
}

impl NativePixmapHandle {
    /// Duplicates the fds so that the copy can be handed out independently.
    pub fn try_clone(&self) -> std::io::Result<Self> {
        let fds = self.fds.iter().map(|fd| fd.try_clone()).collect::<std::io::Result<_>>()?;
        Ok(Self { fds, planes: self.planes.clone() })
    }
}

/// A GPU buffer object.
pub trait BufferObject: Send + Sync {
    fn size(&self) -> Size;
    fn format(&self) -> Fourcc;
    /// Format modifier shared by all planes, `DRM_FORMAT_MOD_INVALID` if the allocator does not
    /// track it.
    fn modifier(&self) -> u64;
    fn num_planes(&self) -> usize;
    /// GEM handle of `plane` on the allocating device.
    fn handle(&self, plane: usize) -> u32;
    fn stride(&self, plane: usize) -> u32;
    fn offset(&self, plane: usize) -> u32;
    /// Returns a new DMA-BUF fd for `plane`.
    fn export_fd(&self, plane: usize) -> Result<OwnedFd>;
}

/// Allocates and imports [`BufferObject`]s on one device.
pub trait BufferAllocator: Send + Sync {
    /// Allocates a buffer. A non-empty `modifiers` list restricts the layouts the allocator may
    /// pick from.
    fn create(
        &self,
        format: Fourcc,
        size: Size,
        flags: u32,
        modifiers: &[u64],
    ) -> Result<Box<dyn BufferObject>>;

    /// Imports a buffer shared through `handle`.
    fn import(
        &self,
        format: Fourcc,
        size: Size,
        handle: &NativePixmapHandle,
        flags: u32,
    ) -> Result<Box<dyn BufferObject>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_translation() {
        for format in [
            BufferFormat::Bgra8888,
            BufferFormat::Bgrx8888,
            BufferFormat::Rgba8888,
            BufferFormat::Rgbx8888,
            BufferFormat::Bgr565,
            BufferFormat::Yvu420,
            BufferFormat::Yuv420Biplanar,
        ] {
            assert_eq!(BufferFormat::try_from(Fourcc::from(format)).unwrap(), format);
        }
        assert_eq!(Fourcc::from(BufferFormat::Bgra8888), Fourcc::from(b"AR24"));
        assert!(BufferFormat::try_from(Fourcc::from(b"ZZZZ")).is_err());
    }

    #[test]
    fn alpha_is_stripped_for_framebuffers() {
        assert_eq!(framebuffer_format(Fourcc::from(b"AR24")), Fourcc::from(b"XR24"));
        assert_eq!(framebuffer_format(Fourcc::from(b"AB24")), Fourcc::from(b"XB24"));
        assert_eq!(framebuffer_format(Fourcc::from(b"AR30")), Fourcc::from(b"XR30"));
        assert_eq!(framebuffer_format(Fourcc::from(b"XR24")), Fourcc::from(b"XR24"));
        assert_eq!(framebuffer_format(Fourcc::from(b"NV12")), Fourcc::from(b"NV12"));
    }

    #[test]
    fn scanout_usages() {
        assert!(BufferUsage::Scanout.is_scanout());
        assert!(BufferUsage::ScanoutVdaWrite.is_scanout());
        assert!(!BufferUsage::GpuRead.is_scanout());
        assert_eq!(BufferUsage::GpuReadCpuReadWrite.gbm_flags() & GBM_BO_USE_SCANOUT, 0);
        assert_ne!(BufferUsage::ScanoutCpuReadWrite.gbm_flags() & GBM_BO_USE_LINEAR, 0);
    }
}
