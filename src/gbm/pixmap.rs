// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::os::fd::BorrowedFd;
use std::sync::Arc;

use crate::drm::plane_manager::CropRect;
use crate::gbm::BufferError;
use crate::gbm::BufferFormat;
use crate::gbm::GbmBuffer;
use crate::gbm::NativePixmapHandle;
use crate::gbm::Result;
use crate::screen::OverlayPlane;
use crate::Rect;
use crate::Size;

/// Client side view of a [`GbmBuffer`]: what a compositor needs to share it and to put it on
/// screen.
#[derive(Clone, Debug)]
pub struct GbmPixmap {
    buffer: Arc<GbmBuffer>,
}

impl GbmPixmap {
    pub fn new(buffer: Arc<GbmBuffer>) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> &Arc<GbmBuffer> {
        &self.buffer
    }

    pub fn are_dma_buf_fds_valid(&self) -> bool {
        self.buffer.fd_count() > 0
    }

    pub fn dma_buf_fd(&self, plane: usize) -> Option<BorrowedFd<'_>> {
        self.buffer.fd(plane)
    }

    pub fn dma_buf_pitch(&self, plane: usize) -> u32 {
        self.buffer.stride(plane)
    }

    pub fn dma_buf_offset(&self, plane: usize) -> u32 {
        self.buffer.offset(plane)
    }

    pub fn dma_buf_modifier(&self) -> u64 {
        self.buffer.modifier()
    }

    pub fn buffer_format(&self) -> Option<BufferFormat> {
        BufferFormat::try_from(self.buffer.format()).ok()
    }

    pub fn buffer_size(&self) -> Size {
        self.buffer.size()
    }

    pub fn framebuffer_id(&self) -> u32 {
        self.buffer.framebuffer_id()
    }

    /// Duplicates the buffer's fds into a handle that can be sent to another process.
    pub fn export_handle(&self) -> Result<NativePixmapHandle> {
        let mut fds = Vec::with_capacity(self.buffer.num_planes());
        for plane in 0..self.buffer.num_planes() {
            let fd = self.buffer.fd(plane).ok_or(BufferError::Export {
                plane,
                errno: nix::errno::Errno::EBADF,
            })?;
            let fd = fd.try_clone_to_owned().map_err(|e| BufferError::Export {
                plane,
                errno: nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(nix::libc::EBADF)),
            })?;
            fds.push(fd);
        }
        Ok(NativePixmapHandle { fds, planes: self.buffer.planes().to_vec() })
    }

    /// Wraps this pixmap into a plane to be presented at `z_order`.
    ///
    /// Returns `None` if the buffer cannot be scanned out.
    pub fn overlay_plane(
        &self,
        z_order: i32,
        display_bounds: Rect,
        crop: CropRect,
    ) -> Option<OverlayPlane> {
        if self.buffer.framebuffer_id() == 0 {
            log::error!("Buffer {:?} has no framebuffer, cannot schedule it", self.buffer);
            return None;
        }
        Some(OverlayPlane::new(self.buffer.clone(), z_order, display_bounds, crop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::device::tests::new_device_with_allocator;
    use crate::drm::fake::FakeBackend;
    use crate::gbm::fake::FakeAllocator;
    use crate::gbm::BufferUsage;
    use crate::Fourcc;

    #[test]
    fn export_duplicates_fds() {
        let fake = FakeBackend::with_displays(1);
        let allocator = FakeAllocator::new();
        let drm = new_device_with_allocator(&fake, &allocator, true);
        let buffer = GbmBuffer::create(
            &drm,
            Fourcc::from(b"NV12"),
            Size::new(32, 32),
            BufferUsage::ScanoutVdaWrite,
        )
        .unwrap();
        let pixmap = GbmPixmap::new(buffer);
        assert!(pixmap.are_dma_buf_fds_valid());
        assert_eq!(pixmap.buffer_format(), Some(BufferFormat::Yuv420Biplanar));

        let handle = pixmap.export_handle().unwrap();
        assert_eq!(handle.fds.len(), 2);
        assert_eq!(handle.planes.len(), 2);
        assert_eq!(handle.planes[1].offset, pixmap.dma_buf_offset(1));

        drop(pixmap);
        // The exported handle keeps the fds alive on its own.
        assert!(handle.try_clone().is_ok());
    }

    #[test]
    fn only_scanout_buffers_become_planes() {
        let fake = FakeBackend::with_displays(1);
        let allocator = FakeAllocator::new();
        let drm = new_device_with_allocator(&fake, &allocator, true);
        let size = Size::new(32, 32);
        let bounds = Rect::new(0, 0, 32, 32);

        let texture =
            GbmBuffer::create(&drm, Fourcc::from(b"XR24"), size, BufferUsage::GpuRead).unwrap();
        let pixmap = GbmPixmap::new(texture);
        assert!(pixmap.overlay_plane(0, bounds, CropRect::from_size(size)).is_none());

        let scanout =
            GbmBuffer::create(&drm, Fourcc::from(b"XR24"), size, BufferUsage::Scanout).unwrap();
        let pixmap = GbmPixmap::new(scanout);
        let plane = pixmap.overlay_plane(1, bounds, CropRect::from_size(size)).unwrap();
        assert_eq!(plane.z_order, 1);
        assert_eq!(plane.buffer.framebuffer_id(), pixmap.framebuffer_id());
    }
}
