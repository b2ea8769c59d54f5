// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use crate::drm::sys::DRM_FORMAT_MOD_INVALID;
use crate::drm::DrmDevice;
use crate::drm::FramebufferParams;
use crate::gbm::framebuffer_format;
use crate::gbm::BufferError;
use crate::gbm::BufferFormat;
use crate::gbm::BufferObject;
use crate::gbm::BufferUsage;
use crate::gbm::NativePixmapHandle;
use crate::gbm::NativePixmapPlane;
use crate::gbm::Result;
use crate::gbm::GBM_BO_USE_SCANOUT;
use crate::Fourcc;
use crate::Size;

/// A buffer object allocated on, or imported into, a DRM device.
///
/// Scanout buffers are registered as a kernel framebuffer for their whole lifetime; the
/// framebuffer is removed when the last reference goes away.
pub struct GbmBuffer {
    drm: Arc<DrmDevice>,
    bo: Box<dyn BufferObject>,
    flags: u32,
    fds: Vec<OwnedFd>,
    planes: Vec<NativePixmapPlane>,
    framebuffer_id: u32,
    framebuffer_format: Fourcc,
}

impl std::fmt::Debug for GbmBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GbmBuffer")
            .field("format", &self.bo.format())
            .field("size", &self.bo.size())
            .field("flags", &self.flags)
            .field("planes", &self.planes)
            .field("framebuffer_id", &self.framebuffer_id)
            .finish_non_exhaustive()
    }
}

/// Size in bytes of `plane`: up to the next plane when planes are packed in order, a full plane of
/// rows otherwise.
fn plane_size(bo: &dyn BufferObject, plane: usize) -> u64 {
    let size = bo.size();
    let num_planes = bo.num_planes();
    if plane + 1 < num_planes && bo.offset(plane + 1) > bo.offset(plane) {
        return (bo.offset(plane + 1) - bo.offset(plane)) as u64;
    }
    let rows = if plane == 0 { size.height } else { size.height.div_ceil(2) };
    bo.stride(plane) as u64 * rows as u64
}

impl GbmBuffer {
    fn new(
        drm: Arc<DrmDevice>,
        bo: Box<dyn BufferObject>,
        flags: u32,
        fds: Option<Vec<OwnedFd>>,
        use_modifiers: bool,
    ) -> Result<Self> {
        let num_planes = bo.num_planes();
        let modifier = bo.modifier();
        let planes = (0..num_planes)
            .map(|plane| NativePixmapPlane {
                stride: bo.stride(plane),
                offset: bo.offset(plane),
                size: plane_size(bo.as_ref(), plane),
                modifier,
            })
            .collect::<Vec<_>>();
        let fds = match fds {
            Some(fds) => fds,
            None => (0..num_planes).map(|plane| bo.export_fd(plane)).collect::<Result<_>>()?,
        };

        let framebuffer_format = framebuffer_format(bo.format());
        let mut framebuffer_id = 0;
        if flags & GBM_BO_USE_SCANOUT != 0 {
            let size = bo.size();
            let mut params = FramebufferParams {
                width: size.width,
                height: size.height,
                format: framebuffer_format.into(),
                use_modifiers,
                ..Default::default()
            };
            for (i, plane) in planes.iter().enumerate().take(4) {
                params.handles[i] = bo.handle(i);
                params.pitches[i] = plane.stride;
                params.offsets[i] = plane.offset;
                params.modifiers[i] = plane.modifier;
            }
            framebuffer_id = drm.add_framebuffer2(&params).map_err(|e| {
                log::error!(
                    "Failed to register {size} {framebuffer_format} buffer as framebuffer: {e}"
                );
                e
            })?;
        }

        Ok(Self { drm, bo, flags, fds, planes, framebuffer_id, framebuffer_format })
    }

    fn allocate(
        drm: &Arc<DrmDevice>,
        format: Fourcc,
        size: Size,
        usage: BufferUsage,
        modifiers: &[u64],
    ) -> Result<Arc<Self>> {
        let allocator =
            drm.allocator().ok_or_else(|| BufferError::NoAllocator(drm.path().to_path_buf()))?;
        let flags = usage.gbm_flags();
        let bo = allocator.create(format, size, flags, modifiers)?;
        let use_modifiers = !modifiers.is_empty()
            && bo.modifier() != DRM_FORMAT_MOD_INVALID
            && drm.supports_modifiers();
        Ok(Arc::new(Self::new(drm.clone(), bo, flags, None, use_modifiers)?))
    }

    /// Allocates a buffer for `usage`. Scanout usages also register a framebuffer.
    pub fn create(
        drm: &Arc<DrmDevice>,
        format: Fourcc,
        size: Size,
        usage: BufferUsage,
    ) -> Result<Arc<Self>> {
        Self::allocate(drm, format, size, usage, &[])
    }

    /// Allocates a buffer whose layout is one of `modifiers`.
    ///
    /// The framebuffer is registered with explicit modifiers only when
    /// [`DrmDevice::supports_modifiers`] holds.
    pub fn create_with_modifiers(
        drm: &Arc<DrmDevice>,
        format: Fourcc,
        size: Size,
        usage: BufferUsage,
        modifiers: &[u64],
    ) -> Result<Arc<Self>> {
        Self::allocate(drm, format, size, usage, modifiers)
    }

    /// Imports a buffer shared by another process. Takes ownership of the fds in `handle`.
    pub fn create_from_handle(
        drm: &Arc<DrmDevice>,
        format: Fourcc,
        size: Size,
        handle: NativePixmapHandle,
        usage: BufferUsage,
    ) -> Result<Arc<Self>> {
        let format_planes = BufferFormat::try_from(format)?.num_planes();
        if handle.planes.len() != format_planes || handle.fds.is_empty() {
            return Err(BufferError::Import(format!(
                "{format} needs {format_planes} planes, got {} planes and {} fds",
                handle.planes.len(),
                handle.fds.len()
            )));
        }

        let allocator =
            drm.allocator().ok_or_else(|| BufferError::NoAllocator(drm.path().to_path_buf()))?;
        let flags = usage.gbm_flags();
        let bo = allocator.import(format, size, &handle, flags)?;
        let use_modifiers =
            handle.planes[0].modifier != DRM_FORMAT_MOD_INVALID && drm.supports_modifiers();
        Ok(Arc::new(Self::new(drm.clone(), bo, flags, Some(handle.fds), use_modifiers)?))
    }

    pub fn drm_device(&self) -> &Arc<DrmDevice> {
        &self.drm
    }

    pub fn size(&self) -> Size {
        self.bo.size()
    }

    pub fn format(&self) -> Fourcc {
        self.bo.format()
    }

    /// Format the framebuffer was registered with. Alpha formats are registered opaque.
    pub fn framebuffer_format(&self) -> Fourcc {
        self.framebuffer_format
    }

    /// Kernel framebuffer id, 0 for buffers that are not scanout capable.
    pub fn framebuffer_id(&self) -> u32 {
        self.framebuffer_id
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn modifier(&self) -> u64 {
        self.bo.modifier()
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    pub fn planes(&self) -> &[NativePixmapPlane] {
        &self.planes
    }

    pub fn handle(&self, plane: usize) -> u32 {
        self.bo.handle(plane)
    }

    pub fn stride(&self, plane: usize) -> u32 {
        self.planes[plane].stride
    }

    pub fn offset(&self, plane: usize) -> u32 {
        self.planes[plane].offset
    }

    /// DMA-BUF fd backing `plane`. Imported single-fd buffers share one fd between planes.
    pub fn fd(&self, plane: usize) -> Option<BorrowedFd<'_>> {
        self.fds.get(plane).or_else(|| self.fds.last()).map(|fd| fd.as_fd())
    }

    pub fn fd_count(&self) -> usize {
        self.fds.len()
    }

    /// Buffers on a secondary device are rendered by a different GPU and need an explicit finish
    /// before scanout.
    pub fn requires_gl_finish(&self) -> bool {
        !self.drm.is_primary_device()
    }
}

impl Drop for GbmBuffer {
    fn drop(&mut self) {
        if self.framebuffer_id != 0 {
            if let Err(e) = self.drm.remove_framebuffer(self.framebuffer_id) {
                log::error!("Failed to remove framebuffer {}: {e}", self.framebuffer_id);
            }
        }
    }
}
