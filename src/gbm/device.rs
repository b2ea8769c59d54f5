// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! libgbm backed [`BufferAllocator`].

use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use gbm_sys::gbm_bo;
use gbm_sys::gbm_bo_create;
use gbm_sys::gbm_bo_create_with_modifiers;
use gbm_sys::gbm_bo_destroy;
use gbm_sys::gbm_bo_get_fd;
use gbm_sys::gbm_bo_get_format;
use gbm_sys::gbm_bo_get_handle_for_plane;
use gbm_sys::gbm_bo_get_height;
use gbm_sys::gbm_bo_get_modifier;
use gbm_sys::gbm_bo_get_offset;
use gbm_sys::gbm_bo_get_plane_count;
use gbm_sys::gbm_bo_get_stride_for_plane;
use gbm_sys::gbm_bo_get_width;
use gbm_sys::gbm_bo_import;
use gbm_sys::gbm_create_device;
use gbm_sys::gbm_device;
use gbm_sys::gbm_device_destroy;
use gbm_sys::gbm_import_fd_modifier_data;
use nix::errno::Errno;
use nix::libc;

use crate::gbm::BufferAllocator;
use crate::gbm::BufferError;
use crate::gbm::BufferObject;
use crate::gbm::NativePixmapHandle;
use crate::gbm::Result;
use crate::Fourcc;
use crate::Size;

// The constant in gbm_sys is wrong.
const GBM_BO_IMPORT_FD_MODIFIER: u32 = 0x5505;

#[derive(Debug)]
pub struct GbmDevice {
    device: *mut gbm_device,
    // Keeps the device file descriptor valid as long as the GbmDevice is alive.
    _device_file: File,
}

impl GbmDevice {
    /// Creates a GBM device on an already opened DRM device file.
    pub fn new(device_file: File) -> Result<Arc<Self>> {
        // SAFETY: `device_file` is a valid fd that we keep open for the device's lifetime.
        let device = unsafe { gbm_create_device(device_file.as_raw_fd()) };
        if device.is_null() {
            return Err(anyhow::anyhow!("could not create GBM device from file").into());
        }
        Ok(Arc::new(Self { device, _device_file: device_file }))
    }
}

impl Drop for GbmDevice {
    fn drop(&mut self) {
        // SAFETY: `device` was returned by gbm_create_device and every bo holds a reference to us.
        unsafe { gbm_device_destroy(self.device) }
    }
}

// UNSAFE: the raw GBM device is only used from the DRM thread, and no other copies of the pointer
// are handed out.
unsafe impl Send for GbmDevice {}
unsafe impl Sync for GbmDevice {}

struct GbmBo {
    bo: *mut gbm_bo,
    _device: Arc<GbmDevice>,
}

impl GbmBo {
    fn new(bo: *mut gbm_bo, device: &Arc<GbmDevice>) -> Option<Self> {
        (!bo.is_null()).then(|| Self { bo, _device: device.clone() })
    }
}

impl BufferObject for GbmBo {
    fn size(&self) -> Size {
        // SAFETY: `bo` is valid for the lifetime of `self`.
        unsafe { Size::new(gbm_bo_get_width(self.bo), gbm_bo_get_height(self.bo)) }
    }

    fn format(&self) -> Fourcc {
        // SAFETY: `bo` is valid for the lifetime of `self`.
        Fourcc::from(unsafe { gbm_bo_get_format(self.bo) })
    }

    fn modifier(&self) -> u64 {
        // SAFETY: `bo` is valid for the lifetime of `self`.
        unsafe { gbm_bo_get_modifier(self.bo) }
    }

    fn num_planes(&self) -> usize {
        // SAFETY: `bo` is valid for the lifetime of `self`.
        unsafe { gbm_bo_get_plane_count(self.bo) }.max(1) as usize
    }

    fn handle(&self, plane: usize) -> u32 {
        // SAFETY: `bo` is valid and the union is always initialized as 32 bits by the driver.
        unsafe { gbm_bo_get_handle_for_plane(self.bo, plane as libc::c_int).u32_ }
    }

    fn stride(&self, plane: usize) -> u32 {
        // SAFETY: `bo` is valid for the lifetime of `self`.
        unsafe { gbm_bo_get_stride_for_plane(self.bo, plane as libc::c_int) }
    }

    fn offset(&self, plane: usize) -> u32 {
        // SAFETY: `bo` is valid for the lifetime of `self`.
        unsafe { gbm_bo_get_offset(self.bo, plane as libc::c_int) }
    }

    fn export_fd(&self, plane: usize) -> Result<OwnedFd> {
        // SAFETY: `bo` is valid for the lifetime of `self`.
        let fd = unsafe { gbm_bo_get_fd(self.bo) };
        if fd < 0 {
            return Err(BufferError::Export { plane, errno: Errno::last() });
        }
        // SAFETY: gbm_bo_get_fd() gives us a fresh, owned fd on every call.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

impl Drop for GbmBo {
    fn drop(&mut self) {
        // SAFETY: `bo` was created by us and is destroyed exactly once.
        unsafe { gbm_bo_destroy(self.bo) }
    }
}

// UNSAFE: the raw bo is exclusively owned and libgbm does not tie it to the creating thread.
unsafe impl Send for GbmBo {}
unsafe impl Sync for GbmBo {}

impl BufferAllocator for Arc<GbmDevice> {
    fn create(
        &self,
        format: Fourcc,
        size: Size,
        flags: u32,
        modifiers: &[u64],
    ) -> Result<Box<dyn BufferObject>> {
        let bo = if modifiers.is_empty() {
            // SAFETY: `device` is valid for the lifetime of `self`.
            unsafe {
                gbm_bo_create(self.device, size.width, size.height, format.into(), flags)
            }
        } else {
            // SAFETY: `modifiers` outlives the call and its length is passed along.
            unsafe {
                gbm_bo_create_with_modifiers(
                    self.device,
                    size.width,
                    size.height,
                    format.into(),
                    modifiers.as_ptr(),
                    modifiers.len() as libc::c_uint,
                )
            }
        };

        match GbmBo::new(bo, self) {
            Some(bo) => Ok(Box::new(bo)),
            None => {
                log::error!("gbm_bo_create failed for {format} {size} with flags {flags:#x}");
                Err(BufferError::Allocation { format, size })
            }
        }
    }

    fn import(
        &self,
        format: Fourcc,
        size: Size,
        handle: &NativePixmapHandle,
        flags: u32,
    ) -> Result<Box<dyn BufferObject>> {
        if handle.planes.len() > 4 || handle.fds.is_empty() {
            return Err(BufferError::Import(format!(
                "cannot import {} planes from {} fds",
                handle.planes.len(),
                handle.fds.len()
            )));
        }

        let mut import_data = gbm_import_fd_modifier_data {
            width: size.width,
            height: size.height,
            format: format.into(),
            num_fds: handle.fds.len().min(4) as u32,
            fds: [-1; 4],
            strides: [0; 4],
            offsets: [0; 4],
            modifier: handle.planes.first().map_or(0, |p| p.modifier),
        };
        for (i, fd) in handle.fds.iter().take(4).enumerate() {
            import_data.fds[i] = fd.as_raw_fd();
        }
        for (i, plane) in handle.planes.iter().enumerate() {
            import_data.strides[i] = plane.stride as libc::c_int;
            import_data.offsets[i] = plane.offset as libc::c_int;
        }

        // SAFETY: `import_data` and the fds it refers to outlive the call. libgbm dups the fds.
        let bo = unsafe {
            gbm_bo_import(
                self.device,
                GBM_BO_IMPORT_FD_MODIFIER,
                &mut import_data as *mut gbm_import_fd_modifier_data as *mut libc::c_void,
                flags,
            )
        };

        GbmBo::new(bo, self)
            .map(|bo| Box::new(bo) as Box<dyn BufferObject>)
            .ok_or_else(|| BufferError::Import(format!("gbm_bo_import failed for {format} {size}")))
    }
}
