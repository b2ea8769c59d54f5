// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Arc;

use nix::libc;
use nix::sys::mman::munmap;

use crate::drm::DrmDevice;
use crate::drm::DrmResult;
use crate::Size;

/// A CPU-mapped dumb buffer, used for cursor images.
///
/// The mapping and the kernel handle are released on drop.
pub struct DumbBuffer {
    drm: Arc<DrmDevice>,
    handle: u32,
    stride: u32,
    size: Size,
    addr: NonNull<libc::c_void>,
    len: NonZeroUsize,
}

// SAFETY: the mapping is exclusively owned and only reachable through `&mut self` for writes.
unsafe impl Send for DumbBuffer {}
unsafe impl Sync for DumbBuffer {}

impl DumbBuffer {
    /// Allocates and maps a 32 bits per pixel buffer of `size`.
    pub fn create(drm: &Arc<DrmDevice>, size: Size) -> DrmResult<Self> {
        let allocation = drm.create_dumb_buffer(size)?;
        let len = match NonZeroUsize::new(allocation.size as usize) {
            Some(len) => len,
            None => {
                let _ = drm.destroy_dumb_buffer(allocation.handle);
                return Err(anyhow::anyhow!("kernel returned an empty dumb buffer").into());
            }
        };
        let addr = match drm.map_dumb_buffer(allocation.handle, len.get()) {
            Ok(addr) => addr,
            Err(e) => {
                log::error!("Failed to map dumb buffer {}: {e}", allocation.handle);
                let _ = drm.destroy_dumb_buffer(allocation.handle);
                return Err(e);
            }
        };

        Ok(Self {
            drm: drm.clone(),
            handle: allocation.handle,
            stride: allocation.pitch,
            size,
            addr,
            len,
        })
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn drm_device(&self) -> &Arc<DrmDevice> {
        &self.drm
    }

    pub fn pixels(&self) -> &[u8] {
        // SAFETY: `addr` maps `len` bytes for as long as `self` lives.
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr() as *const u8, self.len.get()) }
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        // SAFETY: `addr` maps `len` bytes for as long as `self` lives and we hold `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.addr.as_ptr() as *mut u8, self.len.get()) }
    }

    /// Clears the buffer and copies a tightly packed ARGB8888 image into its top left corner.
    /// Rows and columns not fitting the buffer are cropped. An empty image leaves the buffer clear.
    pub fn write_argb(&mut self, image_size: Size, pixels: &[u32]) {
        let stride = self.stride as usize;
        let width = image_size.width.min(self.size.width) as usize;
        let height = image_size.height.min(self.size.height) as usize;
        let dst = self.pixels_mut();
        dst.fill(0);
        if image_size.is_empty() {
            return;
        }
        for (y, row) in pixels.chunks(image_size.width as usize).take(height).enumerate() {
            for (x, pixel) in row.iter().take(width).enumerate() {
                let offset = y * stride + x * 4;
                dst[offset..offset + 4].copy_from_slice(&pixel.to_ne_bytes());
            }
        }
    }
}

impl Drop for DumbBuffer {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by `map_dumb_buffer` with this length.
        if let Err(e) = unsafe { munmap(self.addr, self.len.get()) } {
            log::error!("Failed to unmap dumb buffer {}: {e}", self.handle);
        }
        if let Err(e) = self.drm.destroy_dumb_buffer(self.handle) {
            log::error!("Failed to destroy dumb buffer {}: {e}", self.handle);
        }
    }
}
