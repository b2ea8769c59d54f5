// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory buffer allocator for tests.

use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use crate::drm::sys::DRM_FORMAT_MOD_INVALID;
use crate::gbm::BufferAllocator;
use crate::gbm::BufferError;
use crate::gbm::BufferFormat;
use crate::gbm::BufferObject;
use crate::gbm::NativePixmapHandle;
use crate::gbm::Result;
use crate::Fourcc;
use crate::Size;

#[derive(Debug)]
pub(crate) struct FakeBufferObject {
    size: Size,
    format: Fourcc,
    modifier: u64,
    handle: u32,
    strides: Vec<u32>,
    offsets: Vec<u32>,
    live: Arc<AtomicU32>,
}

impl BufferObject for FakeBufferObject {
    fn size(&self) -> Size {
        self.size
    }

    fn format(&self) -> Fourcc {
        self.format
    }

    fn modifier(&self) -> u64 {
        self.modifier
    }

    fn num_planes(&self) -> usize {
        self.strides.len()
    }

    fn handle(&self, _plane: usize) -> u32 {
        self.handle
    }

    fn stride(&self, plane: usize) -> u32 {
        self.strides[plane]
    }

    fn offset(&self, plane: usize) -> u32 {
        self.offsets[plane]
    }

    fn export_fd(&self, _plane: usize) -> Result<OwnedFd> {
        let file = File::open("/dev/null").map_err(|e| anyhow::anyhow!(e))?;
        Ok(OwnedFd::from(file))
    }
}

impl Drop for FakeBufferObject {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct Inner {
    fail: AtomicBool,
    next_handle: AtomicU32,
    live: Arc<AtomicU32>,
    requests: Mutex<Vec<(Fourcc, Size, u32, Vec<u64>)>>,
}

/// Lays buffers out linearly. The first requested modifier is reported back as the buffer's.
#[derive(Clone, Debug, Default)]
pub(crate) struct FakeAllocator {
    inner: Arc<Inner>,
}

impl FakeAllocator {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.inner.fail.store(fail, Ordering::SeqCst);
    }

    /// Buffer objects currently alive.
    pub fn live_buffers(&self) -> u32 {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// `(format, size, flags, modifiers)` of every allocation request.
    pub fn requests(&self) -> Vec<(Fourcc, Size, u32, Vec<u64>)> {
        self.inner.requests.lock().unwrap().clone()
    }

    fn new_object(&self, format: Fourcc, size: Size, modifier: u64) -> Box<dyn BufferObject> {
        let num_planes = BufferFormat::try_from(format).map_or(1, |f| f.num_planes());
        let (strides, offsets) = if num_planes == 1 {
            (vec![size.width * 4], vec![0])
        } else {
            let luma = size.width * size.height;
            let chroma_stride = if num_planes == 2 { size.width } else { size.width / 2 };
            let chroma = chroma_stride * size.height.div_ceil(2);
            let strides = std::iter::once(size.width)
                .chain(std::iter::repeat(chroma_stride).take(num_planes - 1))
                .collect();
            let offsets = (0..num_planes as u32)
                .map(|plane| if plane == 0 { 0 } else { luma + (plane - 1) * chroma })
                .collect();
            (strides, offsets)
        };
        self.inner.live.fetch_add(1, Ordering::SeqCst);
        Box::new(FakeBufferObject {
            size,
            format,
            modifier,
            handle: self.inner.next_handle.fetch_add(1, Ordering::SeqCst) + 1,
            strides,
            offsets,
            live: self.inner.live.clone(),
        })
    }
}

impl BufferAllocator for FakeAllocator {
    fn create(
        &self,
        format: Fourcc,
        size: Size,
        flags: u32,
        modifiers: &[u64],
    ) -> Result<Box<dyn BufferObject>> {
        self.inner.requests.lock().unwrap().push((format, size, flags, modifiers.to_vec()));
        if self.inner.fail.load(Ordering::SeqCst) || size.is_empty() {
            return Err(BufferError::Allocation { format, size });
        }
        let modifier = modifiers.first().copied().unwrap_or(DRM_FORMAT_MOD_INVALID);
        Ok(self.new_object(format, size, modifier))
    }

    fn import(
        &self,
        format: Fourcc,
        size: Size,
        handle: &NativePixmapHandle,
        _flags: u32,
    ) -> Result<Box<dyn BufferObject>> {
        if self.inner.fail.load(Ordering::SeqCst) {
            return Err(BufferError::Import("import rejected".into()));
        }
        let modifier = handle.planes.first().map_or(DRM_FORMAT_MOD_INVALID, |p| p.modifier);
        Ok(self.new_object(format, size, modifier))
    }
}
