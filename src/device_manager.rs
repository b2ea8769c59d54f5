// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Tracks the DRM devices of the system and which window renders on which of them.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::drm::DrmDevice;
use crate::drm::DrmResult;
use crate::Widget;

/// Builds a [`DrmDevice`] for a newly discovered device node.
pub trait DrmDeviceGenerator: Send {
    /// Wraps `file`, the open device node at `path`. Returns `None` if the device cannot be used.
    fn create_device(&self, path: &Path, file: File, is_primary_device: bool) -> Option<DrmDevice>;
}

/// Creates devices talking to the kernel, with buffers allocated through libgbm.
#[cfg(feature = "gbm")]
#[derive(Debug, Default)]
pub struct GbmDeviceGenerator;

#[cfg(feature = "gbm")]
impl DrmDeviceGenerator for GbmDeviceGenerator {
    fn create_device(&self, path: &Path, file: File, is_primary_device: bool) -> Option<DrmDevice> {
        use crate::drm::backend::KernelBackend;
        use crate::gbm::device::GbmDevice;

        let backend_file = file
            .try_clone()
            .map_err(|e| log::error!("Failed to duplicate {} fd: {e}", path.display()))
            .ok()?;
        let gbm = GbmDevice::new(file)
            .map_err(|e| log::error!("Failed to create GBM device on {}: {e}", path.display()))
            .ok()?;
        Some(DrmDevice::new(
            path,
            Box::new(KernelBackend::new(backend_file)),
            Some(Box::new(gbm)),
            is_primary_device,
        ))
    }
}

pub struct DrmDeviceManager {
    generator: Box<dyn DrmDeviceGenerator>,
    use_atomic: bool,
    devices: Vec<Arc<DrmDevice>>,
    primary_device: Option<Arc<DrmDevice>>,
    widget_devices: HashMap<Widget, Arc<DrmDevice>>,
}

impl std::fmt::Debug for DrmDeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmDeviceManager")
            .field("devices", &self.devices)
            .field("use_atomic", &self.use_atomic)
            .finish_non_exhaustive()
    }
}

impl DrmDeviceManager {
    pub fn new(generator: Box<dyn DrmDeviceGenerator>, use_atomic: bool) -> Self {
        Self {
            generator,
            use_atomic,
            devices: vec![],
            primary_device: None,
            widget_devices: HashMap::new(),
        }
    }

    /// Opens the device at `path`. The first device added becomes the primary device.
    pub fn add_drm_device(&mut self, path: &Path, file: File) -> DrmResult<Arc<DrmDevice>> {
        if let Some(device) = self.get_drm_device(path) {
            log::warn!("{} was already added", path.display());
            return Ok(device.clone());
        }

        let is_primary_device = self.primary_device.is_none();
        let device = self
            .generator
            .create_device(path, file, is_primary_device)
            .ok_or_else(|| anyhow::anyhow!("could not create a device for {}", path.display()))?;
        device.initialize(self.use_atomic)?;

        let device = Arc::new(device);
        if is_primary_device {
            log::info!("Using {} as primary device", path.display());
            self.primary_device = Some(device.clone());
        }
        self.devices.push(device.clone());
        Ok(device)
    }

    /// Forgets the device at `path`. Page flips still waiting on it are dropped since their
    /// completion will never be reported.
    pub fn remove_drm_device(&mut self, path: &Path) -> Option<Arc<DrmDevice>> {
        let index = self.devices.iter().position(|d| d.path() == path)?;
        let device = self.devices.remove(index);
        device.abandon_page_flips();
        self.widget_devices.retain(|_, d| !Arc::ptr_eq(d, &device));
        if self.primary_device.as_ref().map_or(false, |p| Arc::ptr_eq(p, &device)) {
            log::warn!("Primary device {} removed", path.display());
            self.primary_device = None;
        }
        Some(device)
    }

    pub fn get_drm_device(&self, path: &Path) -> Option<&Arc<DrmDevice>> {
        self.devices.iter().find(|d| d.path() == path)
    }

    pub fn devices(&self) -> &[Arc<DrmDevice>] {
        &self.devices
    }

    pub fn primary_device(&self) -> Option<&Arc<DrmDevice>> {
        self.primary_device.as_ref()
    }

    /// Routes buffer allocations of `widget` to `device`, or back to the primary device when
    /// `None`.
    pub fn update_drm_device(&mut self, widget: Widget, device: Option<Arc<DrmDevice>>) {
        match device {
            Some(device) => {
                self.widget_devices.insert(widget, device);
            }
            None => {
                self.widget_devices.remove(&widget);
            }
        }
    }

    /// Device buffers of `widget` are allocated on.
    pub fn get_drm_device_for_widget(&self, widget: Widget) -> Option<&Arc<DrmDevice>> {
        self.widget_devices.get(&widget).or(self.primary_device.as_ref())
    }
}
