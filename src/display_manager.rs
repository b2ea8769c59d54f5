// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Discovery and configuration of the displays connected to the DRM devices.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::device_manager::DrmDeviceManager;
use crate::display::generate_display_id;
use crate::display::ColorCorrection;
use crate::display::DisplayMode;
use crate::display::DisplaySnapshot;
use crate::display::HdcpState;
use crate::drm::Connection;
use crate::drm::Connector;
use crate::drm::DrmDevice;
use crate::drm::DrmError;
use crate::drm::ObjectType;
use crate::drm::Resources;
use crate::screen::ScreenManager;
use crate::Point;

const CONTENT_PROTECTION: &str = "Content Protection";

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("no display with id {0}")]
    UnknownDisplay(i64),
    #[error("display {0} does not support mode {1:?}")]
    UnsupportedMode(i64, DisplayMode),
    #[error("connector {0} has no usable {1} property")]
    MissingProperty(u32, &'static str),
    #[error(transparent)]
    Drm(#[from] DrmError),
}

pub type Result<T> = std::result::Result<T, DisplayError>;

/// A connector with the CRTC assigned to drive it.
#[derive(Debug)]
struct DrmDisplay {
    display_id: i64,
    drm: Arc<DrmDevice>,
    crtc_id: u32,
    connector: Connector,
    origin: Point,
}

/// Pairs each connected connector with a free CRTC, preferring the one it is currently routed
/// through.
fn assign_crtcs(drm: &DrmDevice, resources: &Resources) -> Vec<(u32, Connector)> {
    let mut used_crtcs = vec![];
    let mut assigned = vec![];
    for &connector_id in &resources.connectors {
        let Some(connector) = drm.get_connector(connector_id) else {
            continue;
        };
        if connector.connection != Connection::Connected || connector.modes.is_empty() {
            continue;
        }

        let current = drm
            .get_encoder(connector.encoder_id)
            .map(|e| e.crtc_id)
            .filter(|crtc| *crtc != 0 && !used_crtcs.contains(crtc));
        let crtc_id = current.or_else(|| {
            connector
                .encoders
                .iter()
                .filter_map(|id| drm.get_encoder(*id))
                .flat_map(|encoder| {
                    resources
                        .crtcs
                        .iter()
                        .enumerate()
                        .filter(move |(i, _)| encoder.possible_crtcs & (1 << i) != 0)
                        .map(|(_, crtc)| *crtc)
                })
                .find(|crtc| !used_crtcs.contains(crtc))
        });

        match crtc_id {
            Some(crtc_id) => {
                used_crtcs.push(crtc_id);
                assigned.push((crtc_id, connector));
            }
            None => log::warn!("No free CRTC for connector {connector_id}"),
        }
    }
    assigned
}

/// Display side of the DRM thread: keeps the list of connected displays and applies display
/// configuration requests to them.
#[derive(Debug, Default)]
pub struct DrmGpuDisplayManager {
    displays: Vec<DrmDisplay>,
    /// Every device path seen so far. A path keeps its index after the device goes away.
    device_paths: Vec<PathBuf>,
}

impl DrmGpuDisplayManager {
    pub fn new() -> Self {
        Default::default()
    }

    fn device_index(&mut self, path: &Path) -> usize {
        match self.device_paths.iter().position(|p| p == path) {
            Some(index) => index,
            None => {
                self.device_paths.push(path.to_path_buf());
                self.device_paths.len() - 1
            }
        }
    }

    fn find_display(&self, display_id: i64) -> Result<&DrmDisplay> {
        self.displays
            .iter()
            .find(|d| d.display_id == display_id)
            .ok_or(DisplayError::UnknownDisplay(display_id))
    }

    /// Probes every device for connected displays and updates the display controllers of
    /// `screen_manager` to match.
    pub fn refresh_native_displays(
        &mut self,
        devices: &DrmDeviceManager,
        screen_manager: &mut ScreenManager,
    ) -> Vec<DisplaySnapshot> {
        let mut displays = vec![];
        for drm in devices.devices() {
            let device_index = self.device_index(drm.path());
            let resources = match drm.get_resources() {
                Ok(resources) => resources,
                Err(e) => {
                    log::error!("Failed to refresh displays of {}: {e}", drm.path().display());
                    continue;
                }
            };
            for (crtc_id, connector) in assign_crtcs(drm, &resources) {
                let display_id = generate_display_id(device_index, connector.id);
                let origin = self
                    .displays
                    .iter()
                    .find(|d| d.display_id == display_id)
                    .map_or_else(Point::default, |d| d.origin);
                displays.push(DrmDisplay {
                    display_id,
                    drm: drm.clone(),
                    crtc_id,
                    connector,
                    origin,
                });
            }
        }

        for old in &self.displays {
            let still_present = displays.iter().any(|d| {
                Arc::ptr_eq(&d.drm, &old.drm)
                    && d.crtc_id == old.crtc_id
                    && d.connector.id == old.connector.id
            });
            if !still_present {
                log::info!("Display {} went away", old.display_id);
                screen_manager.remove_display_controller(&old.drm, old.crtc_id);
            }
        }
        for display in &displays {
            screen_manager.add_display_controller(
                &display.drm,
                display.crtc_id,
                display.connector.id,
            );
        }
        self.displays = displays;

        self.displays
            .iter()
            .map(|display| {
                let crtc = display.drm.get_crtc(display.crtc_id);
                let has_ctm = display
                    .drm
                    .find_property(display.crtc_id, ObjectType::Crtc, "CTM")
                    .is_some();
                DisplaySnapshot::new(
                    display.display_id,
                    display.drm.path().to_path_buf(),
                    &display.connector,
                    display.origin,
                    crtc.as_ref().and_then(|c| c.mode.as_ref()),
                    has_ctm,
                )
            })
            .collect()
    }

    /// Shows `mode` on display `display_id`, placed at `origin` of the desktop.
    pub fn configure_display(
        &mut self,
        display_id: i64,
        mode: &DisplayMode,
        origin: Point,
        screen_manager: &mut ScreenManager,
    ) -> Result<()> {
        let display = self
            .displays
            .iter_mut()
            .find(|d| d.display_id == display_id)
            .ok_or(DisplayError::UnknownDisplay(display_id))?;
        let mode_info = display
            .connector
            .modes
            .iter()
            .find(|m| mode.matches(m))
            .ok_or_else(|| DisplayError::UnsupportedMode(display_id, mode.clone()))?;

        screen_manager.configure_display_controller(
            &display.drm,
            display.crtc_id,
            origin,
            mode_info,
        )?;
        display.origin = origin;
        Ok(())
    }

    pub fn disable_display(
        &mut self,
        display_id: i64,
        screen_manager: &mut ScreenManager,
    ) -> Result<()> {
        let display = self.find_display(display_id)?;
        Ok(screen_manager.disable_display_controller(&display.drm, display.crtc_id)?)
    }

    /// Becomes DRM master on every device. Keeps going after a failure so that as many devices as
    /// possible are usable.
    pub fn take_display_control(&self, devices: &DrmDeviceManager) -> bool {
        let mut status = true;
        for drm in devices.devices() {
            if let Err(e) = drm.set_master() {
                log::error!("Failed to take control of {}: {e}", drm.path().display());
                status = false;
            }
        }
        status
    }

    pub fn relinquish_display_control(&self, devices: &DrmDeviceManager) -> bool {
        let mut status = true;
        for drm in devices.devices() {
            if let Err(e) = drm.drop_master() {
                log::error!("Failed to relinquish control of {}: {e}", drm.path().display());
                status = false;
            }
        }
        status
    }

    pub fn get_hdcp_state(&self, display_id: i64) -> Result<HdcpState> {
        let display = self.find_display(display_id)?;
        let connector_id = display.connector.id;
        let (property, value) = display
            .drm
            .find_property(connector_id, ObjectType::Connector, CONTENT_PROTECTION)
            .ok_or(DisplayError::MissingProperty(connector_id, CONTENT_PROTECTION))?;
        property
            .enum_name(value)
            .and_then(HdcpState::from_property_name)
            .ok_or(DisplayError::MissingProperty(connector_id, CONTENT_PROTECTION))
    }

    pub fn set_hdcp_state(&self, display_id: i64, state: HdcpState) -> Result<()> {
        let display = self.find_display(display_id)?;
        let connector_id = display.connector.id;
        let (property, _) = display
            .drm
            .find_property(connector_id, ObjectType::Connector, CONTENT_PROTECTION)
            .ok_or(DisplayError::MissingProperty(connector_id, CONTENT_PROTECTION))?;
        let value = property
            .enum_value(state.property_name())
            .ok_or(DisplayError::MissingProperty(connector_id, CONTENT_PROTECTION))?;
        log::debug!("Setting HDCP state of display {display_id} to {state:?}");
        Ok(display.drm.set_property(connector_id, ObjectType::Connector, property.id, value)?)
    }

    pub fn set_color_correction(
        &self,
        display_id: i64,
        correction: &ColorCorrection,
    ) -> Result<()> {
        let display = self.find_display(display_id)?;
        display
            .drm
            .set_color_correction(
                display.crtc_id,
                &correction.degamma_lut,
                &correction.gamma_lut,
                &correction.correction_matrix,
            )
            .map_err(|e| {
                log::error!("Failed to set color correction on display {display_id}: {e}");
                e.into()
            })
    }
}
