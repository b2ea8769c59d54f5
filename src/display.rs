// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Value types describing displays, passed between the DRM thread and its clients.

use std::path::PathBuf;

use crate::drm::Connector;
use crate::drm::ModeInfo;
use crate::Point;
use crate::Size;

pub use crate::drm::color::GammaRampRgbEntry;

const DRM_MODE_FLAG_INTERLACE: u32 = 1 << 4;

const DRM_MODE_CONNECTOR_VGA: u32 = 1;
const DRM_MODE_CONNECTOR_DVII: u32 = 2;
const DRM_MODE_CONNECTOR_DVID: u32 = 3;
const DRM_MODE_CONNECTOR_DVIA: u32 = 4;
const DRM_MODE_CONNECTOR_LVDS: u32 = 7;
const DRM_MODE_CONNECTOR_DISPLAYPORT: u32 = 10;
const DRM_MODE_CONNECTOR_HDMIA: u32 = 11;
const DRM_MODE_CONNECTOR_HDMIB: u32 = 12;
const DRM_MODE_CONNECTOR_EDP: u32 = 14;
const DRM_MODE_CONNECTOR_VIRTUAL: u32 = 15;
const DRM_MODE_CONNECTOR_DSI: u32 = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DisplayConnectionType {
    Unknown,
    Internal,
    Vga,
    Hdmi,
    Dvi,
    DisplayPort,
    Virtual,
}

impl DisplayConnectionType {
    pub fn from_connector_type(connector_type: u32) -> Self {
        match connector_type {
            DRM_MODE_CONNECTOR_VGA => Self::Vga,
            DRM_MODE_CONNECTOR_DVII | DRM_MODE_CONNECTOR_DVID | DRM_MODE_CONNECTOR_DVIA => {
                Self::Dvi
            }
            DRM_MODE_CONNECTOR_LVDS | DRM_MODE_CONNECTOR_EDP | DRM_MODE_CONNECTOR_DSI => {
                Self::Internal
            }
            DRM_MODE_CONNECTOR_DISPLAYPORT => Self::DisplayPort,
            DRM_MODE_CONNECTOR_HDMIA | DRM_MODE_CONNECTOR_HDMIB => Self::Hdmi,
            DRM_MODE_CONNECTOR_VIRTUAL => Self::Virtual,
            _ => Self::Unknown,
        }
    }

    pub fn is_internal(&self) -> bool {
        *self == Self::Internal
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DisplayMode {
    pub size: Size,
    pub is_interlaced: bool,
    pub refresh_rate: f32,
}

impl From<&ModeInfo> for DisplayMode {
    fn from(mode: &ModeInfo) -> Self {
        Self {
            size: mode.size(),
            is_interlaced: mode.flags & DRM_MODE_FLAG_INTERLACE != 0,
            refresh_rate: mode.refresh_rate(),
        }
    }
}

impl DisplayMode {
    /// Whether `mode` is the timing this display mode was built from. Refresh rates are compared
    /// loosely since they are derived from integer timings.
    pub fn matches(&self, mode: &ModeInfo) -> bool {
        let other = DisplayMode::from(mode);
        self.size == other.size
            && self.is_interlaced == other.is_interlaced
            && (self.refresh_rate - other.refresh_rate).abs() < 0.01
    }
}

/// Content protection state, as exposed by the connector's "Content Protection" property.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HdcpState {
    Undesired,
    Desired,
    Enabled,
}

impl HdcpState {
    pub fn property_name(&self) -> &'static str {
        match self {
            HdcpState::Undesired => "Undesired",
            HdcpState::Desired => "Desired",
            HdcpState::Enabled => "Enabled",
        }
    }

    pub fn from_property_name(name: &str) -> Option<Self> {
        match name {
            "Undesired" => Some(HdcpState::Undesired),
            "Desired" => Some(HdcpState::Desired),
            "Enabled" => Some(HdcpState::Enabled),
            _ => None,
        }
    }
}

/// Full color correction request for one display.
///
/// Empty tables and an empty matrix reset the corresponding stage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ColorCorrection {
    pub degamma_lut: Vec<GammaRampRgbEntry>,
    pub gamma_lut: Vec<GammaRampRgbEntry>,
    /// Row major 3x3 matrix.
    pub correction_matrix: Vec<f32>,
}

/// Immutable description of a connected display.
#[derive(Clone, Debug, PartialEq)]
pub struct DisplaySnapshot {
    pub display_id: i64,
    pub origin: Point,
    /// Physical size in millimeters.
    pub physical_size: Size,
    pub connection_type: DisplayConnectionType,
    pub has_color_correction_matrix: bool,
    pub display_name: String,
    pub sys_path: PathBuf,
    pub modes: Vec<DisplayMode>,
    pub current_mode: Option<DisplayMode>,
    pub native_mode: Option<DisplayMode>,
}

impl DisplaySnapshot {
    /// Builds a snapshot of `connector`, currently showing `current_mode` at `origin`.
    ///
    /// The native mode is the first mode the kernel marks as preferred, or the first mode if none
    /// is.
    pub fn new(
        display_id: i64,
        sys_path: PathBuf,
        connector: &Connector,
        origin: Point,
        current_mode: Option<&ModeInfo>,
        has_color_correction_matrix: bool,
    ) -> Self {
        let connection_type = DisplayConnectionType::from_connector_type(connector.connector_type);
        let native_mode = connector
            .modes
            .iter()
            .find(|m| m.is_preferred())
            .or_else(|| connector.modes.first())
            .map(DisplayMode::from);
        Self {
            display_id,
            origin,
            physical_size: Size::new(connector.mm_width, connector.mm_height),
            connection_type,
            has_color_correction_matrix,
            display_name: format!("{connection_type:?}-{}", connector.connector_type_id),
            sys_path,
            modes: connector.modes.iter().map(DisplayMode::from).collect(),
            current_mode: current_mode.map(DisplayMode::from),
            native_mode,
        }
    }
}

/// Identifies the connector with kernel id `connector_id` on device `device_index`.
pub fn generate_display_id(device_index: usize, connector_id: u32) -> i64 {
    ((device_index as i64) << 32) | connector_id as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::fake::mode;
    use crate::drm::Connection;

    fn hdmi_connector() -> Connector {
        let mut secondary = mode(1280, 720, 60);
        secondary.type_ = 0;
        Connector {
            id: 10,
            connector_type: DRM_MODE_CONNECTOR_HDMIA,
            connector_type_id: 1,
            connection: Connection::Connected,
            mm_width: 530,
            mm_height: 300,
            encoder_id: 0,
            encoders: vec![9],
            modes: vec![secondary, mode(1920, 1080, 60)],
        }
    }

    #[test]
    fn snapshot_from_connector() {
        let connector = hdmi_connector();
        let snapshot = DisplaySnapshot::new(
            generate_display_id(1, 2),
            PathBuf::from("/dev/dri/card1"),
            &connector,
            Point::new(1920, 0),
            Some(&connector.modes[0]),
            false,
        );
        assert_eq!(snapshot.display_id, 0x102);
        assert_eq!(snapshot.connection_type, DisplayConnectionType::Hdmi);
        assert_eq!(snapshot.display_name, "Hdmi-1");
        assert_eq!(snapshot.modes.len(), 2);
        assert_eq!(snapshot.native_mode.as_ref().unwrap().size, Size::new(1920, 1080));
        assert_eq!(snapshot.current_mode.as_ref().unwrap().size, Size::new(1280, 720));
        assert_eq!(snapshot.physical_size, Size::new(530, 300));
    }

    #[test]
    fn mode_refresh_and_matching() {
        let info = mode(1920, 1080, 60);
        let display_mode = DisplayMode::from(&info);
        assert!((display_mode.refresh_rate - 60.0).abs() < 0.1);
        assert!(!display_mode.is_interlaced);
        assert!(display_mode.matches(&info));
        assert!(!display_mode.matches(&mode(1280, 720, 60)));
    }

    #[test]
    fn connection_types() {
        assert!(DisplayConnectionType::from_connector_type(DRM_MODE_CONNECTOR_EDP).is_internal());
        assert_eq!(DisplayConnectionType::from_connector_type(99), DisplayConnectionType::Unknown);
        assert_eq!(HdcpState::from_property_name("Desired"), Some(HdcpState::Desired));
        assert_eq!(HdcpState::Enabled.property_name(), "Enabled");
    }
}
