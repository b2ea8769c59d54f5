// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Color lookup tables and correction matrices in the layouts the kernel expects.

use crate::drm::sys;

/// One entry of a per-channel lookup table. Values span the full `u16` range.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct GammaRampRgbEntry {
    pub r: u16,
    pub g: u16,
    pub b: u16,
}

impl GammaRampRgbEntry {
    pub const fn new(r: u16, g: u16, b: u16) -> Self {
        Self { r, g, b }
    }

    pub const fn gray(v: u16) -> Self {
        Self { r: v, g: v, b: v }
    }
}

/// Returns an identity ramp of `size` entries going linearly from 0 to `u16::MAX`.
pub fn linear_ramp(size: usize) -> Vec<GammaRampRgbEntry> {
    match size {
        0 => vec![],
        1 => vec![GammaRampRgbEntry::gray(0)],
        _ => (0..size)
            .map(|i| GammaRampRgbEntry::gray((i * u16::MAX as usize / (size - 1)) as u16))
            .collect(),
    }
}

fn interpolate(a: u16, b: u16, numerator: usize, denominator: usize) -> u16 {
    let a = a as i64;
    let b = b as i64;
    (a + (b - a) * numerator as i64 / denominator as i64) as u16
}

/// Resamples `lut` to `desired_size` entries by linear interpolation.
///
/// The first and last entries are preserved and a monotonic input stays monotonic.
pub fn resample_lut(lut: &[GammaRampRgbEntry], desired_size: usize) -> Vec<GammaRampRgbEntry> {
    if lut.is_empty() || desired_size == 0 {
        return vec![];
    }
    if lut.len() == desired_size {
        return lut.to_vec();
    }
    if desired_size == 1 {
        return vec![lut[0]];
    }

    let span = desired_size - 1;
    (0..desired_size)
        .map(|i| {
            let base = (lut.len() - 1) * i / span;
            let remaining = (lut.len() - 1) * i % span;
            if remaining == 0 {
                return lut[base];
            }
            let (lo, hi) = (lut[base], lut[base + 1]);
            GammaRampRgbEntry {
                r: interpolate(lo.r, hi.r, remaining, span),
                g: interpolate(lo.g, hi.g, remaining, span),
                b: interpolate(lo.b, hi.b, remaining, span),
            }
        })
        .collect()
}

/// Splits a table into the three channel arrays used by the legacy gamma ioctl.
pub fn split_channels(lut: &[GammaRampRgbEntry]) -> [Vec<u16>; 3] {
    [
        lut.iter().map(|e| e.r).collect(),
        lut.iter().map(|e| e.g).collect(),
        lut.iter().map(|e| e.b).collect(),
    ]
}

/// Encodes `lut` as an array of `struct drm_color_lut`.
pub fn lut_blob(lut: &[GammaRampRgbEntry]) -> Vec<u8> {
    let mut data = Vec::with_capacity(lut.len() * std::mem::size_of::<sys::drm_color_lut>());
    for entry in lut {
        data.extend_from_slice(&entry.r.to_ne_bytes());
        data.extend_from_slice(&entry.g.to_ne_bytes());
        data.extend_from_slice(&entry.b.to_ne_bytes());
        data.extend_from_slice(&0u16.to_ne_bytes());
    }
    data
}

/// Converts a coefficient to the sign-magnitude S31.32 representation of `drm_color_ctm`.
pub fn ctm_coefficient(value: f32) -> u64 {
    let magnitude = (value.abs() as f64 * (1u64 << 32) as f64) as u64 & !(1u64 << 63);
    if value < 0.0 {
        magnitude | (1u64 << 63)
    } else {
        magnitude
    }
}

/// Encodes a row-major 3x3 matrix as `struct drm_color_ctm`. Returns `None` unless `matrix` has
/// exactly nine coefficients.
pub fn ctm_blob(matrix: &[f32]) -> Option<Vec<u8>> {
    if matrix.len() != 9 {
        return None;
    }
    Some(matrix.iter().flat_map(|&v| ctm_coefficient(v).to_ne_bytes()).collect())
}
