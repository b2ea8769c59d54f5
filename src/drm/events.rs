// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsing of the event stream read from a DRM file descriptor.

use std::io::Cursor;

use bytes::Buf;

use crate::drm::sys;

const EVENT_HEADER_LEN: usize = std::mem::size_of::<sys::drm_event>();
const VBLANK_EVENT_LEN: usize = std::mem::size_of::<sys::drm_event_vblank>();

/// Payload shared by vblank and flip-complete events.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VblankEvent {
    pub user_data: u64,
    pub tv_sec: u32,
    pub tv_usec: u32,
    pub sequence: u32,
    pub crtc_id: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DrmEvent {
    Vblank(VblankEvent),
    FlipComplete(VblankEvent),
    /// An event type we do not handle, skipped by its advertised length.
    Unknown { type_: u32, length: u32 },
}

/// Iterates over the events contained in one read of the DRM file.
///
/// A truncated trailing record ends the iteration.
pub struct EventIterator<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> EventIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { cursor: Cursor::new(data) }
    }
}

fn parse_vblank(cursor: &mut Cursor<&[u8]>) -> VblankEvent {
    VblankEvent {
        user_data: cursor.get_u64_ne(),
        tv_sec: cursor.get_u32_ne(),
        tv_usec: cursor.get_u32_ne(),
        sequence: cursor.get_u32_ne(),
        crtc_id: cursor.get_u32_ne(),
    }
}

impl<'a> Iterator for EventIterator<'a> {
    type Item = DrmEvent;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.remaining() < EVENT_HEADER_LEN {
            return None;
        }

        let start = self.cursor.position();
        let type_ = self.cursor.get_u32_ne();
        let length = self.cursor.get_u32_ne();
        let body_len = (length as usize).checked_sub(EVENT_HEADER_LEN)?;
        if self.cursor.remaining() < body_len {
            log::warn!("Truncated DRM event of type {type_} ({length} bytes)");
            return None;
        }

        let event = match type_ {
            sys::DRM_EVENT_VBLANK | sys::DRM_EVENT_FLIP_COMPLETE
                if length as usize >= VBLANK_EVENT_LEN =>
            {
                let vblank = parse_vblank(&mut self.cursor);
                if type_ == sys::DRM_EVENT_VBLANK {
                    DrmEvent::Vblank(vblank)
                } else {
                    DrmEvent::FlipComplete(vblank)
                }
            }
            _ => DrmEvent::Unknown { type_, length },
        };

        self.cursor.set_position(start + length as u64);
        Some(event)
    }
}

/// Serializes a vblank-style event the way the kernel lays it out. Used to feed the parser from
/// software backends.
pub fn encode_vblank_event(type_: u32, event: &VblankEvent) -> Vec<u8> {
    let mut data = Vec::with_capacity(VBLANK_EVENT_LEN);
    data.extend_from_slice(&type_.to_ne_bytes());
    data.extend_from_slice(&(VBLANK_EVENT_LEN as u32).to_ne_bytes());
    data.extend_from_slice(&event.user_data.to_ne_bytes());
    data.extend_from_slice(&event.tv_sec.to_ne_bytes());
    data.extend_from_slice(&event.tv_usec.to_ne_bytes());
    data.extend_from_slice(&event.sequence.to_ne_bytes());
    data.extend_from_slice(&event.crtc_id.to_ne_bytes());
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_two_flip_events() {
        let first =
            VblankEvent { user_data: 1, tv_sec: 10, tv_usec: 20, sequence: 30, crtc_id: 40 };
        let second = VblankEvent { user_data: 2, ..first };
        let mut data = encode_vblank_event(sys::DRM_EVENT_FLIP_COMPLETE, &first);
        data.extend(encode_vblank_event(sys::DRM_EVENT_VBLANK, &second));

        let events: Vec<_> = EventIterator::new(&data).collect();
        assert_eq!(events, vec![DrmEvent::FlipComplete(first), DrmEvent::Vblank(second)]);
    }

    #[test]
    fn skip_unknown_events() {
        let mut data = vec![];
        data.extend_from_slice(&0x8000_0001u32.to_ne_bytes());
        data.extend_from_slice(&12u32.to_ne_bytes());
        data.extend_from_slice(&[0xaa; 4]);
        let flip = VblankEvent { user_data: 5, ..Default::default() };
        data.extend(encode_vblank_event(sys::DRM_EVENT_FLIP_COMPLETE, &flip));

        let events: Vec<_> = EventIterator::new(&data).collect();
        assert_eq!(
            events,
            vec![DrmEvent::Unknown { type_: 0x8000_0001, length: 12 }, DrmEvent::FlipComplete(flip)]
        );
    }

    #[test]
    fn truncated_records_stop_iteration() {
        let flip = VblankEvent { user_data: 5, ..Default::default() };
        let data = encode_vblank_event(sys::DRM_EVENT_FLIP_COMPLETE, &flip);
        assert_eq!(EventIterator::new(&data[..data.len() - 1]).count(), 0);
        assert_eq!(EventIterator::new(&data[..3]).count(), 0);

        // A header claiming to be shorter than itself is garbage.
        let mut bogus = vec![];
        bogus.extend_from_slice(&sys::DRM_EVENT_VBLANK.to_ne_bytes());
        bogus.extend_from_slice(&4u32.to_ne_bytes());
        assert_eq!(EventIterator::new(&bogus).count(), 0);
    }
}
