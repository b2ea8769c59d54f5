// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bookkeeping of outstanding page flips.
//!
//! Every flip (or atomic commit requesting an event) gets a monotonically increasing id which is
//! handed to the kernel as the event's `user_data`. A registered entry waits for a fixed number of
//! completion events, one per CRTC touched by the commit, before its callback fires.

/// Parameters of a completed page flip, forwarded unmodified from the kernel event.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PageFlipEvent {
    pub frame: u32,
    pub seconds: u32,
    pub useconds: u32,
}

pub type PageFlipCallback = Box<dyn FnOnce(PageFlipEvent) + Send + 'static>;

struct PageFlip {
    id: u64,
    pending_calls: u32,
    callback: PageFlipCallback,
}

#[derive(Default)]
pub struct PageFlipManager {
    next_id: u64,
    // Outstanding flips are bounded by the number of CRTCs flipping at once, so a linear scan is
    // fine here.
    callbacks: Vec<PageFlip>,
}

impl PageFlipManager {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Registers `callback` to run once `pending_calls` events carrying `id` have arrived.
    pub fn register(&mut self, id: u64, pending_calls: u32, callback: PageFlipCallback) {
        self.callbacks.push(PageFlip { id, pending_calls: pending_calls.max(1), callback });
    }

    /// Drops the entry for `id` without running its callback. Used when the kernel rejected the
    /// request that would have produced the events.
    pub fn unregister(&mut self, id: u64) -> bool {
        match self.callbacks.iter().position(|flip| flip.id == id) {
            Some(idx) => {
                self.callbacks.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Accounts for one completion event. Returns the callback to run if this was the last event
    /// the entry was waiting for. The caller must run it after releasing any lock guarding this
    /// manager since callbacks may schedule the next flip.
    pub fn on_page_flip(
        &mut self,
        id: u64,
        event: PageFlipEvent,
    ) -> Option<(PageFlipCallback, PageFlipEvent)> {
        let idx = match self.callbacks.iter().position(|flip| flip.id == id) {
            Some(idx) => idx,
            None => {
                log::error!("Received page flip event for unknown id {id}");
                return None;
            }
        };

        let flip = &mut self.callbacks[idx];
        flip.pending_calls -= 1;
        if flip.pending_calls > 0 {
            return None;
        }

        let flip = self.callbacks.remove(idx);
        Some((flip.callback, event))
    }

    pub fn pending_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Forgets every outstanding flip. Their events will never arrive once the device is gone.
    pub fn abandon_all(&mut self) -> usize {
        let count = self.callbacks.len();
        if count > 0 {
            log::warn!("Dropping {count} page flip callbacks that will never complete");
        }
        self.callbacks.clear();
        count
    }
}
