#![no_main]

use cros_kms::drm::events::DrmEvent;
use cros_kms::drm::events::EventIterator;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for event in EventIterator::new(data) {
        if let DrmEvent::Unknown { length, .. } = event {
            assert!(length as usize <= data.len());
        }
    }
});
