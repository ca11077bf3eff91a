//! Reassembly of the three fingerprint data chunks read after each detection event

use fingerlock_proto::{CharacteristicRole, hex_encode};

/// Three hex slots, one per data characteristic, plus a completion flag.
///
/// Only the session worker touches this; there is no internal locking.
#[derive(Debug, Default)]
pub struct FingerprintAssembler {
    slots: [Option<String>; 3],
    complete: bool,
}

impl FingerprintAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new cycle. Must run before the chunk reads are issued so a
    /// straggler from the previous cycle cannot land in the new one.
    pub fn on_event_detected(&mut self) {
        self.reset();
    }

    /// Drop whatever has been collected (used on disconnect as well)
    pub fn reset(&mut self) {
        self.slots = Default::default();
        self.complete = false;
    }

    /// Store a chunk. Returns the concatenated hex (1, 2, 3 order) exactly
    /// once, when the last missing slot is filled.
    pub fn on_chunk_received(&mut self, role: CharacteristicRole, raw: &[u8]) -> Option<String> {
        let Some(index) = role.data_index() else {
            debug_assert!(false, "{role:?} is not a fingerprint data role");
            return None;
        };

        if self.complete {
            log::debug!("Ignoring {role:?} chunk, cycle already classified");
            return None;
        }

        self.slots[index] = Some(hex_encode(raw));

        if self.slots.iter().all(|s| s.as_deref().is_some_and(|s| !s.is_empty())) {
            self.complete = true;
            Some(self.slots.iter().flatten().map(String::as_str).collect())
        } else {
            None
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Number of slots filled in the current cycle
    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
