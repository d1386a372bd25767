use crate::composer::EditEffect;

/// Whether the master artifact may no longer reflect the current prompts.
///
/// Only consistency and first-unit prompt edits count, and only while an
/// artifact exists. Reference image changes are not tracked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StalenessTracker {
    stale: bool,
}

impl StalenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stale(self) -> bool {
        self.stale
    }

    /// Returns true when this edit is what turned the master stale.
    pub fn observe_edit(&mut self, effect: EditEffect, artifact_exists: bool) -> bool {
        if !artifact_exists || !effect.touches_master() || self.stale {
            return false;
        }
        self.stale = true;
        true
    }

    /// Called only when a new master artifact has been produced.
    pub fn clear(&mut self) {
        self.stale = false;
    }
}
