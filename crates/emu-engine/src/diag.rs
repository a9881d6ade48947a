//! Run statistics kept per emulation context.

use crate::{Fault, FaultClass};

/// Saturating counters describing what a context has executed so far.
///
/// Counters accumulate across runs until [`RunStats::reset`] is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RunStats {
    /// Retired instructions.
    pub instructions: u64,
    /// Basic blocks entered.
    pub blocks: u64,
    /// Hook callbacks invoked, all classes combined.
    pub hook_calls: u64,
    /// Unmapped-memory faults.
    pub fault_count_unmapped: u32,
    /// Permission faults.
    pub fault_count_protection: u32,
    /// Decode and unhandled-interrupt faults.
    pub fault_count_decode: u32,
    /// Most recent fault that ended a run.
    pub last_fault: Option<Fault>,
}

impl RunStats {
    /// Creates zeroed statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fault that ended a run.
    #[allow(clippy::missing_const_for_fn)]
    pub fn record_fault(&mut self, fault: Fault) {
        self.last_fault = Some(fault);
        match fault.kind.class() {
            FaultClass::Unmapped => {
                self.fault_count_unmapped = self.fault_count_unmapped.saturating_add(1);
            }
            FaultClass::Protection => {
                self.fault_count_protection = self.fault_count_protection.saturating_add(1);
            }
            FaultClass::Decode => {
                self.fault_count_decode = self.fault_count_decode.saturating_add(1);
            }
        }
    }

    #[allow(clippy::missing_const_for_fn)]
    pub(crate) fn record_instruction(&mut self) {
        self.instructions = self.instructions.saturating_add(1);
    }

    #[allow(clippy::missing_const_for_fn)]
    pub(crate) fn record_block(&mut self) {
        self.blocks = self.blocks.saturating_add(1);
    }

    #[allow(clippy::missing_const_for_fn)]
    pub(crate) fn record_hook_call(&mut self) {
        self.hook_calls = self.hook_calls.saturating_add(1);
    }

    /// Total faults recorded across all classes.
    #[must_use]
    pub const fn fault_count(&self) -> u64 {
        self.fault_count_unmapped as u64
            + self.fault_count_protection as u64
            + self.fault_count_decode as u64
    }

    /// Resets all counters.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
