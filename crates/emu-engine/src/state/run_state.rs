use crate::{Fault, RunOutcome};

/// Lifecycle state of an emulation context as observed between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum EngineState {
    /// Created or reset, no run has completed yet.
    #[default]
    Idle,
    /// Inside `start`. Hooks see the [`Machine`](crate::Machine) rather than
    /// the engine, so this is never observed through the owned API.
    Running,
    /// Last run ended without a fault.
    Stopped(RunOutcome),
    /// Last run ended on a fault. Registers hold the state at the faulting instruction.
    Faulted(Fault),
}

impl EngineState {
    /// Returns the fault that ended the last run, if any.
    #[must_use]
    pub const fn last_fault(self) -> Option<Fault> {
        match self {
            Self::Faulted(fault) => Some(fault),
            Self::Idle | Self::Running | Self::Stopped(_) => None,
        }
    }

    /// Returns `true` while a run is in progress.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}
