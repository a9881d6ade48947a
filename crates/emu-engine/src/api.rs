//! Host-facing configuration, run options and run outcomes.

use std::time::Duration;

use crate::{
    validate_page_size, Arch, EngineError, Mode, RegisterFile, DEFAULT_MEMORY_LIMIT,
    DEFAULT_PAGE_SIZE,
};

/// Default cap on simultaneously registered hooks per context.
pub const DEFAULT_MAX_HOOKS: usize = 1024;

/// Default number of instructions decoded ahead to size a basic block.
pub const DEFAULT_BLOCK_SCAN_LIMIT: usize = 64;

/// Top-level immutable configuration for an emulation context.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct EngineConfig {
    /// Architecture family.
    pub arch: Arch,
    /// Processor mode.
    pub mode: Mode,
    /// Mapping granule in bytes; must be a power of two.
    pub page_size: u64,
    /// Upper bound on the total number of mapped bytes.
    pub memory_limit: u64,
    /// Upper bound on simultaneously registered hooks.
    pub max_hooks: usize,
    /// Maximum instructions decoded ahead when sizing a block for block hooks.
    pub block_scan_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            arch: Arch::X86,
            mode: Mode::Protected32,
            page_size: DEFAULT_PAGE_SIZE,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            max_hooks: DEFAULT_MAX_HOOKS,
            block_scan_limit: DEFAULT_BLOCK_SCAN_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Default configuration for the given mode.
    #[must_use]
    pub fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Checks the configuration before a context is built from it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] for a page size that is not a
    /// power of two, or a zero block scan limit.
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_page_size(self.page_size)?;
        if self.block_scan_limit == 0 {
            return Err(EngineError::InvalidArgument(
                "block scan limit must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Per-run limits passed to [`crate::Engine::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RunOptions {
    /// Wall-clock budget checked at instruction boundaries.
    pub timeout: Option<Duration>,
    /// Maximum number of instructions to execute.
    pub count: Option<u64>,
}

impl RunOptions {
    /// Runs without limits.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            timeout: None,
            count: None,
        }
    }

    /// Limits the run to `count` instructions.
    #[must_use]
    pub const fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Limits the run to the given wall-clock duration.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Why a non-faulting run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum RunOutcome {
    /// The program counter reached the end address.
    EndReached,
    /// The instruction budget was exhausted.
    InstructionLimit,
    /// A `HLT` instruction retired.
    Halted,
    /// The wall-clock timeout elapsed.
    TimedOut,
    /// A hook requested a stop.
    StoppedByHook,
    /// A [`crate::StopHandle`] requested a stop.
    StoppedExternally,
}

impl RunOutcome {
    /// Returns `true` when a stop request, not the run limits, ended the run.
    #[must_use]
    pub const fn is_user_stop(self) -> bool {
        matches!(self, Self::StoppedByHook | Self::StoppedExternally)
    }
}

/// Saved register state of a context.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct CpuContext {
    registers: RegisterFile,
}

impl CpuContext {
    pub(crate) const fn capture(registers: RegisterFile) -> Self {
        Self { registers }
    }

    /// Mode the context was captured in.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.registers.mode()
    }

    /// Captured register values.
    #[must_use]
    pub const fn registers(&self) -> &RegisterFile {
        &self.registers
    }
}
