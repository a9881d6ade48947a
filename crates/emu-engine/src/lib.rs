//! x86 instruction-dispatch and hook-interception emulation engine.
//!
//! An [`Engine`] owns a sparse guest address space, an x86 register bank and an
//! ordered set of typed hooks. [`Engine::start`] fetches, decodes and executes
//! instructions until an end address, a limit, a stop request or a fault.
//! [`EngineTable`] exposes the same operations through numeric handles for
//! binding layers.

/// Architecture and processor-mode selection.
pub mod arch;
pub use arch::{Arch, Mode};

/// Fault taxonomy, binding error codes and the engine error type.
pub mod fault;
pub use fault::{EngineError, ErrorCode, Fault, FaultClass, FaultKind};

/// Guest address space with page-granular mappings and permissions.
pub mod memory;
pub use memory::{
    validate_mapping_range, validate_page_size, validate_scalar_width, AccessKind, AddressSpace,
    Permissions, RegionInfo, DEFAULT_MEMORY_LIMIT, DEFAULT_PAGE_SIZE, MAX_INSTRUCTION_BYTES,
};

/// Register file and lifecycle state of a context.
pub mod state;
pub use state::{
    width_mask, EngineState, Flag, GprSlot, Register, RegisterFile, RegisterView, FLAGS_ACTIVE_MASK,
    FLAGS_STATUS_MASK, FLAG_AF, FLAG_CF, FLAG_DF, FLAG_FIXED, FLAG_IF, FLAG_OF, FLAG_PF, FLAG_SF,
    FLAG_TF, FLAG_ZF, GENERAL_REGISTER_COUNT, SEGMENT_REGISTER_COUNT,
};

/// Host-facing configuration, run options and outcomes.
pub mod api;
pub use api::{
    CpuContext, EngineConfig, RunOptions, RunOutcome, DEFAULT_BLOCK_SCAN_LIMIT, DEFAULT_MAX_HOOKS,
};

/// Run statistics.
pub mod diag;
pub use diag::RunStats;

/// Instruction fetch and decode.
pub mod decoder;
pub use decoder::{DecodedInstruction, DecodedOrFault, Decoder};

/// Hookable instruction classes.
pub mod mnemonic;
pub use mnemonic::{HookableInsn, InterruptInsn, DIVIDE_ERROR_VECTOR};

/// Instruction execution and flag arithmetic.
pub mod execute;
pub use execute::{
    add, dec, div, execute_instruction, idiv, imul, inc, logic, mul, neg, result_flags, shift,
    sign_extend, sub, ExecuteOutcome, FlagsUpdate, Product, ShiftOp,
};

/// Typed hook callbacks and their registry.
pub mod hooks;
pub use hooks::{
    AddressRange, CodeCallback, Hook, HookClass, HookId, HookRegistry, InCallback, InsnCallback,
    InterruptCallback, MemFaultCallback, MemReadCallback, MemWriteCallback, OutCallback,
};

/// Mutable context shared with hooks.
pub mod machine;
pub use machine::{Machine, StopHandle};

/// Emulation context and execution controller.
pub mod engine;
pub use engine::Engine;

/// Handle-based binding surface.
pub mod handles;
pub use handles::{EngineHandle, EngineTable};

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;
#[cfg(test)]
use tracing_subscriber as _;
