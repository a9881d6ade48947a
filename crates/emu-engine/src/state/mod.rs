//! Architectural CPU state and run-state machine.

/// Register identifiers, aliasing rules and the register bank.
pub mod registers;
/// Lifecycle states of an emulation context.
pub mod run_state;

pub use registers::{
    width_mask, Flag, GprSlot, Register, RegisterFile, RegisterView, FLAGS_ACTIVE_MASK,
    FLAGS_STATUS_MASK, FLAG_AF, FLAG_CF, FLAG_DF, FLAG_FIXED, FLAG_IF, FLAG_OF, FLAG_PF, FLAG_SF,
    FLAG_TF, FLAG_ZF, GENERAL_REGISTER_COUNT, SEGMENT_REGISTER_COUNT,
};
pub use run_state::EngineState;
