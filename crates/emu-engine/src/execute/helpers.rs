//! Operand decoding helpers shared by the instruction handlers.

use iced_x86::{Code, ConditionCode, Instruction, Mnemonic, OpKind, Register as IcedRegister};

use crate::state::{width_mask, Flag, GprSlot, Register, RegisterFile};
use crate::Mode;

/// Physical indices of the fixed-role registers.
pub(crate) const RAX: u8 = 0;
pub(crate) const RCX: u8 = 1;
pub(crate) const RDX: u8 = 2;
pub(crate) const RSP: u8 = 4;
pub(crate) const RBP: u8 = 5;
pub(crate) const RSI: u8 = 6;
pub(crate) const RDI: u8 = 7;

/// `bits`-wide view of physical register `index`.
pub(crate) const fn slot(index: u8, bits: u8) -> GprSlot {
    GprSlot::new(index, 0, bits)
}

/// Where an operand lives once its address has been resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Location {
    /// General-purpose register view.
    Reg(GprSlot),
    /// Guest memory at a linear address.
    Mem { address: u64, size: u8 },
}

impl Location {
    pub(crate) const fn bits(self) -> u8 {
        match self {
            Self::Reg(slot) => slot.bits,
            Self::Mem { size, .. } => size * 8,
        }
    }
}

/// Offset part of a memory operand, before the segment base is applied.
pub(crate) fn memory_offset(regs: &RegisterFile, instr: &Instruction, address_bits: u8) -> u64 {
    let base = instr.memory_base();
    if matches!(base, IcedRegister::RIP | IcedRegister::EIP) {
        // The decoder already folded next-IP into the displacement.
        return instr.memory_displacement64() & width_mask(address_bits);
    }
    let mut offset = instr.memory_displacement64();
    if let Some(slot) = Register::gpr_slot(base) {
        offset = offset.wrapping_add(regs.gpr(slot));
    }
    if let Some(slot) = Register::gpr_slot(instr.memory_index()) {
        let scale = u64::from(instr.memory_index_scale());
        offset = offset.wrapping_add(regs.gpr(slot).wrapping_mul(scale));
    }
    offset & width_mask(address_bits)
}

/// Linear address of the memory operand.
///
/// Only the start address wraps under the mode mask. An access that runs
/// past the top of a 16- or 32-bit address space faults at its start.
pub(crate) fn linear_address(regs: &RegisterFile, instr: &Instruction, address_bits: u8) -> u64 {
    let offset = memory_offset(regs, instr, address_bits);
    offset.wrapping_add(regs.segment_base(instr.memory_segment())) & regs.mode().address_mask()
}

/// Value of an immediate operand, sign-extended where the encoding says so.
pub(crate) fn immediate(instr: &Instruction, operand: u32) -> Option<u64> {
    Some(match instr.op_kind(operand) {
        OpKind::Immediate8 => u64::from(instr.immediate8()),
        OpKind::Immediate8_2nd => u64::from(instr.immediate8_2nd()),
        OpKind::Immediate16 => u64::from(instr.immediate16()),
        OpKind::Immediate32 => u64::from(instr.immediate32()),
        OpKind::Immediate64 => instr.immediate64(),
        OpKind::Immediate8to16 => instr.immediate8to16() as u64,
        OpKind::Immediate8to32 => instr.immediate8to32() as u64,
        OpKind::Immediate8to64 => instr.immediate8to64() as u64,
        OpKind::Immediate32to64 => instr.immediate32to64() as u64,
        _ => return None,
    })
}

/// Width in bits implied by an immediate operand kind on its own.
pub(crate) const fn immediate_bits(kind: OpKind) -> Option<u8> {
    match kind {
        OpKind::Immediate8 | OpKind::Immediate8_2nd => Some(8),
        OpKind::Immediate16 | OpKind::Immediate8to16 => Some(16),
        OpKind::Immediate32 | OpKind::Immediate8to32 => Some(32),
        OpKind::Immediate64 | OpKind::Immediate8to64 | OpKind::Immediate32to64 => Some(64),
        _ => None,
    }
}

/// Width in bits of a near branch target operand.
pub(crate) const fn branch_bits(kind: OpKind) -> Option<u8> {
    match kind {
        OpKind::NearBranch16 => Some(16),
        OpKind::NearBranch32 => Some(32),
        OpKind::NearBranch64 => Some(64),
        _ => None,
    }
}

/// Return-address width of a near `RET`.
pub(crate) const fn ret_bits(code: Code) -> Option<u8> {
    match code {
        Code::Retnw | Code::Retnw_imm16 => Some(16),
        Code::Retnd | Code::Retnd_imm16 => Some(32),
        Code::Retnq | Code::Retnq_imm16 => Some(64),
        _ => None,
    }
}

/// Returns `true` when operand 0 is the `ES:[rDI]` operand of a string instruction.
pub(crate) fn is_string_form(instr: &Instruction) -> bool {
    matches!(
        instr.op0_kind(),
        OpKind::MemoryESDI | OpKind::MemoryESEDI | OpKind::MemoryESRDI
    )
}

/// Evaluates a condition code against the current flags.
pub(crate) const fn condition_holds(regs: &RegisterFile, cc: ConditionCode) -> bool {
    let cf = regs.flag(Flag::Cf);
    let zf = regs.flag(Flag::Zf);
    let sf = regs.flag(Flag::Sf);
    let of = regs.flag(Flag::Of);
    let pf = regs.flag(Flag::Pf);
    match cc {
        ConditionCode::None => true,
        ConditionCode::o => of,
        ConditionCode::no => !of,
        ConditionCode::b => cf,
        ConditionCode::ae => !cf,
        ConditionCode::e => zf,
        ConditionCode::ne => !zf,
        ConditionCode::be => cf || zf,
        ConditionCode::a => !cf && !zf,
        ConditionCode::s => sf,
        ConditionCode::ns => !sf,
        ConditionCode::p => pf,
        ConditionCode::np => !pf,
        ConditionCode::l => sf != of,
        ConditionCode::ge => sf == of,
        ConditionCode::le => zf || sf != of,
        ConditionCode::g => !zf && sf == of,
        _ => false,
    }
}

/// Returns `true` for the `CMOVcc` family.
pub(crate) const fn is_cmovcc(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Cmovo
            | Mnemonic::Cmovno
            | Mnemonic::Cmovb
            | Mnemonic::Cmovae
            | Mnemonic::Cmove
            | Mnemonic::Cmovne
            | Mnemonic::Cmovbe
            | Mnemonic::Cmova
            | Mnemonic::Cmovs
            | Mnemonic::Cmovns
            | Mnemonic::Cmovp
            | Mnemonic::Cmovnp
            | Mnemonic::Cmovl
            | Mnemonic::Cmovge
            | Mnemonic::Cmovle
            | Mnemonic::Cmovg
    )
}

/// Returns `true` for the `SETcc` family.
pub(crate) const fn is_setcc(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Seto
            | Mnemonic::Setno
            | Mnemonic::Setb
            | Mnemonic::Setae
            | Mnemonic::Sete
            | Mnemonic::Setne
            | Mnemonic::Setbe
            | Mnemonic::Seta
            | Mnemonic::Sets
            | Mnemonic::Setns
            | Mnemonic::Setp
            | Mnemonic::Setnp
            | Mnemonic::Setl
            | Mnemonic::Setge
            | Mnemonic::Setle
            | Mnemonic::Setg
    )
}

/// Stack pointer view for the mode.
pub(crate) const fn stack_slot(mode: Mode) -> GprSlot {
    slot(RSP, mode.stack_width() * 8)
}
