//! Instruction execution.
//!
//! Each instruction runs in this order:
//! 1. Resolve operands and read sources (memory reads go through read hooks)
//! 2. Compute the result
//! 3. Write memory destinations (through write hooks), then registers
//! 4. Update status flags
//! 5. Advance or redirect the program counter
//!
//! Effects committed before a fault stay committed; the program counter is
//! left at the faulting instruction.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::similar_names
)]

mod alu;
mod flags;
mod helpers;
mod string;
mod system;

pub use alu::{div, idiv, imul, mul, shift, sign_extend, Product, ShiftOp};
pub use flags::{add, dec, inc, logic, neg, result_flags, sub, FlagsUpdate};

use iced_x86::{Mnemonic, OpKind};
use tracing::trace;

use crate::decoder::DecodedInstruction;
use crate::hooks::HookRegistry;
use crate::memory::AccessKind;
use crate::state::{width_mask, Flag, Register};
use crate::{Fault, FaultKind, Machine};

use helpers::{
    branch_bits, condition_holds, immediate, immediate_bits, is_cmovcc, is_setcc, linear_address,
    memory_offset, ret_bits, slot, stack_slot, Location, RAX, RBP, RCX, RDX,
};

/// How a successfully executed instruction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecuteOutcome {
    /// The instruction retired; execution continues at the current PC.
    Retired,
    /// `HLT` retired; the run stops.
    Halted,
}

/// Executes one decoded instruction against `machine`, dispatching memory,
/// instruction and interrupt hooks from `hooks`.
///
/// # Errors
///
/// Returns the fault raised by a memory access, an unsupported instruction or
/// an unhandled interrupt. The program counter is restored to the
/// instruction's address.
pub fn execute_instruction(
    machine: &mut Machine,
    hooks: &mut HookRegistry,
    decoded: &DecodedInstruction,
) -> Result<ExecuteOutcome, Fault> {
    let pc = decoded.address();
    trace!(pc, mnemonic = ?decoded.mnemonic(), "execute");
    let mut exec = Executor {
        machine,
        hooks,
        decoded,
    };
    let result = exec.run();
    if result.is_err() {
        exec.machine.registers.set_rip(pc);
    }
    result
}

/// Mutable view over the context while one instruction executes.
pub(crate) struct Executor<'a> {
    machine: &'a mut Machine,
    hooks: &'a mut HookRegistry,
    decoded: &'a DecodedInstruction,
}

impl Executor<'_> {
    fn invalid(&self) -> Fault {
        Fault::new(FaultKind::InvalidInstruction, self.decoded.address())
    }

    fn next_ip(&self) -> u64 {
        self.decoded.next_ip()
    }

    fn advance(&mut self) {
        let next = self.next_ip();
        self.machine.registers.set_rip(next);
    }

    fn gpr(&self, index: u8, bits: u8) -> u64 {
        self.machine.registers.gpr(slot(index, bits))
    }

    fn set_gpr(&mut self, index: u8, bits: u8, value: u64) {
        self.machine.registers.set_gpr(slot(index, bits), value);
    }

    fn apply_flags(&mut self, update: FlagsUpdate) {
        self.machine
            .registers
            .update_status_flags(update.mask, update.status);
    }

    /// Validates a guest access, giving invalid-access hooks one chance to fix it.
    fn check_access(
        &mut self,
        address: u64,
        size: u8,
        access: AccessKind,
        value: u64,
    ) -> Result<(), Fault> {
        let len = usize::from(size);
        match self.machine.memory.probe(address, len, access) {
            Ok(()) => Ok(()),
            Err(fault) => {
                if self
                    .hooks
                    .dispatch_mem_fault(self.machine, access, address, len, value)
                {
                    self.machine.memory.probe(address, len, access)
                } else {
                    Err(fault)
                }
            }
        }
    }

    fn mem_read(&mut self, address: u64, size: u8) -> Result<u64, Fault> {
        self.check_access(address, size, AccessKind::Read, 0)?;
        self.hooks
            .dispatch_mem_read(self.machine, address, usize::from(size));
        self.machine
            .memory
            .read_scalar(address, size, AccessKind::Read)
    }

    fn mem_write(&mut self, address: u64, size: u8, value: u64) -> Result<(), Fault> {
        let value = value & width_mask(size * 8);
        self.check_access(address, size, AccessKind::Write, value)?;
        self.hooks
            .dispatch_mem_write(self.machine, address, usize::from(size), value);
        self.machine.memory.write_scalar(address, size, value)
    }

    fn location(&self, operand: u32) -> Result<Location, Fault> {
        let instr = &self.decoded.instruction;
        match instr.op_kind(operand) {
            OpKind::Register => Register::gpr_slot(instr.op_register(operand))
                .map(Location::Reg)
                .ok_or_else(|| self.invalid()),
            OpKind::Memory => {
                let size = instr.memory_size().size();
                if !matches!(size, 1 | 2 | 4 | 8) {
                    return Err(self.invalid());
                }
                Ok(Location::Mem {
                    address: linear_address(
                        &self.machine.registers,
                        instr,
                        self.decoded.address_bits,
                    ),
                    size: size as u8,
                })
            }
            _ => Err(self.invalid()),
        }
    }

    fn load(&mut self, location: Location) -> Result<u64, Fault> {
        match location {
            Location::Reg(slot) => Ok(self.machine.registers.gpr(slot)),
            Location::Mem { address, size } => self.mem_read(address, size),
        }
    }

    fn store(&mut self, location: Location, value: u64) -> Result<(), Fault> {
        match location {
            Location::Reg(slot) => {
                self.machine.registers.set_gpr(slot, value);
                Ok(())
            }
            Location::Mem { address, size } => self.mem_write(address, size, value),
        }
    }

    /// Reads a source operand; immediates are truncated to `bits`.
    fn read_source(&mut self, operand: u32, bits: u8) -> Result<u64, Fault> {
        if let Some(value) = immediate(&self.decoded.instruction, operand) {
            return Ok(value & width_mask(bits));
        }
        let location = self.location(operand)?;
        self.load(location)
    }

    fn push(&mut self, value: u64, size: u8) -> Result<(), Fault> {
        let sp_slot = stack_slot(self.machine.mode());
        let sp = self
            .machine
            .registers
            .gpr(sp_slot)
            .wrapping_sub(u64::from(size))
            & width_mask(sp_slot.bits);
        self.mem_write(sp, size, value)?;
        self.machine.registers.set_gpr(sp_slot, sp);
        Ok(())
    }

    fn pop(&mut self, size: u8) -> Result<u64, Fault> {
        let sp_slot = stack_slot(self.machine.mode());
        let sp = self.machine.registers.gpr(sp_slot);
        let value = self.mem_read(sp, size)?;
        self.machine
            .registers
            .set_gpr(sp_slot, sp.wrapping_add(u64::from(size)));
        Ok(value)
    }

    fn run(&mut self) -> Result<ExecuteOutcome, Fault> {
        let mnemonic = self.decoded.mnemonic();
        let instr = self.decoded.instruction;

        if instr.is_jcc_short_or_near() {
            let taken = condition_holds(&self.machine.registers, instr.condition_code());
            let target = if taken {
                instr.near_branch_target()
            } else {
                self.next_ip()
            };
            self.machine.registers.set_rip(target);
            return Ok(ExecuteOutcome::Retired);
        }
        if is_cmovcc(mnemonic) {
            self.cmov()?;
            self.advance();
            return Ok(ExecuteOutcome::Retired);
        }
        if is_setcc(mnemonic) {
            let value = u64::from(condition_holds(&self.machine.registers, instr.condition_code()));
            let dst = self.location(0)?;
            self.store(dst, value)?;
            self.advance();
            return Ok(ExecuteOutcome::Retired);
        }

        match mnemonic {
            Mnemonic::Nop => {}
            Mnemonic::Mov => self.mov()?,
            Mnemonic::Movzx | Mnemonic::Movsx | Mnemonic::Movsxd => self.extend_move(mnemonic)?,
            Mnemonic::Lea => self.lea()?,
            Mnemonic::Xchg => self.xchg()?,
            Mnemonic::Push => self.push_operand()?,
            Mnemonic::Pop => self.pop_operand()?,
            Mnemonic::Pushf | Mnemonic::Pushfd | Mnemonic::Pushfq => self.pushf(mnemonic)?,
            Mnemonic::Popf | Mnemonic::Popfd | Mnemonic::Popfq => self.popf(mnemonic)?,
            Mnemonic::Leave => self.leave()?,
            Mnemonic::Cbw | Mnemonic::Cwde | Mnemonic::Cdqe => self.widen_accumulator(mnemonic),
            Mnemonic::Cwd | Mnemonic::Cdq | Mnemonic::Cqo => self.sign_into_rdx(mnemonic),
            Mnemonic::Add
            | Mnemonic::Adc
            | Mnemonic::Sub
            | Mnemonic::Sbb
            | Mnemonic::Cmp
            | Mnemonic::And
            | Mnemonic::Or
            | Mnemonic::Xor
            | Mnemonic::Test => self.binary(mnemonic)?,
            Mnemonic::Inc | Mnemonic::Dec | Mnemonic::Neg | Mnemonic::Not => self.unary(mnemonic)?,
            Mnemonic::Shl
            | Mnemonic::Sal
            | Mnemonic::Shr
            | Mnemonic::Sar
            | Mnemonic::Rol
            | Mnemonic::Ror => self.shift(mnemonic)?,
            Mnemonic::Mul | Mnemonic::Imul if instr.op_count() == 1 => self.widening_mul(mnemonic)?,
            Mnemonic::Imul => self.truncating_imul()?,
            Mnemonic::Div | Mnemonic::Idiv => return self.divide(mnemonic),
            Mnemonic::Jmp => return self.jmp(),
            Mnemonic::Jcxz | Mnemonic::Jecxz | Mnemonic::Jrcxz => return self.jcxz(mnemonic),
            Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne => return self.loop_(mnemonic),
            Mnemonic::Call => return self.call(),
            Mnemonic::Ret => return self.ret(),
            Mnemonic::Hlt => {
                self.advance();
                return Ok(ExecuteOutcome::Halted);
            }
            Mnemonic::Clc => self.machine.registers.set_flag(Flag::Cf, false),
            Mnemonic::Stc => self.machine.registers.set_flag(Flag::Cf, true),
            Mnemonic::Cmc => {
                let cf = self.machine.registers.flag(Flag::Cf);
                self.machine.registers.set_flag(Flag::Cf, !cf);
            }
            Mnemonic::Cld => self.machine.registers.set_flag(Flag::Df, false),
            Mnemonic::Std => self.machine.registers.set_flag(Flag::Df, true),
            Mnemonic::Cli => self.machine.registers.set_flag(Flag::If, false),
            Mnemonic::Sti => self.machine.registers.set_flag(Flag::If, true),
            Mnemonic::Movsb
            | Mnemonic::Movsw
            | Mnemonic::Movsd
            | Mnemonic::Movsq
            | Mnemonic::Stosb
            | Mnemonic::Stosw
            | Mnemonic::Stosd
            | Mnemonic::Stosq
            | Mnemonic::Lodsb
            | Mnemonic::Lodsw
            | Mnemonic::Lodsd
            | Mnemonic::Lodsq => self.string(mnemonic)?,
            Mnemonic::In
            | Mnemonic::Out
            | Mnemonic::Syscall
            | Mnemonic::Sysenter
            | Mnemonic::Cpuid
            | Mnemonic::Int
            | Mnemonic::Int1
            | Mnemonic::Int3
            | Mnemonic::Into
            | Mnemonic::Rdtsc => return self.system(mnemonic),
            _ => return Err(self.invalid()),
        }

        self.advance();
        Ok(ExecuteOutcome::Retired)
    }

    fn mov(&mut self) -> Result<(), Fault> {
        let dst = self.location(0)?;
        let value = self.read_source(1, dst.bits())?;
        self.store(dst, value)
    }

    fn extend_move(&mut self, mnemonic: Mnemonic) -> Result<(), Fault> {
        let dst = self.location(0)?;
        let src = self.location(1)?;
        let value = self.load(src)?;
        let value = if mnemonic == Mnemonic::Movzx {
            value
        } else {
            sign_extend(value, src.bits()) as u64
        };
        self.store(dst, value)
    }

    fn lea(&mut self) -> Result<(), Fault> {
        let dst = self.location(0)?;
        let offset = memory_offset(
            &self.machine.registers,
            &self.decoded.instruction,
            self.decoded.address_bits,
        );
        self.store(dst, offset)
    }

    fn xchg(&mut self) -> Result<(), Fault> {
        let a = self.location(0)?;
        let b = self.location(1)?;
        let va = self.load(a)?;
        let vb = self.load(b)?;
        // Memory side first so a faulting write leaves registers untouched.
        if matches!(a, Location::Mem { .. }) {
            self.store(a, vb)?;
            self.store(b, va)
        } else {
            self.store(b, va)?;
            self.store(a, vb)
        }
    }

    fn cmov(&mut self) -> Result<(), Fault> {
        let dst = self.location(0)?;
        let src = self.read_source(1, dst.bits())?;
        let taken = condition_holds(
            &self.machine.registers,
            self.decoded.instruction.condition_code(),
        );
        // A 32-bit destination is zero-extended even when the move is not taken.
        let value = if taken { src } else { self.load(dst)? };
        self.store(dst, value)
    }

    fn push_operand(&mut self) -> Result<(), Fault> {
        let instr = self.decoded.instruction;
        if let Some(bits) = immediate_bits(instr.op0_kind()) {
            let value = self.read_source(0, bits)?;
            return self.push(value, bits / 8);
        }
        let src = self.location(0)?;
        let value = self.load(src)?;
        self.push(value, src.bits() / 8)
    }

    fn pop_operand(&mut self) -> Result<(), Fault> {
        let dst = self.location(0)?;
        let value = self.pop(dst.bits() / 8)?;
        // Memory destinations are addressed with the incremented stack pointer.
        let dst = self.location(0)?;
        self.store(dst, value)
    }

    fn pushf(&mut self, mnemonic: Mnemonic) -> Result<(), Fault> {
        let size = match mnemonic {
            Mnemonic::Pushf => 2,
            Mnemonic::Pushfd => 4,
            _ => 8,
        };
        let value = self.machine.registers.rflags();
        self.push(value, size)
    }

    fn popf(&mut self, mnemonic: Mnemonic) -> Result<(), Fault> {
        let size: u8 = match mnemonic {
            Mnemonic::Popf => 2,
            Mnemonic::Popfd => 4,
            _ => 8,
        };
        let value = self.pop(size)?;
        let mask = width_mask(size * 8);
        let merged = (self.machine.registers.rflags() & !mask) | (value & mask);
        self.machine.registers.set_rflags(merged);
        Ok(())
    }

    fn leave(&mut self) -> Result<(), Fault> {
        let sp_slot = stack_slot(self.machine.mode());
        let frame = self.gpr(RBP, sp_slot.bits);
        self.machine.registers.set_gpr(sp_slot, frame);
        let value = self.pop(sp_slot.bits / 8)?;
        self.set_gpr(RBP, sp_slot.bits, value);
        Ok(())
    }

    fn widen_accumulator(&mut self, mnemonic: Mnemonic) {
        let (from, to) = match mnemonic {
            Mnemonic::Cbw => (8, 16),
            Mnemonic::Cwde => (16, 32),
            _ => (32, 64),
        };
        let value = sign_extend(self.gpr(RAX, from), from) as u64;
        self.set_gpr(RAX, to, value);
    }

    fn sign_into_rdx(&mut self, mnemonic: Mnemonic) {
        let bits = match mnemonic {
            Mnemonic::Cwd => 16,
            Mnemonic::Cdq => 32,
            _ => 64,
        };
        let negative = sign_extend(self.gpr(RAX, bits), bits) < 0;
        let value = if negative { u64::MAX } else { 0 };
        self.set_gpr(RDX, bits, value);
    }

    fn binary(&mut self, mnemonic: Mnemonic) -> Result<(), Fault> {
        let dst = self.location(0)?;
        let bits = dst.bits();
        let lhs = self.load(dst)?;
        let rhs = self.read_source(1, bits)?;
        let carry = self.machine.registers.flag(Flag::Cf);

        let (result, update) = match mnemonic {
            Mnemonic::Add => add(lhs, rhs, false, bits),
            Mnemonic::Adc => add(lhs, rhs, carry, bits),
            Mnemonic::Sub | Mnemonic::Cmp => sub(lhs, rhs, false, bits),
            Mnemonic::Sbb => sub(lhs, rhs, carry, bits),
            Mnemonic::And | Mnemonic::Test => {
                let result = lhs & rhs;
                (result, logic(result, bits))
            }
            Mnemonic::Or => {
                let result = lhs | rhs;
                (result, logic(result, bits))
            }
            _ => {
                let result = lhs ^ rhs;
                (result, logic(result, bits))
            }
        };

        if !matches!(mnemonic, Mnemonic::Cmp | Mnemonic::Test) {
            self.store(dst, result)?;
        }
        self.apply_flags(update);
        Ok(())
    }

    fn unary(&mut self, mnemonic: Mnemonic) -> Result<(), Fault> {
        let dst = self.location(0)?;
        let bits = dst.bits();
        let value = self.load(dst)?;
        let (result, update) = match mnemonic {
            Mnemonic::Inc => inc(value, bits),
            Mnemonic::Dec => dec(value, bits),
            Mnemonic::Neg => neg(value, bits),
            _ => (!value & width_mask(bits), FlagsUpdate::NONE),
        };
        self.store(dst, result)?;
        self.apply_flags(update);
        Ok(())
    }

    fn shift(&mut self, mnemonic: Mnemonic) -> Result<(), Fault> {
        let op = match mnemonic {
            Mnemonic::Shl | Mnemonic::Sal => ShiftOp::Shl,
            Mnemonic::Shr => ShiftOp::Shr,
            Mnemonic::Sar => ShiftOp::Sar,
            Mnemonic::Rol => ShiftOp::Rol,
            _ => ShiftOp::Ror,
        };
        let dst = self.location(0)?;
        let bits = dst.bits();
        let value = self.load(dst)?;
        let count = self.read_source(1, 8)?;
        let (result, update) = shift(op, value, count, bits);
        if update.mask != 0 || matches!(dst, Location::Reg(_)) {
            self.store(dst, result)?;
        }
        self.apply_flags(update);
        Ok(())
    }

    fn widening_mul(&mut self, mnemonic: Mnemonic) -> Result<(), Fault> {
        let src = self.location(0)?;
        let bits = src.bits();
        let rhs = self.load(src)?;
        let lhs = self.gpr(RAX, bits);
        let product = if mnemonic == Mnemonic::Mul {
            mul(lhs, rhs, bits)
        } else {
            imul(lhs, rhs, bits)
        };
        if bits == 8 {
            self.set_gpr(RAX, 16, product.low | (product.high << 8));
        } else {
            self.set_gpr(RAX, bits, product.low);
            self.set_gpr(RDX, bits, product.high);
        }
        self.apply_flags(product.flags);
        Ok(())
    }

    fn truncating_imul(&mut self) -> Result<(), Fault> {
        let dst = self.location(0)?;
        let bits = dst.bits();
        let (lhs, rhs) = if self.decoded.instruction.op_count() == 3 {
            (self.read_source(1, bits)?, self.read_source(2, bits)?)
        } else {
            (self.load(dst)?, self.read_source(1, bits)?)
        };
        let product = imul(lhs, rhs, bits);
        self.store(dst, product.low)?;
        self.apply_flags(product.flags);
        Ok(())
    }

    fn divide(&mut self, mnemonic: Mnemonic) -> Result<ExecuteOutcome, Fault> {
        let src = self.location(0)?;
        let bits = src.bits();
        let divisor = self.load(src)?;
        let (high, low) = if bits == 8 {
            let ax = self.gpr(RAX, 16);
            (ax >> 8, ax & 0xFF)
        } else {
            (self.gpr(RDX, bits), self.gpr(RAX, bits))
        };
        let result = if mnemonic == Mnemonic::Div {
            div(high, low, divisor, bits)
        } else {
            idiv(high, low, divisor, bits)
        };

        let Some((quotient, remainder)) = result else {
            return self.raise_interrupt(crate::mnemonic::DIVIDE_ERROR_VECTOR);
        };
        if bits == 8 {
            self.set_gpr(RAX, 16, quotient | (remainder << 8));
        } else {
            self.set_gpr(RAX, bits, quotient);
            self.set_gpr(RDX, bits, remainder);
        }
        self.advance();
        Ok(ExecuteOutcome::Retired)
    }

    fn branch_target(&mut self, operand: u32) -> Result<(u64, u8), Fault> {
        let instr = self.decoded.instruction;
        if let Some(bits) = branch_bits(instr.op_kind(operand)) {
            return Ok((instr.near_branch_target(), bits));
        }
        let location = self.location(operand)?;
        Ok((self.load(location)?, location.bits()))
    }

    fn jmp(&mut self) -> Result<ExecuteOutcome, Fault> {
        let (target, bits) = self.branch_target(0)?;
        self.machine.registers.set_rip(target & width_mask(bits));
        Ok(ExecuteOutcome::Retired)
    }

    fn jcxz(&mut self, mnemonic: Mnemonic) -> Result<ExecuteOutcome, Fault> {
        let bits = match mnemonic {
            Mnemonic::Jcxz => 16,
            Mnemonic::Jecxz => 32,
            _ => 64,
        };
        let target = if self.gpr(RCX, bits) == 0 {
            self.decoded.instruction.near_branch_target()
        } else {
            self.next_ip()
        };
        self.machine.registers.set_rip(target);
        Ok(ExecuteOutcome::Retired)
    }

    fn loop_(&mut self, mnemonic: Mnemonic) -> Result<ExecuteOutcome, Fault> {
        let bits = self.decoded.address_bits;
        let count = self.gpr(RCX, bits).wrapping_sub(1) & width_mask(bits);
        self.set_gpr(RCX, bits, count);
        let zf = self.machine.registers.flag(Flag::Zf);
        let taken = count != 0
            && match mnemonic {
                Mnemonic::Loope => zf,
                Mnemonic::Loopne => !zf,
                _ => true,
            };
        let target = if taken {
            self.decoded.instruction.near_branch_target()
        } else {
            self.next_ip()
        };
        self.machine.registers.set_rip(target);
        Ok(ExecuteOutcome::Retired)
    }

    fn call(&mut self) -> Result<ExecuteOutcome, Fault> {
        let (target, bits) = self.branch_target(0)?;
        let return_address = self.next_ip();
        self.push(return_address, bits / 8)?;
        self.machine.registers.set_rip(target & width_mask(bits));
        Ok(ExecuteOutcome::Retired)
    }

    fn ret(&mut self) -> Result<ExecuteOutcome, Fault> {
        let instr = self.decoded.instruction;
        let bits = ret_bits(instr.code()).ok_or_else(|| self.invalid())?;
        let target = self.pop(bits / 8)?;
        if instr.op_count() == 1 {
            let release = u64::from(instr.immediate16());
            let sp_slot = stack_slot(self.machine.mode());
            let sp = self.machine.registers.gpr(sp_slot).wrapping_add(release);
            self.machine.registers.set_gpr(sp_slot, sp);
        }
        self.machine.registers.set_rip(target);
        Ok(ExecuteOutcome::Retired)
    }
}
