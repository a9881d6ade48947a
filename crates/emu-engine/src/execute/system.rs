//! Port I/O, system calls, `CPUID`, software interrupts and `RDTSC`.
//!
//! The program counter already points past the instruction when a hook runs,
//! so hooks may redirect it.

use iced_x86::{Mnemonic, OpKind};

use super::helpers::{slot, RAX, RDX};
use super::{ExecuteOutcome, Executor};
use crate::mnemonic::{HookableInsn, InterruptInsn};
use crate::state::{Flag, Register};
use crate::{Fault, FaultKind};

/// Vendor string reported by the built-in `CPUID` leaf 0, as `EBX`, `EDX`, `ECX`.
const CPUID_VENDOR: [u8; 12] = *b"EmuEngineX86";

/// Highest standard leaf answered by the built-in `CPUID`.
const CPUID_MAX_LEAF: u64 = 1;

impl Executor<'_> {
    pub(super) fn system(&mut self, mnemonic: Mnemonic) -> Result<ExecuteOutcome, Fault> {
        if let Some(interrupt) = InterruptInsn::classify(mnemonic) {
            return self.software_interrupt(interrupt);
        }
        match HookableInsn::classify(mnemonic) {
            Some(HookableInsn::In) => self.port_in()?,
            Some(HookableInsn::Out) => self.port_out()?,
            Some(insn @ (HookableInsn::Syscall | HookableInsn::Sysenter)) => {
                self.advance();
                self.hooks.dispatch_insn(self.machine, self.decoded.address(), insn);
            }
            Some(HookableInsn::Cpuid) => {
                self.advance();
                if !self
                    .hooks
                    .dispatch_insn(self.machine, self.decoded.address(), HookableInsn::Cpuid)
                {
                    self.builtin_cpuid();
                }
            }
            None if mnemonic == Mnemonic::Rdtsc => {
                let tsc = self.machine.stats.instructions;
                self.set_gpr(RAX, 32, tsc & 0xFFFF_FFFF);
                self.set_gpr(RDX, 32, tsc >> 32);
                self.advance();
            }
            None => return Err(self.invalid()),
        }
        Ok(ExecuteOutcome::Retired)
    }

    fn port_number(&self, operand: u32) -> Result<u16, Fault> {
        let instr = &self.decoded.instruction;
        match instr.op_kind(operand) {
            OpKind::Immediate8 => Ok(u16::from(instr.immediate8())),
            OpKind::Register => Ok(self.gpr(RDX, 16) as u16),
            _ => Err(self.invalid()),
        }
    }

    fn port_in(&mut self) -> Result<(), Fault> {
        let instr = self.decoded.instruction;
        let dst = Register::gpr_slot(instr.op0_register()).ok_or_else(|| self.invalid())?;
        let port = self.port_number(1)?;
        let size = usize::from(dst.bits / 8);
        self.advance();
        let value = self
            .hooks
            .dispatch_in(self.machine, self.decoded.address(), port, size)
            .unwrap_or(0);
        self.machine.registers.set_gpr(dst, u64::from(value));
        Ok(())
    }

    fn port_out(&mut self) -> Result<(), Fault> {
        let instr = self.decoded.instruction;
        let src = Register::gpr_slot(instr.op1_register()).ok_or_else(|| self.invalid())?;
        let port = self.port_number(0)?;
        let value = self.machine.registers.gpr(src) as u32;
        self.advance();
        self.hooks.dispatch_out(
            self.machine,
            self.decoded.address(),
            port,
            usize::from(src.bits / 8),
            value,
        );
        Ok(())
    }

    fn builtin_cpuid(&mut self) {
        let leaf = self.gpr(RAX, 32);
        let word = |i: usize| {
            u64::from(u32::from_le_bytes([
                CPUID_VENDOR[i],
                CPUID_VENDOR[i + 1],
                CPUID_VENDOR[i + 2],
                CPUID_VENDOR[i + 3],
            ]))
        };
        let (eax, ebx, ecx, edx) = if leaf == 0 {
            (CPUID_MAX_LEAF, word(0), word(8), word(4))
        } else {
            (0, 0, 0, 0)
        };
        self.machine.registers.set_gpr(slot(RAX, 32), eax);
        self.machine.registers.set_gpr(slot(3, 32), ebx);
        self.machine.registers.set_gpr(slot(1, 32), ecx);
        self.machine.registers.set_gpr(slot(RDX, 32), edx);
    }

    fn software_interrupt(&mut self, interrupt: InterruptInsn) -> Result<ExecuteOutcome, Fault> {
        if interrupt == InterruptInsn::Into && !self.machine.registers.flag(Flag::Of) {
            self.advance();
            return Ok(ExecuteOutcome::Retired);
        }
        let vector = interrupt
            .fixed_vector()
            .unwrap_or_else(|| u32::from(self.decoded.instruction.immediate8()));
        self.raise_interrupt(vector)
    }

    /// Delivers `vector` to interrupt hooks; without one the run faults.
    pub(super) fn raise_interrupt(&mut self, vector: u32) -> Result<ExecuteOutcome, Fault> {
        let pc = self.decoded.address();
        self.advance();
        if self.hooks.dispatch_interrupt(self.machine, pc, vector) {
            Ok(ExecuteOutcome::Retired)
        } else {
            Err(Fault::new(FaultKind::UnhandledInterrupt, pc))
        }
    }
}
