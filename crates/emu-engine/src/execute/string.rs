//! `MOVS`, `STOS` and `LODS` with optional `REP`.

use iced_x86::Mnemonic;

use super::helpers::{is_string_form, slot, RAX, RCX, RDI, RSI};
use super::Executor;
use crate::state::{width_mask, Flag};
use crate::Fault;

#[derive(Clone, Copy, PartialEq, Eq)]
enum StringOp {
    Movs,
    Stos,
    Lods,
}

impl Executor<'_> {
    pub(super) fn string(&mut self, mnemonic: Mnemonic) -> Result<(), Fault> {
        let instr = self.decoded.instruction;
        let (op, size) = match mnemonic {
            Mnemonic::Movsb => (StringOp::Movs, 1),
            Mnemonic::Movsw => (StringOp::Movs, 2),
            // SSE MOVSD shares the mnemonic; only the string form is accepted.
            Mnemonic::Movsd if is_string_form(&instr) => (StringOp::Movs, 4),
            Mnemonic::Movsq => (StringOp::Movs, 8),
            Mnemonic::Stosb => (StringOp::Stos, 1),
            Mnemonic::Stosw => (StringOp::Stos, 2),
            Mnemonic::Stosd => (StringOp::Stos, 4),
            Mnemonic::Stosq => (StringOp::Stos, 8),
            Mnemonic::Lodsb => (StringOp::Lods, 1),
            Mnemonic::Lodsw => (StringOp::Lods, 2),
            Mnemonic::Lodsd => (StringOp::Lods, 4),
            Mnemonic::Lodsq => (StringOp::Lods, 8),
            _ => return Err(self.invalid()),
        };

        let address_bits = self.decoded.address_bits;
        if !instr.has_rep_prefix() {
            return self.string_step(op, size, address_bits);
        }
        loop {
            if self.gpr(RCX, address_bits) == 0 {
                return Ok(());
            }
            self.string_step(op, size, address_bits)?;
            let count = self.gpr(RCX, address_bits).wrapping_sub(1);
            self.set_gpr(RCX, address_bits, count);
        }
    }

    fn string_step(&mut self, op: StringOp, size: u8, address_bits: u8) -> Result<(), Fault> {
        let step = if self.machine.registers.flag(Flag::Df) {
            u64::from(size).wrapping_neg()
        } else {
            u64::from(size)
        };
        let addr_mask = width_mask(address_bits);
        let mode_mask = self.machine.mode().address_mask();
        let source_base = self
            .machine
            .registers
            .segment_base(self.decoded.instruction.memory_segment());
        let si = self.gpr(RSI, address_bits);
        let di = self.gpr(RDI, address_bits);
        let bits = size * 8;

        match op {
            StringOp::Movs => {
                let value = self.mem_read(si.wrapping_add(source_base) & mode_mask, size)?;
                self.mem_write(di & mode_mask, size, value)?;
                self.set_gpr(RSI, address_bits, si.wrapping_add(step) & addr_mask);
                self.set_gpr(RDI, address_bits, di.wrapping_add(step) & addr_mask);
            }
            StringOp::Stos => {
                let value = self.machine.registers.gpr(slot(RAX, bits));
                self.mem_write(di & mode_mask, size, value)?;
                self.set_gpr(RDI, address_bits, di.wrapping_add(step) & addr_mask);
            }
            StringOp::Lods => {
                let value = self.mem_read(si.wrapping_add(source_base) & mode_mask, size)?;
                self.set_gpr(RAX, bits, value);
                self.set_gpr(RSI, address_bits, si.wrapping_add(step) & addr_mask);
            }
        }
        Ok(())
    }
}
