//! Instruction fetch and decode.
//!
//! Bytes are fetched from executable memory into a 15-byte window and decoded
//! with `iced-x86`. Fetch and decode problems are reported as faults at the
//! instruction address.

use iced_x86::{DecoderError, DecoderOptions, FlowControl, Instruction, Mnemonic};

use crate::memory::{AccessKind, AddressSpace, MAX_INSTRUCTION_BYTES};
use crate::{Fault, FaultKind, Mode};

/// A decoded instruction together with its effective address size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    /// The decoded instruction; its IP is the fetch address.
    pub instruction: Instruction,
    /// Address size in bits after any `0x67` prefix.
    pub address_bits: u8,
}

impl DecodedInstruction {
    /// Address of the first instruction byte.
    #[must_use]
    pub fn address(&self) -> u64 {
        self.instruction.ip()
    }

    /// Encoded length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instruction.len()
    }

    /// Returns `true` for a zero-length instruction, which the decoder never produces.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instruction.len() == 0
    }

    /// Address of the following instruction.
    #[must_use]
    pub fn next_ip(&self) -> u64 {
        self.instruction.next_ip()
    }

    /// Instruction mnemonic.
    #[must_use]
    pub fn mnemonic(&self) -> Mnemonic {
        self.instruction.mnemonic()
    }

    /// Returns `true` when this instruction ends a basic block.
    #[must_use]
    pub fn ends_block(&self) -> bool {
        self.instruction.flow_control() != FlowControl::Next
    }
}

/// Decoded instruction or the fault raised while producing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedOrFault {
    /// Successfully decoded instruction.
    Instruction(DecodedInstruction),
    /// Fetch or decode failed.
    Fault(Fault),
}

impl DecodedOrFault {
    /// Returns the decoded instruction if decoding succeeded.
    #[must_use]
    pub const fn instruction(self) -> Option<DecodedInstruction> {
        match self {
            Self::Instruction(i) => Some(i),
            Self::Fault(_) => None,
        }
    }

    /// Returns the fault if fetch or decode failed.
    #[must_use]
    pub const fn fault(self) -> Option<Fault> {
        match self {
            Self::Instruction(_) => None,
            Self::Fault(f) => Some(f),
        }
    }
}

/// Stateless x86 decoder front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Decoder;

impl Decoder {
    /// Decodes one instruction from `bytes` located at `address`.
    ///
    /// `bytes` is the fetchable window; a truncated instruction is reported
    /// as [`DecoderError::NoMoreBytes`] by the returned error.
    ///
    /// # Errors
    ///
    /// Returns the decoder error when the bytes do not form a valid instruction.
    pub fn decode(mode: Mode, address: u64, bytes: &[u8]) -> Result<DecodedInstruction, DecoderError> {
        let mut decoder =
            iced_x86::Decoder::with_ip(mode.bitness(), bytes, address, DecoderOptions::NONE);
        let instruction = decoder.decode();
        match decoder.last_error() {
            DecoderError::None if !instruction.is_invalid() => Ok(DecodedInstruction {
                instruction,
                address_bits: address_bits(mode, bytes),
            }),
            DecoderError::None => Err(DecoderError::InvalidInstruction),
            err => Err(err),
        }
    }

    /// Fetches and decodes the instruction at `address`.
    ///
    /// Fetch faults are reported at `address` even when only a later byte of
    /// the instruction is missing or non-executable.
    #[must_use]
    pub fn fetch_and_decode(memory: &AddressSpace, mode: Mode, address: u64) -> DecodedOrFault {
        let mut window = [0u8; MAX_INSTRUCTION_BYTES];
        let fetched = match memory.fetch_window(address, &mut window) {
            Ok(len) => len,
            Err(fault) => return DecodedOrFault::Fault(fault),
        };

        match Self::decode(mode, address, &window[..fetched]) {
            Ok(decoded) => DecodedOrFault::Instruction(decoded),
            Err(DecoderError::NoMoreBytes) if fetched < MAX_INSTRUCTION_BYTES => {
                let missing = address.wrapping_add(fetched as u64);
                let kind = memory
                    .probe(missing, 1, AccessKind::Fetch)
                    .err()
                    .map_or(FaultKind::InvalidInstruction, |fault| fault.kind);
                DecodedOrFault::Fault(Fault::new(kind, address))
            }
            Err(_) => DecodedOrFault::Fault(Fault::new(FaultKind::InvalidInstruction, address)),
        }
    }

    /// Total length of the basic block starting at `address`.
    ///
    /// Decodes ahead until an instruction that changes control flow, a fetch
    /// or decode failure, or `limit` instructions.
    #[must_use]
    pub fn block_size(memory: &AddressSpace, mode: Mode, address: u64, limit: usize) -> u64 {
        let mut cursor = address;
        let mut size = 0u64;
        for _ in 0..limit {
            let Some(decoded) = Self::fetch_and_decode(memory, mode, cursor).instruction() else {
                break;
            };
            size += decoded.len() as u64;
            if decoded.ends_block() {
                break;
            }
            cursor = decoded.next_ip() & mode.address_mask();
        }
        size
    }
}

/// Effective address size, toggled by an address-size prefix.
fn address_bits(mode: Mode, bytes: &[u8]) -> u8 {
    let toggled = bytes
        .iter()
        .take_while(|&&b| {
            matches!(
                b,
                0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0x66 | 0x67 | 0xF0 | 0xF2 | 0xF3
            )
        })
        .any(|&b| b == 0x67);
    match (mode, toggled) {
        (Mode::Real16, false) | (Mode::Protected32, true) => 16,
        (Mode::Real16, true) | (Mode::Protected32, false) | (Mode::Long64, true) => 32,
        (Mode::Long64, false) => 64,
    }
}

#[cfg(test)]
mod tests {
    use super::{address_bits, Decoder, DecodedOrFault};
    use crate::memory::{AddressSpace, Permissions};
    use crate::{Fault, FaultKind, Mode};
    use iced_x86::Mnemonic;
    use rstest::rstest;

    fn code_space(code: &[u8]) -> AddressSpace {
        let mut mem = AddressSpace::default();
        mem.map(0x1000, 0x1000, Permissions::ALL).unwrap();
        mem.host_write(0x1000, code).unwrap();
        mem
    }

    #[test]
    fn decodes_inc_ecx_in_32_bit_mode() {
        let mem = code_space(&[0x41, 0x4A]);
        let decoded = Decoder::fetch_and_decode(&mem, Mode::Protected32, 0x1000)
            .instruction()
            .unwrap();
        assert_eq!(decoded.mnemonic(), Mnemonic::Inc);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.next_ip(), 0x1001);
        assert_eq!(decoded.address_bits, 32);
    }

    #[test]
    fn same_byte_is_a_rex_prefix_in_long_mode() {
        let mem = code_space(&[0x41, 0x4A, 0x90]);
        let decoded = Decoder::fetch_and_decode(&mem, Mode::Long64, 0x1000)
            .instruction()
            .unwrap();
        assert_ne!(decoded.mnemonic(), Mnemonic::Inc);
    }

    #[test]
    fn unmapped_fetch_faults_at_pc() {
        let mem = code_space(&[]);
        assert_eq!(
            Decoder::fetch_and_decode(&mem, Mode::Protected32, 0x8000),
            DecodedOrFault::Fault(Fault::new(FaultKind::FetchUnmapped, 0x8000))
        );
    }

    #[test]
    fn non_executable_fetch_faults_at_pc() {
        let mut mem = AddressSpace::default();
        mem.map(0x1000, 0x1000, Permissions::READ).unwrap();
        assert_eq!(
            Decoder::fetch_and_decode(&mem, Mode::Protected32, 0x1000).fault(),
            Some(Fault::new(FaultKind::FetchProtected, 0x1000))
        );
    }

    #[test]
    fn truncated_instruction_faults_at_pc_with_kind_of_missing_byte() {
        let mut mem = AddressSpace::default();
        mem.map(0x1000, 0x1000, Permissions::ALL).unwrap();
        // mov ecx, [imm32] with only three bytes before the end of the mapping
        mem.host_write(0x1FFD, &[0x8B, 0x0D, 0xAA]).unwrap();
        assert_eq!(
            Decoder::fetch_and_decode(&mem, Mode::Protected32, 0x1FFD).fault(),
            Some(Fault::new(FaultKind::FetchUnmapped, 0x1FFD))
        );

        mem.map(0x2000, 0x1000, Permissions::READ).unwrap();
        assert_eq!(
            Decoder::fetch_and_decode(&mem, Mode::Protected32, 0x1FFD).fault(),
            Some(Fault::new(FaultKind::FetchProtected, 0x1FFD))
        );
    }

    #[test]
    fn undefined_opcode_is_an_invalid_instruction() {
        // 0F 04 is a reserved two-byte opcode
        let mem = code_space(&[0x0F, 0x04]);
        assert_eq!(
            Decoder::fetch_and_decode(&mem, Mode::Protected32, 0x1000).fault(),
            Some(Fault::new(FaultKind::InvalidInstruction, 0x1000))
        );
    }

    #[test]
    fn block_size_stops_after_control_transfer() {
        // inc ecx; dec edx; jmp $; nop
        let mem = code_space(&[0x41, 0x4A, 0xEB, 0xFE, 0x90]);
        assert_eq!(Decoder::block_size(&mem, Mode::Protected32, 0x1000, 64), 4);
        assert_eq!(Decoder::block_size(&mem, Mode::Protected32, 0x1000, 1), 1);
    }

    #[rstest]
    #[case(Mode::Real16, &[0x90], 16)]
    #[case(Mode::Real16, &[0x67, 0x90], 32)]
    #[case(Mode::Protected32, &[0x66, 0x67, 0x90], 16)]
    #[case(Mode::Long64, &[0x90], 64)]
    #[case(Mode::Long64, &[0x67, 0x48, 0x90], 32)]
    fn address_size_prefix_toggles_width(
        #[case] mode: Mode,
        #[case] bytes: &[u8],
        #[case] bits: u8,
    ) {
        assert_eq!(address_bits(mode, bytes), bits);
    }
}
