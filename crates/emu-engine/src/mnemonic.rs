//! Classification of decoded mnemonics into hookable instruction classes.

use iced_x86::Mnemonic;

/// Instructions whose effect can be supplied by an instruction hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum HookableInsn {
    /// `IN` port read.
    In,
    /// `OUT` port write.
    Out,
    /// `SYSCALL`.
    Syscall,
    /// `SYSENTER`.
    Sysenter,
    /// `CPUID`.
    Cpuid,
}

impl HookableInsn {
    /// Every hookable instruction class.
    pub const ALL: [Self; 5] = [Self::In, Self::Out, Self::Syscall, Self::Sysenter, Self::Cpuid];

    /// Classifies a decoded mnemonic.
    #[must_use]
    pub const fn classify(mnemonic: Mnemonic) -> Option<Self> {
        match mnemonic {
            Mnemonic::In => Some(Self::In),
            Mnemonic::Out => Some(Self::Out),
            Mnemonic::Syscall => Some(Self::Syscall),
            Mnemonic::Sysenter => Some(Self::Sysenter),
            Mnemonic::Cpuid => Some(Self::Cpuid),
            _ => None,
        }
    }

    /// Lowercase assembler name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
            Self::Syscall => "syscall",
            Self::Sysenter => "sysenter",
            Self::Cpuid => "cpuid",
        }
    }
}

/// Software interrupt instructions delivered to interrupt hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterruptInsn {
    /// `INT imm8`.
    Int,
    /// `INT1` / `ICEBP`.
    Int1,
    /// `INT3`.
    Int3,
    /// `INTO`, taken only when OF is set.
    Into,
}

impl InterruptInsn {
    /// Classifies a decoded mnemonic.
    #[must_use]
    pub const fn classify(mnemonic: Mnemonic) -> Option<Self> {
        match mnemonic {
            Mnemonic::Int => Some(Self::Int),
            Mnemonic::Int1 => Some(Self::Int1),
            Mnemonic::Int3 => Some(Self::Int3),
            Mnemonic::Into => Some(Self::Into),
            _ => None,
        }
    }

    /// Fixed vector, or `None` for `INT imm8` whose vector is the immediate.
    #[must_use]
    pub const fn fixed_vector(self) -> Option<u32> {
        match self {
            Self::Int => None,
            Self::Int1 => Some(1),
            Self::Int3 => Some(3),
            Self::Into => Some(4),
        }
    }
}

/// Vector raised by a divide error.
pub const DIVIDE_ERROR_VECTOR: u32 = 0;

#[cfg(test)]
mod tests {
    use super::{HookableInsn, InterruptInsn};
    use iced_x86::Mnemonic;
    use rstest::rstest;

    #[rstest]
    #[case(Mnemonic::In, Some(HookableInsn::In))]
    #[case(Mnemonic::Out, Some(HookableInsn::Out))]
    #[case(Mnemonic::Syscall, Some(HookableInsn::Syscall))]
    #[case(Mnemonic::Sysenter, Some(HookableInsn::Sysenter))]
    #[case(Mnemonic::Cpuid, Some(HookableInsn::Cpuid))]
    #[case(Mnemonic::Mov, None)]
    #[case(Mnemonic::Insb, None)]
    fn hookable_classification(#[case] mnemonic: Mnemonic, #[case] class: Option<HookableInsn>) {
        assert_eq!(HookableInsn::classify(mnemonic), class);
    }

    #[test]
    fn names_are_unique() {
        let mut names: Vec<_> = HookableInsn::ALL.iter().map(|i| i.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), HookableInsn::ALL.len());
    }

    #[test]
    fn interrupt_vectors() {
        assert_eq!(InterruptInsn::classify(Mnemonic::Int3), Some(InterruptInsn::Int3));
        assert_eq!(InterruptInsn::Int3.fixed_vector(), Some(3));
        assert_eq!(InterruptInsn::Int.fixed_vector(), None);
        assert_eq!(InterruptInsn::classify(Mnemonic::Iret), None);
    }
}
