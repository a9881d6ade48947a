use crate::{EngineError, Mode};

/// Number of architectural general-purpose registers in 64-bit mode (`RAX..R15`).
pub const GENERAL_REGISTER_COUNT: usize = 16;
/// Number of segment selector registers (`ES, CS, SS, DS, FS, GS`).
pub const SEGMENT_REGISTER_COUNT: usize = 6;

/// `RFLAGS` carry flag.
pub const FLAG_CF: u64 = 1 << 0;
/// `RFLAGS` reserved bit 1, always reads as set.
pub const FLAG_FIXED: u64 = 1 << 1;
/// `RFLAGS` parity flag.
pub const FLAG_PF: u64 = 1 << 2;
/// `RFLAGS` auxiliary carry flag.
pub const FLAG_AF: u64 = 1 << 4;
/// `RFLAGS` zero flag.
pub const FLAG_ZF: u64 = 1 << 6;
/// `RFLAGS` sign flag.
pub const FLAG_SF: u64 = 1 << 7;
/// `RFLAGS` trap flag.
pub const FLAG_TF: u64 = 1 << 8;
/// `RFLAGS` interrupt enable flag.
pub const FLAG_IF: u64 = 1 << 9;
/// `RFLAGS` direction flag.
pub const FLAG_DF: u64 = 1 << 10;
/// `RFLAGS` overflow flag.
pub const FLAG_OF: u64 = 1 << 11;
/// Arithmetic status flags written by ALU instructions.
pub const FLAGS_STATUS_MASK: u64 = FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_OF;
/// Mask of `RFLAGS` bits stored by the register file.
pub const FLAGS_ACTIVE_MASK: u64 = FLAGS_STATUS_MASK | FLAG_FIXED | FLAG_TF | FLAG_IF | FLAG_DF;

/// Individual `RFLAGS` bits addressable by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Flag {
    Cf,
    Pf,
    Af,
    Zf,
    Sf,
    Tf,
    If,
    Df,
    Of,
}

impl Flag {
    /// Returns the `RFLAGS` bit mask for this flag.
    #[must_use]
    pub const fn mask(self) -> u64 {
        match self {
            Self::Cf => FLAG_CF,
            Self::Pf => FLAG_PF,
            Self::Af => FLAG_AF,
            Self::Zf => FLAG_ZF,
            Self::Sf => FLAG_SF,
            Self::Tf => FLAG_TF,
            Self::If => FLAG_IF,
            Self::Df => FLAG_DF,
            Self::Of => FLAG_OF,
        }
    }
}

/// Location of a general-purpose register view inside the 64-bit register bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GprSlot {
    /// Physical register index (`0 = RAX .. 15 = R15`).
    pub index: u8,
    /// Bit offset of the view (8 for `AH/CH/DH/BH`, otherwise 0).
    pub shift: u8,
    /// View width in bits.
    pub bits: u8,
}

impl GprSlot {
    /// Creates a slot descriptor.
    #[must_use]
    pub const fn new(index: u8, shift: u8, bits: u8) -> Self {
        Self { index, shift, bits }
    }

    /// Full 64-bit view of physical register `index`.
    #[must_use]
    pub const fn full(index: u8) -> Self {
        Self::new(index, 0, 64)
    }

    /// Value mask for the view width, unshifted.
    #[must_use]
    pub const fn value_mask(self) -> u64 {
        width_mask(self.bits)
    }
}

/// Returns the all-ones mask for a 8/16/32/64-bit width.
#[must_use]
pub const fn width_mask(bits: u8) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

macro_rules! registers {
    ($($variant:ident = $id:literal => $name:literal,)*) => {
        /// Register identifiers exposed to hosts and bindings.
        ///
        /// Identifier values are stable and used by the handle-based binding
        /// surface.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u16)]
        #[allow(missing_docs)]
        pub enum Register {
            $($variant = $id,)*
        }

        impl Register {
            /// Every register identifier in ascending id order.
            pub const ALL: &'static [Self] = &[$(Self::$variant,)*];

            /// Converts a stable numeric identifier into a register.
            #[must_use]
            pub const fn from_id(id: u16) -> Option<Self> {
                match id {
                    $($id => Some(Self::$variant),)*
                    _ => None,
                }
            }

            /// Lower-case assembler name of this register.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }
        }
    };
}

registers! {
    Al = 1 => "al",
    Cl = 2 => "cl",
    Dl = 3 => "dl",
    Bl = 4 => "bl",
    Ah = 5 => "ah",
    Ch = 6 => "ch",
    Dh = 7 => "dh",
    Bh = 8 => "bh",
    Spl = 9 => "spl",
    Bpl = 10 => "bpl",
    Sil = 11 => "sil",
    Dil = 12 => "dil",
    R8b = 13 => "r8b",
    R9b = 14 => "r9b",
    R10b = 15 => "r10b",
    R11b = 16 => "r11b",
    R12b = 17 => "r12b",
    R13b = 18 => "r13b",
    R14b = 19 => "r14b",
    R15b = 20 => "r15b",
    Ax = 21 => "ax",
    Cx = 22 => "cx",
    Dx = 23 => "dx",
    Bx = 24 => "bx",
    Sp = 25 => "sp",
    Bp = 26 => "bp",
    Si = 27 => "si",
    Di = 28 => "di",
    R8w = 29 => "r8w",
    R9w = 30 => "r9w",
    R10w = 31 => "r10w",
    R11w = 32 => "r11w",
    R12w = 33 => "r12w",
    R13w = 34 => "r13w",
    R14w = 35 => "r14w",
    R15w = 36 => "r15w",
    Eax = 37 => "eax",
    Ecx = 38 => "ecx",
    Edx = 39 => "edx",
    Ebx = 40 => "ebx",
    Esp = 41 => "esp",
    Ebp = 42 => "ebp",
    Esi = 43 => "esi",
    Edi = 44 => "edi",
    R8d = 45 => "r8d",
    R9d = 46 => "r9d",
    R10d = 47 => "r10d",
    R11d = 48 => "r11d",
    R12d = 49 => "r12d",
    R13d = 50 => "r13d",
    R14d = 51 => "r14d",
    R15d = 52 => "r15d",
    Rax = 53 => "rax",
    Rcx = 54 => "rcx",
    Rdx = 55 => "rdx",
    Rbx = 56 => "rbx",
    Rsp = 57 => "rsp",
    Rbp = 58 => "rbp",
    Rsi = 59 => "rsi",
    Rdi = 60 => "rdi",
    R8 = 61 => "r8",
    R9 = 62 => "r9",
    R10 = 63 => "r10",
    R11 = 64 => "r11",
    R12 = 65 => "r12",
    R13 = 66 => "r13",
    R14 = 67 => "r14",
    R15 = 68 => "r15",
    Ip = 69 => "ip",
    Eip = 70 => "eip",
    Rip = 71 => "rip",
    Flags = 72 => "flags",
    Eflags = 73 => "eflags",
    Rflags = 74 => "rflags",
    Es = 75 => "es",
    Cs = 76 => "cs",
    Ss = 77 => "ss",
    Ds = 78 => "ds",
    Fs = 79 => "fs",
    Gs = 80 => "gs",
    FsBase = 81 => "fs_base",
    GsBase = 82 => "gs_base",
}

/// Storage location addressed by a [`Register`] identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterView {
    /// General-purpose register view.
    Gpr(GprSlot),
    /// Instruction pointer view of the given width.
    Ip {
        /// View width in bits.
        bits: u8,
    },
    /// Flags register view of the given width.
    Flags {
        /// View width in bits.
        bits: u8,
    },
    /// Segment selector by index (`ES, CS, SS, DS, FS, GS`).
    Segment(u8),
    /// `FS` segment base.
    FsBase,
    /// `GS` segment base.
    GsBase,
}

impl Register {
    /// Returns the stable numeric identifier.
    #[must_use]
    pub const fn id(self) -> u16 {
        self as u16
    }

    /// Resolves this identifier to its storage location.
    #[must_use]
    pub const fn view(self) -> RegisterView {
        let id = self as u16;
        match id {
            // AL..BL
            1..=4 => RegisterView::Gpr(GprSlot::new((id - 1) as u8, 0, 8)),
            // AH..BH alias bits 8..16 of RAX..RBX.
            5..=8 => RegisterView::Gpr(GprSlot::new((id - 5) as u8, 8, 8)),
            // SPL..DIL, R8B..R15B
            9..=20 => RegisterView::Gpr(GprSlot::new((id - 5) as u8, 0, 8)),
            21..=36 => RegisterView::Gpr(GprSlot::new((id - 21) as u8, 0, 16)),
            37..=52 => RegisterView::Gpr(GprSlot::new((id - 37) as u8, 0, 32)),
            53..=68 => RegisterView::Gpr(GprSlot::new((id - 53) as u8, 0, 64)),
            69 => RegisterView::Ip { bits: 16 },
            70 => RegisterView::Ip { bits: 32 },
            71 => RegisterView::Ip { bits: 64 },
            72 => RegisterView::Flags { bits: 16 },
            73 => RegisterView::Flags { bits: 32 },
            74 => RegisterView::Flags { bits: 64 },
            75..=80 => RegisterView::Segment((id - 75) as u8),
            81 => RegisterView::FsBase,
            _ => RegisterView::GsBase,
        }
    }

    /// Returns `true` when this identifier only exists in 64-bit mode.
    #[must_use]
    pub const fn requires_long_mode(self) -> bool {
        match self.view() {
            RegisterView::Gpr(slot) => {
                slot.bits == 64 || slot.index >= 8 || (slot.bits == 8 && slot.index >= 4)
            }
            RegisterView::Ip { bits } | RegisterView::Flags { bits } => bits == 64,
            RegisterView::Segment(_) | RegisterView::FsBase | RegisterView::GsBase => false,
        }
    }

    /// Maps a decoder register onto a general-purpose slot.
    ///
    /// Returns `None` for anything that is not an integer GPR view.
    #[must_use]
    pub fn gpr_slot(reg: iced_x86::Register) -> Option<GprSlot> {
        use iced_x86::Register as R;

        // (index, shift, bits)
        let (index, shift, bits) = match reg {
            R::AL => (0, 0, 8),
            R::CL => (1, 0, 8),
            R::DL => (2, 0, 8),
            R::BL => (3, 0, 8),
            R::AH => (0, 8, 8),
            R::CH => (1, 8, 8),
            R::DH => (2, 8, 8),
            R::BH => (3, 8, 8),
            R::SPL => (4, 0, 8),
            R::BPL => (5, 0, 8),
            R::SIL => (6, 0, 8),
            R::DIL => (7, 0, 8),
            R::R8L => (8, 0, 8),
            R::R9L => (9, 0, 8),
            R::R10L => (10, 0, 8),
            R::R11L => (11, 0, 8),
            R::R12L => (12, 0, 8),
            R::R13L => (13, 0, 8),
            R::R14L => (14, 0, 8),
            R::R15L => (15, 0, 8),

            R::AX => (0, 0, 16),
            R::CX => (1, 0, 16),
            R::DX => (2, 0, 16),
            R::BX => (3, 0, 16),
            R::SP => (4, 0, 16),
            R::BP => (5, 0, 16),
            R::SI => (6, 0, 16),
            R::DI => (7, 0, 16),
            R::R8W => (8, 0, 16),
            R::R9W => (9, 0, 16),
            R::R10W => (10, 0, 16),
            R::R11W => (11, 0, 16),
            R::R12W => (12, 0, 16),
            R::R13W => (13, 0, 16),
            R::R14W => (14, 0, 16),
            R::R15W => (15, 0, 16),

            R::EAX => (0, 0, 32),
            R::ECX => (1, 0, 32),
            R::EDX => (2, 0, 32),
            R::EBX => (3, 0, 32),
            R::ESP => (4, 0, 32),
            R::EBP => (5, 0, 32),
            R::ESI => (6, 0, 32),
            R::EDI => (7, 0, 32),
            R::R8D => (8, 0, 32),
            R::R9D => (9, 0, 32),
            R::R10D => (10, 0, 32),
            R::R11D => (11, 0, 32),
            R::R12D => (12, 0, 32),
            R::R13D => (13, 0, 32),
            R::R14D => (14, 0, 32),
            R::R15D => (15, 0, 32),

            R::RAX => (0, 0, 64),
            R::RCX => (1, 0, 64),
            R::RDX => (2, 0, 64),
            R::RBX => (3, 0, 64),
            R::RSP => (4, 0, 64),
            R::RBP => (5, 0, 64),
            R::RSI => (6, 0, 64),
            R::RDI => (7, 0, 64),
            R::R8 => (8, 0, 64),
            R::R9 => (9, 0, 64),
            R::R10 => (10, 0, 64),
            R::R11 => (11, 0, 64),
            R::R12 => (12, 0, 64),
            R::R13 => (13, 0, 64),
            R::R14 => (14, 0, 64),
            R::R15 => (15, 0, 64),
            _ => return None,
        };
        Some(GprSlot::new(index, shift, bits))
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Register {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|reg| reg.name() == lower)
            .ok_or(EngineError::InvalidArgument("unknown register name"))
    }
}

impl TryFrom<u16> for Register {
    type Error = EngineError;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        Self::from_id(id).ok_or(EngineError::InvalidArgument("unknown register identifier"))
    }
}

/// Architectural x86 register bank for one emulation context.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RegisterFile {
    mode: Mode,
    gpr: [u64; GENERAL_REGISTER_COUNT],
    rip: u64,
    rflags: u64,
    segments: [u16; SEGMENT_REGISTER_COUNT],
    fs_base: u64,
    gs_base: u64,
}

impl RegisterFile {
    /// Creates a zeroed register bank for `mode`.
    #[must_use]
    pub const fn new(mode: Mode) -> Self {
        Self {
            mode,
            gpr: [0; GENERAL_REGISTER_COUNT],
            rip: 0,
            rflags: FLAG_FIXED,
            segments: [0; SEGMENT_REGISTER_COUNT],
            fs_base: 0,
            gs_base: 0,
        }
    }

    /// Mode this bank was created for.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Reads a register by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] when the identifier does not
    /// exist in the current mode.
    pub fn read(&self, reg: Register) -> Result<u64, EngineError> {
        self.check_available(reg)?;
        Ok(match reg.view() {
            RegisterView::Gpr(slot) => self.gpr(slot),
            RegisterView::Ip { bits } => self.rip & width_mask(bits),
            RegisterView::Flags { bits } => self.rflags & width_mask(bits),
            RegisterView::Segment(index) => u64::from(self.segments[usize::from(index)]),
            RegisterView::FsBase => self.fs_base,
            RegisterView::GsBase => self.gs_base,
        })
    }

    /// Writes a register by identifier using x86 width rules.
    ///
    /// 32-bit views zero-extend into the full register; 8- and 16-bit views
    /// preserve the remaining bits.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] when the identifier does not
    /// exist in the current mode.
    pub fn write(&mut self, reg: Register, value: u64) -> Result<(), EngineError> {
        self.check_available(reg)?;
        match reg.view() {
            RegisterView::Gpr(slot) => self.set_gpr(slot, value),
            RegisterView::Ip { bits } => {
                let merged = merge_width(self.rip, value, bits);
                self.set_rip(merged);
            }
            RegisterView::Flags { bits } => {
                let merged = merge_width(self.rflags, value, bits);
                self.set_rflags(merged);
            }
            RegisterView::Segment(index) => {
                self.segments[usize::from(index)] = value as u16;
            }
            RegisterView::FsBase => self.fs_base = value,
            RegisterView::GsBase => self.gs_base = value,
        }
        Ok(())
    }

    fn check_available(&self, reg: Register) -> Result<(), EngineError> {
        if reg.requires_long_mode() && self.mode != Mode::Long64 {
            return Err(EngineError::InvalidArgument(
                "register is not available in this mode",
            ));
        }
        Ok(())
    }

    /// Reads a general-purpose register view.
    #[must_use]
    pub const fn gpr(&self, slot: GprSlot) -> u64 {
        (self.gpr[slot.index as usize] >> slot.shift) & slot.value_mask()
    }

    /// Writes a general-purpose register view.
    pub const fn set_gpr(&mut self, slot: GprSlot, value: u64) {
        let index = slot.index as usize;
        if slot.bits == 32 {
            // 32-bit destinations clear bits 32..64.
            self.gpr[index] = value & 0xFFFF_FFFF;
        } else {
            let mask = slot.value_mask() << slot.shift;
            self.gpr[index] = (self.gpr[index] & !mask) | ((value << slot.shift) & mask);
        }
    }

    /// Reads the full 64-bit value of physical register `index`.
    #[must_use]
    pub const fn gpr64(&self, index: u8) -> u64 {
        self.gpr[index as usize]
    }

    /// Writes the full 64-bit value of physical register `index`.
    pub const fn set_gpr64(&mut self, index: u8, value: u64) {
        self.gpr[index as usize] = value;
    }

    /// Instruction pointer.
    #[must_use]
    pub const fn rip(&self) -> u64 {
        self.rip
    }

    /// Sets the instruction pointer, truncated to the mode's width.
    pub const fn set_rip(&mut self, value: u64) {
        self.rip = value & self.mode.address_mask();
    }

    /// Flags register with the fixed bit set.
    #[must_use]
    pub const fn rflags(&self) -> u64 {
        self.rflags
    }

    /// Writes the flags register; only active bits are stored.
    pub const fn set_rflags(&mut self, value: u64) {
        self.rflags = (value & FLAGS_ACTIVE_MASK) | FLAG_FIXED;
    }

    /// Returns `true` when `flag` is set.
    #[must_use]
    pub const fn flag(&self, flag: Flag) -> bool {
        self.rflags & flag.mask() != 0
    }

    /// Sets or clears a single flag.
    pub const fn set_flag(&mut self, flag: Flag, enabled: bool) {
        if enabled {
            self.rflags |= flag.mask();
        } else {
            self.rflags &= !flag.mask();
        }
    }

    /// Replaces the arithmetic status flags selected by `mask` with `status`.
    pub const fn update_status_flags(&mut self, mask: u64, status: u64) {
        let mask = mask & FLAGS_STATUS_MASK;
        self.rflags = (self.rflags & !mask) | (status & mask);
    }

    /// Segment base applied to a memory operand; flat except `FS`/`GS` in 64-bit mode.
    #[must_use]
    pub fn segment_base(&self, segment: iced_x86::Register) -> u64 {
        if self.mode != Mode::Long64 {
            return 0;
        }
        match segment {
            iced_x86::Register::FS => self.fs_base,
            iced_x86::Register::GS => self.gs_base,
            _ => 0,
        }
    }
}

const fn merge_width(old: u64, value: u64, bits: u8) -> u64 {
    if bits == 16 {
        (old & !0xFFFF) | (value & 0xFFFF)
    } else {
        value & width_mask(bits)
    }
}
