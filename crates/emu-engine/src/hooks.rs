//! Hook registry and dispatcher.
//!
//! Callbacks are stored in registration order as a tagged union keyed by
//! event class. Every callback receives the mutable [`Machine`] so it can read
//! and modify registers and memory or request a stop.

use std::fmt;

use tracing::debug;

use crate::{AccessKind, EngineError, HookableInsn, Machine};

/// Code and block hooks: `(machine, address, size)`.
pub type CodeCallback = Box<dyn FnMut(&mut Machine, u64, usize) + Send>;
/// Memory read hooks: `(machine, address, size)`.
pub type MemReadCallback = Box<dyn FnMut(&mut Machine, u64, usize) + Send>;
/// Memory write hooks: `(machine, address, size, value)`.
pub type MemWriteCallback = Box<dyn FnMut(&mut Machine, u64, usize, u64) + Send>;
/// Invalid-access hooks: `(machine, access, address, size, value)`; `true` retries once.
pub type MemFaultCallback = Box<dyn FnMut(&mut Machine, AccessKind, u64, usize, u64) -> bool + Send>;
/// Interrupt hooks: `(machine, vector)`.
pub type InterruptCallback = Box<dyn FnMut(&mut Machine, u32) + Send>;
/// `IN` hooks: `(machine, port, size)` returning the value read.
pub type InCallback = Box<dyn FnMut(&mut Machine, u16, usize) -> u32 + Send>;
/// `OUT` hooks: `(machine, port, size, value)`.
pub type OutCallback = Box<dyn FnMut(&mut Machine, u16, usize, u32) + Send>;
/// `SYSCALL`, `SYSENTER` and `CPUID` hooks.
pub type InsnCallback = Box<dyn FnMut(&mut Machine) + Send>;

/// A typed hook callback.
pub enum Hook {
    /// Before each instruction executes.
    Code(CodeCallback),
    /// On entry to each basic block.
    Block(CodeCallback),
    /// Before a guest read is performed.
    MemRead(MemReadCallback),
    /// Before a guest write is performed.
    MemWrite(MemWriteCallback),
    /// On an invalid guest access, before the fault is raised.
    MemFault(MemFaultCallback),
    /// On `INT n`, `INT3`, `INT1`, `INTO` and divide errors.
    Interrupt(InterruptCallback),
    /// Supplies the value of an `IN` instruction.
    In(InCallback),
    /// Receives the value of an `OUT` instruction.
    Out(OutCallback),
    /// Replaces `SYSCALL`.
    Syscall(InsnCallback),
    /// Replaces `SYSENTER`.
    Sysenter(InsnCallback),
    /// Replaces `CPUID`.
    Cpuid(InsnCallback),
}

impl Hook {
    /// Code hook.
    pub fn code(f: impl FnMut(&mut Machine, u64, usize) + Send + 'static) -> Self {
        Self::Code(Box::new(f))
    }

    /// Block hook.
    pub fn block(f: impl FnMut(&mut Machine, u64, usize) + Send + 'static) -> Self {
        Self::Block(Box::new(f))
    }

    /// Memory read hook.
    pub fn mem_read(f: impl FnMut(&mut Machine, u64, usize) + Send + 'static) -> Self {
        Self::MemRead(Box::new(f))
    }

    /// Memory write hook.
    pub fn mem_write(f: impl FnMut(&mut Machine, u64, usize, u64) + Send + 'static) -> Self {
        Self::MemWrite(Box::new(f))
    }

    /// Invalid-access hook.
    pub fn mem_fault(
        f: impl FnMut(&mut Machine, AccessKind, u64, usize, u64) -> bool + Send + 'static,
    ) -> Self {
        Self::MemFault(Box::new(f))
    }

    /// Interrupt hook.
    pub fn interrupt(f: impl FnMut(&mut Machine, u32) + Send + 'static) -> Self {
        Self::Interrupt(Box::new(f))
    }

    /// `IN` hook.
    pub fn port_in(f: impl FnMut(&mut Machine, u16, usize) -> u32 + Send + 'static) -> Self {
        Self::In(Box::new(f))
    }

    /// `OUT` hook.
    pub fn port_out(f: impl FnMut(&mut Machine, u16, usize, u32) + Send + 'static) -> Self {
        Self::Out(Box::new(f))
    }

    /// `SYSCALL` hook.
    pub fn syscall(f: impl FnMut(&mut Machine) + Send + 'static) -> Self {
        Self::Syscall(Box::new(f))
    }

    /// `SYSENTER` hook.
    pub fn sysenter(f: impl FnMut(&mut Machine) + Send + 'static) -> Self {
        Self::Sysenter(Box::new(f))
    }

    /// `CPUID` hook.
    pub fn cpuid(f: impl FnMut(&mut Machine) + Send + 'static) -> Self {
        Self::Cpuid(Box::new(f))
    }

    /// Event class of this hook.
    #[must_use]
    pub const fn class(&self) -> HookClass {
        match self {
            Self::Code(_) => HookClass::Code,
            Self::Block(_) => HookClass::Block,
            Self::MemRead(_) => HookClass::MemRead,
            Self::MemWrite(_) => HookClass::MemWrite,
            Self::MemFault(_) => HookClass::MemFault,
            Self::Interrupt(_) => HookClass::Interrupt,
            Self::In(_) => HookClass::Insn(HookableInsn::In),
            Self::Out(_) => HookClass::Insn(HookableInsn::Out),
            Self::Syscall(_) => HookClass::Insn(HookableInsn::Syscall),
            Self::Sysenter(_) => HookClass::Insn(HookableInsn::Sysenter),
            Self::Cpuid(_) => HookClass::Insn(HookableInsn::Cpuid),
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hook").field(&self.class()).finish()
    }
}

/// Event class a hook is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookClass {
    /// Per instruction.
    Code,
    /// Per basic block.
    Block,
    /// Guest data reads.
    MemRead,
    /// Guest data writes.
    MemWrite,
    /// Invalid guest accesses.
    MemFault,
    /// Interrupts and CPU exceptions.
    Interrupt,
    /// A specific hookable instruction.
    Insn(HookableInsn),
}

/// Registration handle returned by [`HookRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u64);

impl HookId {
    /// Raw identifier for binding layers.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuilds a handle from its raw identifier.
    #[must_use]
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

/// Inclusive address filter. A range with `begin > end` matches everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct AddressRange {
    /// First matching address.
    pub begin: u64,
    /// Last matching address.
    pub end: u64,
}

impl AddressRange {
    /// Matches every address.
    pub const ALL: Self = Self { begin: 1, end: 0 };

    /// Inclusive range `begin..=end`.
    #[must_use]
    pub const fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    /// Returns `true` when `addr` passes the filter.
    #[must_use]
    pub const fn contains(self, addr: u64) -> bool {
        self.begin > self.end || (self.begin <= addr && addr <= self.end)
    }
}

impl Default for AddressRange {
    fn default() -> Self {
        Self::ALL
    }
}

struct HookEntry {
    id: HookId,
    range: AddressRange,
    hook: Hook,
}

/// Ordered hook registrations of one context.
pub struct HookRegistry {
    entries: Vec<HookEntry>,
    next_id: u64,
    limit: usize,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.entries.len())
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl HookRegistry {
    /// Creates an empty registry holding at most `limit` hooks.
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
            limit,
        }
    }

    /// Registers `hook` for addresses in `range`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ResourceExhausted`] when the hook limit is reached.
    pub fn add(&mut self, hook: Hook, range: AddressRange) -> Result<HookId, EngineError> {
        if self.entries.len() >= self.limit {
            return Err(EngineError::ResourceExhausted("hook limit reached"));
        }
        let id = HookId(self.next_id);
        self.next_id += 1;
        debug!(id = id.0, class = ?hook.class(), begin = range.begin, end = range.end, "hook added");
        self.entries.push(HookEntry { id, range, hook });
        Ok(id)
    }

    /// Removes a registration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] for an unknown handle.
    pub fn remove(&mut self, id: HookId) -> Result<(), EngineError> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.id == id)
            .ok_or(EngineError::InvalidArgument("unknown hook handle"))?;
        self.entries.remove(index);
        debug!(id = id.0, "hook removed");
        Ok(())
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no hooks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` when at least one hook of `class` is registered.
    #[must_use]
    pub fn has(&self, class: HookClass) -> bool {
        self.entries.iter().any(|entry| entry.hook.class() == class)
    }

    /// Removes every registration.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn matching(&mut self, addr: u64) -> impl Iterator<Item = &mut Hook> + '_ {
        self.entries
            .iter_mut()
            .filter(move |entry| entry.range.contains(addr))
            .map(|entry| &mut entry.hook)
    }

    pub(crate) fn dispatch_code(&mut self, machine: &mut Machine, addr: u64, size: usize) {
        for hook in self.matching(addr) {
            if let Hook::Code(f) = hook {
                machine.stats.record_hook_call();
                f(machine, addr, size);
            }
        }
    }

    pub(crate) fn dispatch_block(&mut self, machine: &mut Machine, addr: u64, size: usize) {
        for hook in self.matching(addr) {
            if let Hook::Block(f) = hook {
                machine.stats.record_hook_call();
                f(machine, addr, size);
            }
        }
    }

    pub(crate) fn dispatch_mem_read(&mut self, machine: &mut Machine, addr: u64, size: usize) {
        for hook in self.matching(addr) {
            if let Hook::MemRead(f) = hook {
                machine.stats.record_hook_call();
                f(machine, addr, size);
            }
        }
    }

    pub(crate) fn dispatch_mem_write(
        &mut self,
        machine: &mut Machine,
        addr: u64,
        size: usize,
        value: u64,
    ) {
        for hook in self.matching(addr) {
            if let Hook::MemWrite(f) = hook {
                machine.stats.record_hook_call();
                f(machine, addr, size, value);
            }
        }
    }

    /// Returns `true` when any hook asked for the access to be retried.
    pub(crate) fn dispatch_mem_fault(
        &mut self,
        machine: &mut Machine,
        access: AccessKind,
        addr: u64,
        size: usize,
        value: u64,
    ) -> bool {
        let mut retry = false;
        for hook in self.matching(addr) {
            if let Hook::MemFault(f) = hook {
                machine.stats.record_hook_call();
                retry |= f(machine, access, addr, size, value);
            }
        }
        retry
    }

    /// Returns `true` when at least one hook received the interrupt.
    pub(crate) fn dispatch_interrupt(&mut self, machine: &mut Machine, pc: u64, vector: u32) -> bool {
        let mut handled = false;
        for hook in self.matching(pc) {
            if let Hook::Interrupt(f) = hook {
                machine.stats.record_hook_call();
                f(machine, vector);
                handled = true;
            }
        }
        handled
    }

    /// Value returned by the last matching `IN` hook.
    pub(crate) fn dispatch_in(
        &mut self,
        machine: &mut Machine,
        pc: u64,
        port: u16,
        size: usize,
    ) -> Option<u32> {
        let mut value = None;
        for hook in self.matching(pc) {
            if let Hook::In(f) = hook {
                machine.stats.record_hook_call();
                value = Some(f(machine, port, size));
            }
        }
        value
    }

    pub(crate) fn dispatch_out(
        &mut self,
        machine: &mut Machine,
        pc: u64,
        port: u16,
        size: usize,
        value: u32,
    ) {
        for hook in self.matching(pc) {
            if let Hook::Out(f) = hook {
                machine.stats.record_hook_call();
                f(machine, port, size, value);
            }
        }
    }

    /// Runs `SYSCALL`, `SYSENTER` or `CPUID` hooks; `true` when any ran.
    pub(crate) fn dispatch_insn(
        &mut self,
        machine: &mut Machine,
        pc: u64,
        insn: HookableInsn,
    ) -> bool {
        let mut handled = false;
        for hook in self.matching(pc) {
            let f = match (insn, hook) {
                (HookableInsn::Syscall, Hook::Syscall(f))
                | (HookableInsn::Sysenter, Hook::Sysenter(f))
                | (HookableInsn::Cpuid, Hook::Cpuid(f)) => f,
                _ => continue,
            };
            machine.stats.record_hook_call();
            f(machine);
            handled = true;
        }
        handled
    }
}
