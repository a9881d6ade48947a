//! Mutable emulation context shared by the run loop and hook callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::memory::{AddressSpace, Permissions, RegionInfo};
use crate::{EngineError, Mode, Register, RegisterFile, RunStats};

/// Cloneable handle that asks a running context to stop at the next
/// instruction boundary. Safe to use from other threads.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Requests a stop.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` when a stop has been requested since the last run started.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Address space, register bank and stop request of one context.
///
/// Hooks receive `&mut Machine`; every change they make is observed by the
/// run loop when the hook returns.
#[derive(Debug)]
pub struct Machine {
    pub(crate) memory: AddressSpace,
    pub(crate) registers: RegisterFile,
    pub(crate) stats: RunStats,
    pending_stop: bool,
    external_stop: StopHandle,
}

impl Machine {
    pub(crate) fn new(mode: Mode) -> Self {
        Self::with_memory(mode, AddressSpace::default())
    }

    pub(crate) fn with_memory(mode: Mode, memory: AddressSpace) -> Self {
        Self {
            memory,
            registers: RegisterFile::new(mode),
            stats: RunStats::default(),
            pending_stop: false,
            external_stop: StopHandle::default(),
        }
    }

    /// Processor mode.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.registers.mode()
    }

    /// Reads a register.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] for registers unknown in this mode.
    pub fn reg_read(&self, reg: Register) -> Result<u64, EngineError> {
        self.registers.read(reg)
    }

    /// Writes a register.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] for registers unknown in this mode.
    pub fn reg_write(&mut self, reg: Register, value: u64) -> Result<(), EngineError> {
        self.registers.write(reg, value)
    }

    /// Current program counter.
    #[must_use]
    pub const fn pc(&self) -> u64 {
        self.registers.rip()
    }

    /// Redirects the program counter.
    pub const fn set_pc(&mut self, pc: u64) {
        self.registers.set_rip(pc);
    }

    /// Register bank.
    #[must_use]
    pub const fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    /// Mutable register bank.
    pub const fn registers_mut(&mut self) -> &mut RegisterFile {
        &mut self.registers
    }

    /// Address space.
    #[must_use]
    pub const fn memory(&self) -> &AddressSpace {
        &self.memory
    }

    /// Mutable address space.
    pub const fn memory_mut(&mut self) -> &mut AddressSpace {
        &mut self.memory
    }

    /// Maps a zero-filled region.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::map`].
    pub fn mem_map(&mut self, base: u64, size: u64, perms: Permissions) -> Result<(), EngineError> {
        self.memory.map(base, size, perms)
    }

    /// Unmaps a region.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::unmap`].
    pub fn mem_unmap(&mut self, base: u64, size: u64) -> Result<(), EngineError> {
        self.memory.unmap(base, size)
    }

    /// Changes permissions of a mapped range.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::protect`].
    pub fn mem_protect(
        &mut self,
        base: u64,
        size: u64,
        perms: Permissions,
    ) -> Result<(), EngineError> {
        self.memory.protect(base, size, perms)
    }

    /// Lists mapped regions.
    #[must_use]
    pub fn mem_regions(&self) -> Vec<RegionInfo> {
        self.memory.regions()
    }

    /// Reads mapped memory regardless of permissions.
    ///
    /// # Errors
    ///
    /// Returns a read-unmapped fault when any byte is unmapped.
    pub fn mem_read(&self, addr: u64, buf: &mut [u8]) -> Result<(), EngineError> {
        Ok(self.memory.host_read(addr, buf)?)
    }

    /// Writes mapped memory regardless of permissions.
    ///
    /// # Errors
    ///
    /// Returns a write-unmapped fault when any byte is unmapped.
    pub fn mem_write(&mut self, addr: u64, data: &[u8]) -> Result<(), EngineError> {
        Ok(self.memory.host_write(addr, data)?)
    }

    /// Requests that the current run stop once the executing instruction completes.
    pub const fn stop(&mut self) {
        self.pending_stop = true;
    }

    /// Returns `true` when a hook has requested a stop during this run.
    #[must_use]
    pub const fn stop_requested(&self) -> bool {
        self.pending_stop
    }

    /// Statistics accumulated by this context.
    #[must_use]
    pub const fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub(crate) fn stop_handle(&self) -> StopHandle {
        self.external_stop.clone()
    }

    pub(crate) fn external_stop_requested(&self) -> bool {
        self.external_stop.is_stop_requested()
    }

    pub(crate) fn begin_run(&mut self, pc: u64) {
        self.pending_stop = false;
        self.external_stop.clear();
        self.registers.set_rip(pc);
    }

    pub(crate) fn replace_registers(&mut self, registers: RegisterFile) {
        self.registers = registers;
    }
}
