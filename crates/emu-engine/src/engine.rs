//! Emulation context lifecycle and the execution controller.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::decoder::{DecodedInstruction, DecodedOrFault, Decoder};
use crate::execute::{execute_instruction, ExecuteOutcome};
use crate::hooks::{AddressRange, Hook, HookClass, HookId, HookRegistry};
use crate::memory::{AccessKind, AddressSpace, Permissions, RegionInfo, MAX_INSTRUCTION_BYTES};
use crate::{
    CpuContext, EngineConfig, EngineError, EngineState, Fault, Machine, Mode, Register,
    RunOptions, RunOutcome, RunStats, StopHandle,
};

/// One emulation context: address space, registers, hooks and run state.
///
/// ```
/// use emu_engine::{Engine, EngineConfig, Mode, Permissions, Register, RunOptions, RunOutcome};
///
/// let mut engine = Engine::new(EngineConfig::with_mode(Mode::Protected32))?;
/// engine.mem_map(0x1000000, 2 * 1024 * 1024, Permissions::ALL)?;
/// engine.mem_write(0x1000000, &[0x41, 0x4A])?; // inc ecx; dec edx
/// engine.reg_write(Register::Ecx, 0x1234)?;
/// engine.reg_write(Register::Edx, 0x7890)?;
///
/// let outcome = engine.start(0x1000000, 0x1000002, RunOptions::default())?;
/// assert_eq!(outcome, RunOutcome::EndReached);
/// assert_eq!(engine.reg_read(Register::Ecx)?, 0x1235);
/// assert_eq!(engine.reg_read(Register::Edx)?, 0x788F);
/// # Ok::<(), emu_engine::EngineError>(())
/// ```
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    machine: Machine,
    hooks: HookRegistry,
    state: EngineState,
}

impl Engine {
    /// Creates a context from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] when the configuration is rejected.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let memory = AddressSpace::new(config.page_size, config.memory_limit);
        info!(arch = ?config.arch, mode = ?config.mode, "emulation context created");
        Ok(Self {
            machine: Machine::with_memory(config.mode, memory),
            hooks: HookRegistry::new(config.max_hooks),
            state: EngineState::Idle,
            config,
        })
    }

    /// Creates a context with default settings for `mode`.
    ///
    /// # Errors
    ///
    /// See [`Engine::new`].
    pub fn with_mode(mode: Mode) -> Result<Self, EngineError> {
        Self::new(EngineConfig::with_mode(mode))
    }

    /// Configuration the context was created with.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Processor mode.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.config.mode
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> EngineState {
        self.state
    }

    /// Context shared with hooks.
    #[must_use]
    pub const fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Mutable context shared with hooks.
    pub const fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    /// Accumulated run statistics.
    #[must_use]
    pub const fn stats(&self) -> &RunStats {
        &self.machine.stats
    }

    /// Maps a zero-filled region.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::map`].
    pub fn mem_map(&mut self, base: u64, size: u64, perms: Permissions) -> Result<(), EngineError> {
        self.machine.mem_map(base, size, perms)
    }

    /// Unmaps a region.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::unmap`].
    pub fn mem_unmap(&mut self, base: u64, size: u64) -> Result<(), EngineError> {
        self.machine.mem_unmap(base, size)
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
        self.machine.mem_protect(base, size, perms)
    }

    /// Lists mapped regions in ascending order.
    #[must_use]
    pub fn mem_regions(&self) -> Vec<RegionInfo> {
        self.machine.mem_regions()
    }

    /// Reads mapped memory regardless of permissions.
    ///
    /// # Errors
    ///
    /// Returns a read-unmapped fault when any byte is unmapped.
    pub fn mem_read(&self, addr: u64, buf: &mut [u8]) -> Result<(), EngineError> {
        self.machine.mem_read(addr, buf)
    }

    /// Writes mapped memory regardless of permissions.
    ///
    /// # Errors
    ///
    /// Returns a write-unmapped fault when any byte is unmapped.
    pub fn mem_write(&mut self, addr: u64, data: &[u8]) -> Result<(), EngineError> {
        self.machine.mem_write(addr, data)
    }

    /// Reads a register.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] for registers unknown in this mode.
    pub fn reg_read(&self, reg: Register) -> Result<u64, EngineError> {
        self.machine.reg_read(reg)
    }

    /// Writes a register.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] for registers unknown in this mode.
    pub fn reg_write(&mut self, reg: Register, value: u64) -> Result<(), EngineError> {
        self.machine.reg_write(reg, value)
    }

    /// Registers a hook for addresses in `range`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ResourceExhausted`] beyond the configured hook limit.
    pub fn hook_add(&mut self, hook: Hook, range: AddressRange) -> Result<HookId, EngineError> {
        self.hooks.add(hook, range)
    }

    /// Removes a hook.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] for an unknown handle.
    pub fn hook_del(&mut self, id: HookId) -> Result<(), EngineError> {
        self.hooks.remove(id)
    }

    /// Handle that stops a run from another thread.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.machine.stop_handle()
    }

    /// Saves the register state.
    #[must_use]
    pub fn context_save(&self) -> CpuContext {
        CpuContext::capture(self.machine.registers.clone())
    }

    /// Restores a saved register state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] when the context was saved in
    /// a different mode.
    pub fn context_restore(&mut self, context: &CpuContext) -> Result<(), EngineError> {
        if context.mode() != self.mode() {
            return Err(EngineError::InvalidArgument(
                "saved context belongs to a different mode",
            ));
        }
        self.machine.replace_registers(context.registers().clone());
        debug!("cpu context restored");
        Ok(())
    }

    /// Runs from `begin` until the program counter equals `until`, a limit in
    /// `options` is reached, a stop is requested or a fault occurs.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] when `begin` or `until` lies
    /// outside the mode's address space and [`EngineError::Fault`] when the
    /// run ends on a fault. After a fault the program counter addresses the
    /// faulting instruction.
    pub fn start(
        &mut self,
        begin: u64,
        until: u64,
        options: RunOptions,
    ) -> Result<RunOutcome, EngineError> {
        let mask = self.mode().address_mask();
        if begin & !mask != 0 || until & !mask != 0 {
            return Err(EngineError::InvalidArgument(
                "run address outside the mode's address space",
            ));
        }
        self.machine.begin_run(begin);
        self.state = EngineState::Running;
        info!(
            begin,
            until,
            count = ?options.count,
            timeout = ?options.timeout,
            "run started"
        );

        match self.run_loop(until, options) {
            Ok(outcome) => {
                self.state = EngineState::Stopped(outcome);
                info!(
                    ?outcome,
                    pc = self.machine.pc(),
                    instructions = self.machine.stats.instructions,
                    "run finished"
                );
                Ok(outcome)
            }
            Err(fault) => {
                self.machine.stats.record_fault(fault);
                self.state = EngineState::Faulted(fault);
                warn!(%fault, pc = self.machine.pc(), "run faulted");
                Err(fault.into())
            }
        }
    }

    fn run_loop(&mut self, until: u64, options: RunOptions) -> Result<RunOutcome, Fault> {
        let deadline = options
            .timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));
        let mut executed = 0u64;
        let mut block_entry = true;

        loop {
            let pc = self.machine.pc();
            if pc == until {
                return Ok(RunOutcome::EndReached);
            }
            if options.count.is_some_and(|limit| executed >= limit) {
                return Ok(RunOutcome::InstructionLimit);
            }
            if self.machine.external_stop_requested() {
                return Ok(RunOutcome::StoppedExternally);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(RunOutcome::TimedOut);
            }

            let decoded = self.fetch(pc)?;

            if block_entry {
                block_entry = false;
                self.machine.stats.record_block();
                if self.hooks.has(HookClass::Block) {
                    let size = Decoder::block_size(
                        &self.machine.memory,
                        self.mode(),
                        pc,
                        self.config.block_scan_limit,
                    );
                    self.hooks
                        .dispatch_block(&mut self.machine, pc, size as usize);
                }
            }
            if self.machine.pc() == pc {
                self.hooks
                    .dispatch_code(&mut self.machine, pc, decoded.len());
            }

            if self.machine.pc() != pc {
                // A hook moved the program counter; the observed instruction is
                // skipped but still spends one unit of the instruction budget.
                executed += 1;
                block_entry = true;
                if self.machine.stop_requested() {
                    return Ok(RunOutcome::StoppedByHook);
                }
                continue;
            }

            let outcome = execute_instruction(&mut self.machine, &mut self.hooks, &decoded)?;
            executed += 1;
            self.machine.stats.record_instruction();

            let mask = self.mode().address_mask();
            if decoded.ends_block() || self.machine.pc() != decoded.next_ip() & mask {
                block_entry = true;
            }
            if outcome == ExecuteOutcome::Halted {
                return Ok(RunOutcome::Halted);
            }
            if self.machine.stop_requested() {
                return Ok(RunOutcome::StoppedByHook);
            }
        }
    }

    /// Fetches and decodes at `pc`, letting invalid-access hooks retry once.
    fn fetch(&mut self, pc: u64) -> Result<DecodedInstruction, Fault> {
        let mode = self.mode();
        let fault = match Decoder::fetch_and_decode(&self.machine.memory, mode, pc) {
            DecodedOrFault::Instruction(decoded) => return Ok(decoded),
            DecodedOrFault::Fault(fault) => fault,
        };
        if fault.kind.access() != Some(AccessKind::Fetch) {
            return Err(fault);
        }
        let retry = self.hooks.dispatch_mem_fault(
            &mut self.machine,
            AccessKind::Fetch,
            fault.address,
            MAX_INSTRUCTION_BYTES,
            0,
        );
        if !retry {
            return Err(fault);
        }
        match Decoder::fetch_and_decode(&self.machine.memory, mode, pc) {
            DecodedOrFault::Instruction(decoded) => Ok(decoded),
            DecodedOrFault::Fault(fault) => Err(fault),
        }
    }
}
