//! Handle-based surface for binding layers.
//!
//! Contexts are addressed by numeric handles, registers by raw identifiers and
//! every failure collapses to an [`ErrorCode`]. Each context sits behind its
//! own lock; entering a context that is currently inside `start` reports
//! [`ErrorCode::AlreadyRunning`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use tracing::info;

use crate::{
    AddressRange, Arch, Engine, EngineConfig, EngineError, ErrorCode, Fault, Hook, HookId, Mode,
    Permissions, Register, RunOptions, RunOutcome, StopHandle,
};

/// Numeric context handle issued by [`EngineTable::open`].
pub type EngineHandle = u32;

#[derive(Debug)]
struct Slot {
    engine: Arc<Mutex<Engine>>,
    stop: StopHandle,
}

#[derive(Debug)]
struct Slots {
    entries: HashMap<EngineHandle, Slot>,
    next: EngineHandle,
}

/// Table of open emulation contexts keyed by handle.
#[derive(Debug)]
pub struct EngineTable {
    slots: Mutex<Slots>,
}

impl Default for EngineTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: HashMap::new(),
                next: 1,
            }),
        }
    }

    /// Number of open contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots().entries.len()
    }

    /// Returns `true` when no context is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates a context for the binding architecture and mode identifiers.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::InvalidArgument`] for unknown identifiers.
    pub fn open(&self, arch: u32, mode: u32) -> Result<EngineHandle, ErrorCode> {
        let config = EngineConfig {
            arch: Arch::from_u32(arch).map_err(|err| err.code())?,
            ..EngineConfig::with_mode(Mode::from_u32(mode).map_err(|err| err.code())?)
        };
        let engine = Engine::new(config).map_err(|err| err.code())?;
        let stop = engine.stop_handle();

        let mut slots = self.slots();
        let handle = slots.next;
        slots.next = slots.next.wrapping_add(1).max(1);
        slots.entries.insert(
            handle,
            Slot {
                engine: Arc::new(Mutex::new(engine)),
                stop,
            },
        );
        Ok(handle)
    }

    /// Releases a context and everything it owns.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::InvalidArgument`] for an unknown handle and
    /// [`ErrorCode::AlreadyRunning`] while the context is executing.
    pub fn close(&self, handle: EngineHandle) -> Result<(), ErrorCode> {
        let mut slots = self.slots();
        let slot = slots.entries.get(&handle).ok_or(ErrorCode::InvalidArgument)?;
        if matches!(slot.engine.try_lock(), Err(TryLockError::WouldBlock)) {
            return Err(ErrorCode::AlreadyRunning);
        }
        slots.entries.remove(&handle);
        info!(handle, "emulation context closed");
        Ok(())
    }

    /// Maps `size` bytes at `addr` with binding permission bits.
    ///
    /// # Errors
    ///
    /// See [`Engine::mem_map`].
    pub fn mem_map(
        &self,
        handle: EngineHandle,
        addr: u64,
        size: u64,
        perms: u32,
    ) -> Result<(), ErrorCode> {
        let perms = Permissions::from_raw(perms).map_err(|err| err.code())?;
        self.with_engine(handle, |engine| engine.mem_map(addr, size, perms))
    }

    /// Unmaps a region.
    ///
    /// # Errors
    ///
    /// See [`Engine::mem_unmap`].
    pub fn mem_unmap(&self, handle: EngineHandle, addr: u64, size: u64) -> Result<(), ErrorCode> {
        self.with_engine(handle, |engine| engine.mem_unmap(addr, size))
    }

    /// Changes permissions of a mapped range.
    ///
    /// # Errors
    ///
    /// See [`Engine::mem_protect`].
    pub fn mem_protect(
        &self,
        handle: EngineHandle,
        addr: u64,
        size: u64,
        perms: u32,
    ) -> Result<(), ErrorCode> {
        let perms = Permissions::from_raw(perms).map_err(|err| err.code())?;
        self.with_engine(handle, |engine| engine.mem_protect(addr, size, perms))
    }

    /// Reads guest memory into `buf`.
    ///
    /// # Errors
    ///
    /// See [`Engine::mem_read`].
    pub fn mem_read(&self, handle: EngineHandle, addr: u64, buf: &mut [u8]) -> Result<(), ErrorCode> {
        self.with_engine(handle, |engine| engine.mem_read(addr, buf))
    }

    /// Writes `data` into guest memory.
    ///
    /// # Errors
    ///
    /// See [`Engine::mem_write`].
    pub fn mem_write(&self, handle: EngineHandle, addr: u64, data: &[u8]) -> Result<(), ErrorCode> {
        self.with_engine(handle, |engine| engine.mem_write(addr, data))
    }

    /// Reads a register by raw identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::InvalidArgument`] for unknown handles or registers.
    pub fn reg_read(&self, handle: EngineHandle, reg: u16) -> Result<u64, ErrorCode> {
        let reg = Register::try_from(reg).map_err(|err| err.code())?;
        self.with_engine(handle, |engine| engine.reg_read(reg))
    }

    /// Writes a register by raw identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::InvalidArgument`] for unknown handles or registers.
    pub fn reg_write(&self, handle: EngineHandle, reg: u16, value: u64) -> Result<(), ErrorCode> {
        let reg = Register::try_from(reg).map_err(|err| err.code())?;
        self.with_engine(handle, |engine| engine.reg_write(reg, value))
    }

    /// Registers a hook for the inclusive address range `begin..=end`.
    ///
    /// # Errors
    ///
    /// See [`Engine::hook_add`].
    pub fn hook_add(
        &self,
        handle: EngineHandle,
        hook: Hook,
        begin: u64,
        end: u64,
    ) -> Result<u64, ErrorCode> {
        self.with_engine(handle, |engine| {
            engine
                .hook_add(hook, AddressRange::new(begin, end))
                .map(HookId::as_u64)
        })
    }

    /// Removes a hook.
    ///
    /// # Errors
    ///
    /// See [`Engine::hook_del`].
    pub fn hook_del(&self, handle: EngineHandle, hook: u64) -> Result<(), ErrorCode> {
        self.with_engine(handle, |engine| engine.hook_del(HookId::from_u64(hook)))
    }

    /// Runs a context. A zero `timeout_us` or `count` means unlimited.
    ///
    /// # Errors
    ///
    /// Returns the error code of the terminating fault; the fault address is
    /// available through [`EngineTable::last_fault`].
    pub fn start(
        &self,
        handle: EngineHandle,
        begin: u64,
        until: u64,
        timeout_us: u64,
        count: u64,
    ) -> Result<RunOutcome, ErrorCode> {
        let mut options = RunOptions::unbounded();
        if timeout_us != 0 {
            options = options.with_timeout(Duration::from_micros(timeout_us));
        }
        if count != 0 {
            options = options.with_count(count);
        }
        self.with_engine(handle, |engine| engine.start(begin, until, options))
    }

    /// Requests that a running context stop. Usable while `start` is in
    /// progress on another thread or from inside a hook.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::InvalidArgument`] for an unknown handle.
    pub fn stop(&self, handle: EngineHandle) -> Result<(), ErrorCode> {
        self.slots()
            .entries
            .get(&handle)
            .ok_or(ErrorCode::InvalidArgument)?
            .stop
            .stop();
        Ok(())
    }

    /// Fault that ended the most recent run of a context, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::InvalidArgument`] for an unknown handle.
    pub fn last_fault(&self, handle: EngineHandle) -> Result<Option<Fault>, ErrorCode> {
        self.with_engine(handle, |engine| Ok(engine.state().last_fault()))
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_engine<T>(
        &self,
        handle: EngineHandle,
        f: impl FnOnce(&mut Engine) -> Result<T, EngineError>,
    ) -> Result<T, ErrorCode> {
        let engine = self
            .slots()
            .entries
            .get(&handle)
            .map(|slot| Arc::clone(&slot.engine))
            .ok_or(ErrorCode::InvalidArgument)?;
        let mut guard = match engine.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(ErrorCode::AlreadyRunning),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        f(&mut guard).map_err(|err| err.code())
    }
}
