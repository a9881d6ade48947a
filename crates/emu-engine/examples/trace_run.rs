//! Runs a short 32-bit program with port and code hooks and prints the trace.
//!
//! Set `EMU_TRACE=1` to include per-instruction `trace!` events.

use std::sync::{Arc, Mutex};

use bitflags as _;
use emu_engine::{
    AddressRange, Engine, EngineConfig, EngineError, Hook, Mode, Permissions, Register, RunOptions,
};
use iced_x86 as _;
use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use tracing::{info, Level};

const ADDRESS: u64 = 0x100_0000;

// inc ecx; in al, 0x3f; dec edx; out 0x46, al; inc ebx
const PROGRAM: [u8; 7] = [0x41, 0xE4, 0x3F, 0x4A, 0xE6, 0x46, 0x43];

fn main() -> Result<(), EngineError> {
    let level = if std::env::var_os("EMU_TRACE").is_some() {
        Level::TRACE
    } else {
        Level::DEBUG
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut engine = Engine::new(EngineConfig::with_mode(Mode::Protected32))?;
    engine.mem_map(ADDRESS, 2 * 1024 * 1024, Permissions::ALL)?;
    engine.mem_write(ADDRESS, &PROGRAM)?;
    engine.reg_write(Register::Eax, 0x1234)?;
    engine.reg_write(Register::Ecx, 0x6789)?;
    engine.reg_write(Register::Edx, 0x7890)?;

    let trace = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&trace);
    engine.hook_add(
        Hook::code(move |machine, addr, size| {
            let eflags = machine.reg_read(Register::Eflags).unwrap_or_default();
            if let Ok(mut lines) = sink.lock() {
                lines.push(format!("{addr:#x} size={size} eflags={eflags:#x}"));
            }
        }),
        AddressRange::ALL,
    )?;
    engine.hook_add(
        Hook::port_in(|machine, port, size| {
            info!(port, size, pc = machine.pc(), "in");
            0xF1
        }),
        AddressRange::ALL,
    )?;
    engine.hook_add(
        Hook::port_out(|machine, port, size, value| {
            info!(port, size, value, pc = machine.pc(), "out");
        }),
        AddressRange::ALL,
    )?;

    let outcome = engine.start(
        ADDRESS,
        ADDRESS + PROGRAM.len() as u64,
        RunOptions::default(),
    )?;

    if let Ok(lines) = trace.lock() {
        for line in lines.iter() {
            println!("{line}");
        }
    }
    println!("outcome: {outcome:?}");
    for reg in [Register::Eax, Register::Ebx, Register::Ecx, Register::Edx] {
        println!("{:>4} = {:#010x}", reg.name(), engine.reg_read(reg)?);
    }
    println!("stats: {:?}", engine.stats());
    Ok(())
}
