//! End-to-end runs covering the host API, hook classes and stop semantics.

#![allow(
    clippy::pedantic,
    clippy::nursery,
    clippy::cast_possible_truncation,
    clippy::too_many_lines
)]

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bitflags as _;
use emu_engine::{
    AccessKind, AddressRange, Engine, EngineConfig, EngineError, Fault, FaultKind, Hook, Mode,
    Permissions, Register, RunOptions, RunOutcome,
};
use iced_x86 as _;
use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use tracing as _;

const ADDRESS: u64 = 0x100_0000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn engine_with(mode: Mode, code: &[u8]) -> Engine {
    init_tracing();
    let mut engine = Engine::new(EngineConfig::with_mode(mode)).unwrap();
    engine
        .mem_map(ADDRESS, 2 * 1024 * 1024, Permissions::ALL)
        .unwrap();
    engine.mem_write(ADDRESS, code).unwrap();
    engine
}

fn end_of(code: &[u8]) -> u64 {
    ADDRESS + code.len() as u64
}

#[test]
fn inc_ecx_dec_edx() {
    let code = [0x41, 0x4A];
    let mut engine = engine_with(Mode::Protected32, &code);
    engine.reg_write(Register::Ecx, 0x1234).unwrap();
    engine.reg_write(Register::Edx, 0x7890).unwrap();

    let outcome = engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap();

    assert_eq!(outcome, RunOutcome::EndReached);
    assert_eq!(engine.reg_read(Register::Ecx), Ok(0x1235));
    assert_eq!(engine.reg_read(Register::Edx), Ok(0x788F));
    assert_eq!(engine.reg_read(Register::Eip), Ok(end_of(&code)));
    assert_eq!(engine.stats().instructions, 2);
}

#[test]
fn read_from_unmapped_memory_faults_without_side_effects() {
    // mov ecx, [0xaaaaaaaa]; inc ecx; dec edx
    let code = [0x8B, 0x0D, 0xAA, 0xAA, 0xAA, 0xAA, 0x41, 0x4A];
    let mut engine = engine_with(Mode::Protected32, &code);
    engine.reg_write(Register::Ecx, 0x1234).unwrap();
    engine.reg_write(Register::Edx, 0x7890).unwrap();

    let err = engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap_err();

    assert_eq!(
        err,
        EngineError::Fault(Fault::new(FaultKind::ReadUnmapped, 0xAAAA_AAAA))
    );
    assert_eq!(err.code().as_u32(), 1);
    assert_eq!(engine.reg_read(Register::Ecx), Ok(0x1234));
    assert_eq!(engine.reg_read(Register::Edx), Ok(0x7890));
    assert_eq!(engine.reg_read(Register::Eip), Ok(ADDRESS));
    assert_eq!(engine.state().last_fault(), err.fault());
}

#[test]
fn write_to_unmapped_memory_faults_without_side_effects() {
    // mov [0xaaaaaaaa], ecx; inc ecx; dec edx
    let code = [0x89, 0x0D, 0xAA, 0xAA, 0xAA, 0xAA, 0x41, 0x4A];
    let mut engine = engine_with(Mode::Protected32, &code);
    engine.reg_write(Register::Ecx, 0x1234).unwrap();
    engine.reg_write(Register::Edx, 0x7890).unwrap();

    let err = engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap_err();

    assert_eq!(
        err,
        EngineError::Fault(Fault::new(FaultKind::WriteUnmapped, 0xAAAA_AAAA))
    );
    assert_eq!(engine.reg_read(Register::Ecx), Ok(0x1234));
    assert_eq!(engine.reg_read(Register::Edx), Ok(0x7890));
    assert_eq!(engine.stats().fault_count_unmapped, 1);
}

#[test]
fn in_and_out_hooks_exchange_port_values() {
    // inc ecx; in al, 0x3f; dec edx; out 0x46, al; inc ebx
    let code = [0x41, 0xE4, 0x3F, 0x4A, 0xE6, 0x46, 0x43];
    let mut engine = engine_with(Mode::Protected32, &code);
    engine.reg_write(Register::Eax, 0x1234).unwrap();
    engine.reg_write(Register::Ecx, 0x6789).unwrap();
    engine.reg_write(Register::Edx, 0x7890).unwrap();

    let inputs = Arc::new(Mutex::new(Vec::new()));
    let outputs = Arc::new(Mutex::new(Vec::new()));
    let (in_sink, out_sink) = (Arc::clone(&inputs), Arc::clone(&outputs));
    engine
        .hook_add(
            Hook::port_in(move |machine, port, size| {
                in_sink.lock().unwrap().push((machine.pc(), port, size));
                0xF1
            }),
            AddressRange::ALL,
        )
        .unwrap();
    engine
        .hook_add(
            Hook::port_out(move |_, port, size, value| {
                out_sink.lock().unwrap().push((port, size, value));
            }),
            AddressRange::ALL,
        )
        .unwrap();

    engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap();

    assert_eq!(*inputs.lock().unwrap(), vec![(ADDRESS + 3, 0x3F, 1)]);
    assert_eq!(*outputs.lock().unwrap(), vec![(0x46, 1, 0xF1)]);
    assert_eq!(engine.reg_read(Register::Eax), Ok(0x12F1));
    assert_eq!(engine.reg_read(Register::Ecx), Ok(0x678A));
    assert_eq!(engine.reg_read(Register::Edx), Ok(0x788F));
    assert_eq!(engine.reg_read(Register::Ebx), Ok(1));
}

#[test]
fn in_without_hook_reads_zero_and_last_hook_wins() {
    // in eax, dx
    let code = [0xED];
    let mut engine = engine_with(Mode::Protected32, &code);
    engine.reg_write(Register::Eax, u64::from(u32::MAX)).unwrap();
    engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap();
    assert_eq!(engine.reg_read(Register::Eax), Ok(0));

    engine.hook_add(Hook::port_in(|_, _, _| 1), AddressRange::ALL).unwrap();
    engine
        .hook_add(Hook::port_in(|_, _, size| size as u32 * 0x100), AddressRange::ALL)
        .unwrap();
    engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap();
    assert_eq!(engine.reg_read(Register::Eax), Ok(0x400));
}

#[test]
fn syscall_hook_replaces_the_instruction() {
    let code = [0x0F, 0x05];
    let mut engine = engine_with(Mode::Long64, &code);
    engine.reg_write(Register::Rax, 0x100).unwrap();
    engine
        .hook_add(
            Hook::syscall(|machine| {
                let rax = machine.reg_read(Register::Rax).unwrap();
                machine.reg_write(Register::Rax, rax + 1).unwrap();
            }),
            AddressRange::ALL,
        )
        .unwrap();

    let outcome = engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap();

    assert_eq!(outcome, RunOutcome::EndReached);
    assert_eq!(engine.reg_read(Register::Rax), Ok(0x101));
}

#[test]
fn sysenter_without_hook_falls_through() {
    // sysenter; inc ecx
    let code = [0x0F, 0x34, 0x41];
    let mut engine = engine_with(Mode::Protected32, &code);
    engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap();
    assert_eq!(engine.reg_read(Register::Ecx), Ok(1));
}

#[test]
fn mnemonic_hook_may_redirect_the_program_counter() {
    // sysenter; inc ecx; inc edx
    let code = [0x0F, 0x34, 0x41, 0x42];
    let mut engine = engine_with(Mode::Protected32, &code);
    engine
        .hook_add(
            Hook::sysenter(|machine| {
                assert_eq!(machine.pc(), ADDRESS + 2);
                machine.set_pc(ADDRESS + 3);
            }),
            AddressRange::ALL,
        )
        .unwrap();
    engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap();
    assert_eq!(engine.reg_read(Register::Ecx), Ok(0));
    assert_eq!(engine.reg_read(Register::Edx), Ok(1));
}

#[test]
fn cpuid_hook_replaces_builtin_identity() {
    // cpuid
    let code = [0x0F, 0xA2];
    let mut engine = engine_with(Mode::Protected32, &code);
    engine.reg_write(Register::Ebx, 0x5555).unwrap();
    engine
        .hook_add(
            Hook::cpuid(|machine| machine.reg_write(Register::Eax, 0xDEAD).unwrap()),
            AddressRange::ALL,
        )
        .unwrap();
    engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap();
    assert_eq!(engine.reg_read(Register::Eax), Ok(0xDEAD));
    assert_eq!(engine.reg_read(Register::Ebx), Ok(0x5555));
}

#[test]
fn rdtsc_reports_retired_instruction_count() {
    // inc ecx; inc ecx; rdtsc
    let code = [0x41, 0x41, 0x0F, 0x31];
    let mut engine = engine_with(Mode::Protected32, &code);
    engine.reg_write(Register::Edx, 0xFFFF).unwrap();
    engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap();
    assert_eq!(engine.reg_read(Register::Eax), Ok(2));
    assert_eq!(engine.reg_read(Register::Edx), Ok(0));
}

#[test]
fn interrupt_hooks_receive_vectors() {
    // int3; int1; int 0x21; into (OF clear)
    let code = [0xCC, 0xF1, 0xCD, 0x21, 0xCE];
    let mut engine = engine_with(Mode::Protected32, &code);
    let vectors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&vectors);
    engine
        .hook_add(
            Hook::interrupt(move |_, vector| sink.lock().unwrap().push(vector)),
            AddressRange::ALL,
        )
        .unwrap();
    engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap();
    assert_eq!(*vectors.lock().unwrap(), vec![3, 1, 0x21]);
}

#[test]
fn unhandled_interrupt_reports_invalid_instruction_code() {
    // inc ecx; int 0x80
    let code = [0x41, 0xCD, 0x80];
    let mut engine = engine_with(Mode::Protected32, &code);
    let err = engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap_err();
    assert_eq!(
        err.fault(),
        Some(Fault::new(FaultKind::UnhandledInterrupt, ADDRESS + 1))
    );
    assert_eq!(err.code().as_u32(), 5);
    assert_eq!(engine.reg_read(Register::Ecx), Ok(1));
    assert_eq!(engine.reg_read(Register::Eip), Ok(ADDRESS + 1));
}

#[test]
fn divide_error_is_delivered_as_vector_zero() {
    // xor ecx, ecx; div ecx; inc edx
    let code = [0x31, 0xC9, 0xF7, 0xF1, 0x42];
    let mut engine = engine_with(Mode::Protected32, &code);
    engine.reg_write(Register::Eax, 7).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine
        .hook_add(
            Hook::interrupt(move |machine, vector| {
                sink.lock().unwrap().push((vector, machine.pc()));
            }),
            AddressRange::ALL,
        )
        .unwrap();
    engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![(0, ADDRESS + 4)]);
    assert_eq!(engine.reg_read(Register::Eax), Ok(7));
    assert_eq!(engine.reg_read(Register::Edx), Ok(1));
}

#[test]
fn ud2_is_an_invalid_instruction() {
    let code = [0x0F, 0x0B];
    let mut engine = engine_with(Mode::Protected32, &code);
    assert_eq!(
        engine.start(ADDRESS, end_of(&code), RunOptions::default()),
        Err(EngineError::Fault(Fault::new(
            FaultKind::InvalidInstruction,
            ADDRESS
        )))
    );
    assert_eq!(engine.stats().fault_count_decode, 1);
}

#[test]
fn stop_from_code_hook_includes_the_observed_instruction() {
    let code = [0x41, 0x41, 0x41];
    let mut engine = engine_with(Mode::Protected32, &code);
    engine
        .hook_add(
            Hook::code(|machine, _, _| machine.stop()),
            AddressRange::new(ADDRESS + 1, ADDRESS + 1),
        )
        .unwrap();

    let outcome = engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap();

    assert_eq!(outcome, RunOutcome::StoppedByHook);
    assert!(outcome.is_user_stop());
    assert_eq!(engine.reg_read(Register::Ecx), Ok(2));
    assert_eq!(engine.reg_read(Register::Eip), Ok(ADDRESS + 2));
}

#[test]
fn code_hook_that_moves_pc_skips_the_instruction() {
    // inc ecx; inc edx
    let code = [0x41, 0x42];
    let mut engine = engine_with(Mode::Protected32, &code);
    engine
        .hook_add(
            Hook::code(|machine, _, _| machine.set_pc(ADDRESS + 1)),
            AddressRange::new(ADDRESS, ADDRESS),
        )
        .unwrap();
    engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap();
    assert_eq!(engine.reg_read(Register::Ecx), Ok(0));
    assert_eq!(engine.reg_read(Register::Edx), Ok(1));
    assert_eq!(engine.stats().instructions, 1);
}

#[test]
fn redirecting_code_hooks_still_spend_the_instruction_budget() {
    // inc ecx; inc edx
    let code = [0x41, 0x42];
    let mut engine = engine_with(Mode::Protected32, &code);
    let calls = Arc::new(AtomicU32::new(0));
    for (from, to) in [(ADDRESS, ADDRESS + 1), (ADDRESS + 1, ADDRESS)] {
        let calls = Arc::clone(&calls);
        engine
            .hook_add(
                Hook::code(move |machine, _, _| {
                    calls.fetch_add(1, Ordering::Relaxed);
                    machine.set_pc(to);
                }),
                AddressRange::new(from, from),
            )
            .unwrap();
    }

    let outcome = engine
        .start(ADDRESS, end_of(&code), RunOptions::default().with_count(5))
        .unwrap();
    assert_eq!(outcome, RunOutcome::InstructionLimit);
    assert_eq!(calls.load(Ordering::Relaxed), 5);
    assert_eq!(engine.reg_read(Register::Ecx), Ok(0));
    assert_eq!(engine.reg_read(Register::Edx), Ok(0));
}

#[test]
fn start_outside_the_thirty_two_bit_address_space_is_rejected() {
    let code = [0x41];
    let mut engine = engine_with(Mode::Protected32, &code);
    let high = 0x1_0000_0000 + ADDRESS;
    engine.mem_map(high, 0x1000, Permissions::ALL).unwrap();
    engine.mem_write(high, &[0x42]).unwrap();

    assert!(matches!(
        engine.start(high, high + 1, RunOptions::default().with_count(1)),
        Err(EngineError::InvalidArgument(_))
    ));
    assert_eq!(engine.reg_read(Register::Ecx), Ok(0));
    assert_eq!(engine.reg_read(Register::Edx), Ok(0));
    assert_eq!(engine.stats().instructions, 0);
}

#[test]
fn hooks_fire_in_registration_order_and_respect_ranges() {
    let code = [0x41, 0x41];
    let mut engine = engine_with(Mode::Protected32, &code);
    let order = Arc::new(Mutex::new(Vec::new()));
    for (tag, range) in [
        (1u8, AddressRange::ALL),
        (2, AddressRange::new(ADDRESS + 1, ADDRESS + 1)),
        (3, AddressRange::new(ADDRESS, ADDRESS + 1)),
    ] {
        let sink = Arc::clone(&order);
        engine
            .hook_add(
                Hook::code(move |_, addr, size| sink.lock().unwrap().push((tag, addr, size))),
                range,
            )
            .unwrap();
    }
    engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap();
    assert_eq!(
        *order.lock().unwrap(),
        vec![
            (1, ADDRESS, 1),
            (3, ADDRESS, 1),
            (1, ADDRESS + 1, 1),
            (2, ADDRESS + 1, 1),
            (3, ADDRESS + 1, 1),
        ]
    );
}

#[test]
fn removed_hooks_are_not_invoked() {
    let code = [0x41];
    let mut engine = engine_with(Mode::Protected32, &code);
    let calls = Arc::new(AtomicU32::new(0));
    let sink = Arc::clone(&calls);
    let id = engine
        .hook_add(
            Hook::code(move |_, _, _| {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
            AddressRange::ALL,
        )
        .unwrap();
    engine.hook_del(id).unwrap();
    engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(matches!(
        engine.hook_del(id),
        Err(EngineError::InvalidArgument(_))
    ));
}

#[test]
fn hook_limit_is_enforced() {
    init_tracing();
    let config = EngineConfig {
        max_hooks: 1,
        ..EngineConfig::with_mode(Mode::Protected32)
    };
    let mut engine = Engine::new(config).unwrap();
    engine.hook_add(Hook::code(|_, _, _| {}), AddressRange::ALL).unwrap();
    assert!(matches!(
        engine.hook_add(Hook::code(|_, _, _| {}), AddressRange::ALL),
        Err(EngineError::ResourceExhausted(_))
    ));
}

#[test]
fn block_hooks_fire_on_block_entry_with_block_length() {
    // inc ecx; jmp +0; inc edx; ud2
    let code = [0x41, 0xEB, 0x00, 0x42, 0x0F, 0x0B];
    let mut engine = engine_with(Mode::Protected32, &code);
    let blocks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&blocks);
    engine
        .hook_add(
            Hook::block(move |_, addr, size| sink.lock().unwrap().push((addr, size))),
            AddressRange::ALL,
        )
        .unwrap();
    engine
        .start(ADDRESS, ADDRESS + 4, RunOptions::default())
        .unwrap();
    assert_eq!(*blocks.lock().unwrap(), vec![(ADDRESS, 3), (ADDRESS + 3, 3)]);
    assert_eq!(engine.stats().blocks, 2);
}

#[test]
fn memory_hooks_observe_guest_accesses() {
    // mov [0x1002000], ecx; mov edx, [0x1002000]
    let code = [
        0x89, 0x0D, 0x00, 0x20, 0x00, 0x01, 0x8B, 0x15, 0x00, 0x20, 0x00, 0x01,
    ];
    let mut engine = engine_with(Mode::Protected32, &code);
    engine.reg_write(Register::Ecx, 0xCAFE_F00D).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let (writes, reads) = (Arc::clone(&events), Arc::clone(&events));
    engine
        .hook_add(
            Hook::mem_write(move |_, addr, size, value| {
                writes.lock().unwrap().push(("write", addr, size, value));
            }),
            AddressRange::ALL,
        )
        .unwrap();
    engine
        .hook_add(
            Hook::mem_read(move |_, addr, size| {
                reads.lock().unwrap().push(("read", addr, size, 0));
            }),
            AddressRange::new(0x100_2000, 0x100_2FFF),
        )
        .unwrap();

    engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            ("write", 0x100_2000, 4, 0xCAFE_F00D),
            ("read", 0x100_2000, 4, 0),
        ]
    );
    assert_eq!(engine.reg_read(Register::Edx), Ok(0xCAFE_F00D));
}

#[test]
fn mem_fault_hook_can_map_memory_and_retry() {
    // mov ecx, [0x2000010]
    let code = [0x8B, 0x0D, 0x10, 0x00, 0x00, 0x02];
    let mut engine = engine_with(Mode::Protected32, &code);
    let faults = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&faults);
    engine
        .hook_add(
            Hook::mem_fault(move |machine, access, addr, size, _| {
                sink.lock().unwrap().push((access, addr, size));
                machine
                    .mem_map(0x200_0000, 0x1000, Permissions::READ)
                    .unwrap();
                machine.mem_write(addr, &[0x42, 0, 0, 0]).unwrap();
                true
            }),
            AddressRange::ALL,
        )
        .unwrap();

    engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap();

    assert_eq!(
        *faults.lock().unwrap(),
        vec![(AccessKind::Read, 0x200_0010, 4)]
    );
    assert_eq!(engine.reg_read(Register::Ecx), Ok(0x42));
}

#[test]
fn mem_fault_retry_is_attempted_once() {
    // mov [0x3000000], ecx
    let code = [0x89, 0x0D, 0x00, 0x00, 0x00, 0x03];
    let mut engine = engine_with(Mode::Protected32, &code);
    let calls = Arc::new(AtomicU32::new(0));
    let sink = Arc::clone(&calls);
    engine
        .hook_add(
            Hook::mem_fault(move |_, _, _, _, _| {
                sink.fetch_add(1, Ordering::SeqCst);
                true
            }),
            AddressRange::ALL,
        )
        .unwrap();
    assert_eq!(
        engine.start(ADDRESS, end_of(&code), RunOptions::default()),
        Err(EngineError::Fault(Fault::new(
            FaultKind::WriteUnmapped,
            0x300_0000
        )))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn fetch_fault_hook_can_supply_code() {
    init_tracing();
    let mut engine = Engine::new(EngineConfig::with_mode(Mode::Protected32)).unwrap();
    let start = 0x400_0000;
    let fetches = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&fetches);
    engine
        .hook_add(
            Hook::mem_fault(move |machine, access, addr, _, _| {
                assert_eq!(access, AccessKind::Fetch);
                sink.store(addr, Ordering::SeqCst);
                machine.mem_map(addr, 0x1000, Permissions::ALL).unwrap();
                machine.mem_write(addr, &[0x41]).unwrap();
                true
            }),
            AddressRange::ALL,
        )
        .unwrap();
    engine
        .start(start, start + 1, RunOptions::default())
        .unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), start);
    assert_eq!(engine.reg_read(Register::Ecx), Ok(1));
}

#[test]
fn timeout_ends_an_endless_loop() {
    // jmp $
    let code = [0xEB, 0xFE];
    let mut engine = engine_with(Mode::Protected32, &code);
    let outcome = engine
        .start(
            ADDRESS,
            0,
            RunOptions::default().with_timeout(Duration::from_millis(20)),
        )
        .unwrap();
    assert_eq!(outcome, RunOutcome::TimedOut);
    assert_eq!(engine.reg_read(Register::Eip), Ok(ADDRESS));
}

#[test]
fn stop_handle_ends_a_run_from_another_thread() {
    let code = [0xEB, 0xFE];
    let mut engine = engine_with(Mode::Protected32, &code);
    let handle = engine.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        handle.stop();
    });
    let outcome = engine.start(ADDRESS, 0, RunOptions::default()).unwrap();
    stopper.join().unwrap();
    assert_eq!(outcome, RunOutcome::StoppedExternally);
    assert!(outcome.is_user_stop());
}

#[test]
fn hook_statistics_count_every_callback() {
    let code = [0x41, 0x41];
    let mut engine = engine_with(Mode::Protected32, &code);
    engine.hook_add(Hook::code(|_, _, _| {}), AddressRange::ALL).unwrap();
    engine.hook_add(Hook::block(|_, _, _| {}), AddressRange::ALL).unwrap();
    engine
        .start(ADDRESS, end_of(&code), RunOptions::default())
        .unwrap();
    let stats = engine.stats();
    assert_eq!(stats.instructions, 2);
    assert_eq!(stats.blocks, 1);
    assert_eq!(stats.hook_calls, 3);
}
