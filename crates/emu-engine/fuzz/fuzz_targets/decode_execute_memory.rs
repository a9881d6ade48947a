#![no_main]

use emu_engine::{
    validate_mapping_range, validate_scalar_width, AddressRange, Decoder, Engine, EngineConfig,
    Hook, Mode, Permissions, RunOptions, DEFAULT_PAGE_SIZE,
};
use libfuzzer_sys::fuzz_target;

const CODE: u64 = 0x1000;
const DATA: u64 = 0x10_0000;

fuzz_target!(|data: &[u8]| {
    if data.len() < 3 {
        return;
    }

    let mode = match data[0] % 3 {
        0 => Mode::Real16,
        1 => Mode::Protected32,
        _ => Mode::Long64,
    };
    let code = &data[2..];

    let _ = Decoder::decode(mode, CODE, code);
    let _ = validate_scalar_width(data[1]);
    let _ = validate_mapping_range(u64::from(data[1]) << 12, u64::from(data[0]) << 12, DEFAULT_PAGE_SIZE);

    let Ok(mut engine) = Engine::new(EngineConfig::with_mode(mode)) else {
        return;
    };
    if engine.mem_map(CODE, 0x1000, Permissions::ALL).is_err()
        || engine.mem_map(DATA, 0x1000, Permissions::READ | Permissions::WRITE).is_err()
        || engine.mem_write(CODE, &code[..code.len().min(0x1000)]).is_err()
    {
        return;
    }
    let _ = engine.hook_add(Hook::interrupt(|machine, _| machine.stop()), AddressRange::ALL);
    let _ = engine.hook_add(Hook::mem_fault(|_, _, _, _, _| false), AddressRange::ALL);

    let options = RunOptions::unbounded().with_count(u64::from(data[1]) + 1);
    let _ = engine.start(CODE, CODE + code.len() as u64, options);
});
