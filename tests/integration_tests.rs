use mos6502_core::cpu::{CARRY_FLAG, CPU, NEGATIVE_FLAG, OVERFLOW_FLAG, ZERO_FLAG};
use mos6502_core::emulator::Emulator;
use mos6502_core::image::Image;
use mos6502_core::memory::Memory;
use mos6502_core::EmulatorError;

fn boot(program: &[u8]) -> (CPU, Memory) {
    let mut cpu = CPU::new();
    let mut memory = Memory::new();
    memory.load(0x8000, program);
    cpu.reset(0x8000);
    (cpu, memory)
}

#[test]
fn test_simple_calculation() {
    // Calculate 10 + 20 + 30 and store result
    let program = [
        0xA9, 0x0A, // LDA #$0A    ; A = 10
        0x69, 0x14, // ADC #$14    ; A = 30
        0x69, 0x1E, // ADC #$1E    ; A = 60
        0x85, 0x50, // STA $50
        0x02,       // KIL
    ];
    let (mut cpu, mut memory) = boot(&program);

    assert_eq!(cpu.run(&mut memory).unwrap(), 5);
    assert_eq!(cpu.get_register_a(), 60);
    assert_eq!(memory.read(0x50), 60);
    assert!(cpu.is_halted());
}

#[test]
fn test_memory_copy_loop() {
    // Copy 8 bytes from $0300 to $0400
    let program = [
        0xA2, 0x00,       // LDX #$00
        0xBD, 0x00, 0x03, // loop: LDA $0300,X
        0x9D, 0x00, 0x04, // STA $0400,X
        0xE8,             // INX
        0xE0, 0x08,       // CPX #$08
        0xD0, 0xF5,       // BNE loop
        0x02,             // KIL
    ];
    let (mut cpu, mut memory) = boot(&program);
    memory.load(0x0300, &[1, 2, 3, 4, 5, 6, 7, 8]);

    cpu.run(&mut memory).unwrap();

    for i in 0..8u16 {
        assert_eq!(memory.read(0x0400 + i), (i + 1) as u8);
    }
    assert_eq!(cpu.get_register_x(), 8);
    assert!(cpu.get_flag(ZERO_FLAG));
    assert!(cpu.get_flag(CARRY_FLAG));
}

#[test]
fn test_sixteen_bit_addition() {
    // $12FF + $0101 using the carry between bytes, result at $20/$21
    let program = [
        0x18,       // CLC
        0xA9, 0xFF, // LDA #$FF
        0x69, 0x01, // ADC #$01
        0x85, 0x20, // STA $20
        0xA9, 0x12, // LDA #$12
        0x69, 0x01, // ADC #$01
        0x85, 0x21, // STA $21
        0x02,       // KIL
    ];
    let (mut cpu, mut memory) = boot(&program);
    cpu.run(&mut memory).unwrap();

    assert_eq!(memory.read_u16(0x20), 0x1400);
    assert!(!cpu.get_flag(CARRY_FLAG));
}

#[test]
fn test_multiply_by_shift_and_add() {
    // 13 * 10 = (13 << 3) + (13 << 1), result at $10
    let program = [
        0xA9, 0x0D, // LDA #13
        0x0A,       // ASL A   ; 26
        0x85, 0x10, // STA $10
        0x0A,       // ASL A   ; 52
        0x0A,       // ASL A   ; 104
        0x18,       // CLC
        0x65, 0x10, // ADC $10 ; 130
        0x85, 0x10, // STA $10
        0x02,       // KIL
    ];
    let (mut cpu, mut memory) = boot(&program);
    cpu.run(&mut memory).unwrap();

    assert_eq!(memory.read(0x10), 130);
    assert!(cpu.get_flag(NEGATIVE_FLAG));
    assert!(cpu.get_flag(OVERFLOW_FLAG));
}

#[test]
fn test_subroutine_preserves_stack() {
    // Subroutine doubles A; called twice
    let program = [
        0xA9, 0x03,       // LDA #$03
        0x20, 0x00, 0x90, // JSR double
        0x20, 0x00, 0x90, // JSR double
        0x02,             // KIL
    ];
    let (mut cpu, mut memory) = boot(&program);
    memory.load(0x9000, &[0x0A, 0x60]); // double: ASL A; RTS

    cpu.run(&mut memory).unwrap();

    assert_eq!(cpu.get_register_a(), 12);
    assert_eq!(cpu.get_sp(), 0xFF);
    assert_eq!(cpu.get_pc(), 0x8009);
}

#[test]
fn test_stack_round_trip_through_program() {
    let program = [
        0xA9, 0x11, // LDA #$11
        0x48,       // PHA
        0xA9, 0x22, // LDA #$22
        0x48,       // PHA
        0x68,       // PLA
        0xAA,       // TAX
        0x68,       // PLA
        0x02,       // KIL
    ];
    let (mut cpu, mut memory) = boot(&program);
    cpu.run(&mut memory).unwrap();

    assert_eq!(cpu.get_register_x(), 0x22);
    assert_eq!(cpu.get_register_a(), 0x11);
    assert_eq!(cpu.get_sp(), 0xFF);
    assert_eq!(memory.read(0x01FF), 0x11);
    assert_eq!(memory.read(0x01FE), 0x22);
}

#[test]
fn test_indirect_table_walk() {
    // Sum three bytes through a pointer at $F0 with (zp),Y
    let program = [
        0xA0, 0x00, // LDY #$00
        0xA9, 0x00, // LDA #$00
        0x18,       // loop: CLC
        0x71, 0xF0, // ADC ($F0),Y
        0xC8,       // INY
        0xC0, 0x03, // CPY #$03
        0xD0, 0xF8, // BNE loop
        0x02,       // KIL
    ];
    let (mut cpu, mut memory) = boot(&program);
    memory.write_u16(0x00F0, 0x4000);
    memory.load(0x4000, &[5, 10, 20]);

    cpu.run(&mut memory).unwrap();
    assert_eq!(cpu.get_register_a(), 35);
}

#[test]
fn test_invalid_opcode_reports_location() {
    let (mut cpu, mut memory) = boot(&[0xEA, 0xEA, 0xFF]);
    let err = cpu.run(&mut memory).unwrap_err();

    assert_eq!(err, EmulatorError::InvalidOpcode { opcode: 0xFF, pc: 0x8002 });
    assert_eq!(cpu.get_instructions(), 2);
    assert!(cpu.is_halted());
}

#[test]
fn test_brk_stops_execution() {
    let (mut cpu, mut memory) = boot(&[0xA9, 0x01, 0x00, 0xA9, 0x02]);
    cpu.run(&mut memory).unwrap();
    assert_eq!(cpu.get_register_a(), 0x01);
    assert_eq!(cpu.get_pc(), 0x8003);
}

#[test]
fn test_ef_image_runs_in_session() {
    let payload = [0xA9, 0x02, 0x69, 0x05, 0x02];
    let bytes = Image::encode_ef(&payload).unwrap();
    let image = Image::from_bytes(&bytes).unwrap();

    let mut emulator = Emulator::new("integration");
    emulator.reset(0x0600);
    emulator.load_image(&image, 0x0600).unwrap();
    emulator.run().unwrap();

    let state = emulator.state();
    assert_eq!(state.a, 0x07);
    assert_eq!(state.pc, 0x0605);
    assert!(state.halted);
    assert!(!state.flags.carry && !state.flags.zero && !state.flags.negative);
}

#[test]
fn test_snapshot_resumes_mid_program() {
    // INX five times, snapshot after two
    let mut emulator = Emulator::new("resume");
    emulator.reset(0x8000);
    emulator.load_program(0x8000, &[0xE8, 0xE8, 0xE8, 0xE8, 0xE8, 0x02]).unwrap();
    emulator.run_for(2).unwrap();
    let snapshot = emulator.snapshot("two");

    emulator.run().unwrap();
    assert_eq!(emulator.state().x, 5);

    let mut fresh = Emulator::new("fresh");
    fresh.restore(&snapshot).unwrap();
    assert_eq!(fresh.state().x, 2);
    fresh.run().unwrap();
    assert_eq!(fresh.state().x, 5);
    assert_eq!(fresh.state().instructions, 6);
}
