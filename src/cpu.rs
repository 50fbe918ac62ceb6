use log::trace;
use serde::{Deserialize, Serialize};

use crate::error::EmulatorError;
use crate::memory::Memory;
use crate::opcodes::{self, AddressingMode, Mnemonic};

// Status register flags
pub const CARRY_FLAG: u8 = 0x01;
pub const ZERO_FLAG: u8 = 0x02;
pub const INTERRUPT_DISABLE: u8 = 0x04;
pub const DECIMAL_MODE: u8 = 0x08;
pub const BREAK_COMMAND: u8 = 0x10;
pub const UNUSED_FLAG: u8 = 0x20;
pub const OVERFLOW_FLAG: u8 = 0x40;
pub const NEGATIVE_FLAG: u8 = 0x80;

pub const ALL_FLAGS: [u8; 8] = [
    CARRY_FLAG,
    ZERO_FLAG,
    INTERRUPT_DISABLE,
    DECIMAL_MODE,
    BREAK_COMMAND,
    UNUSED_FLAG,
    OVERFLOW_FLAG,
    NEGATIVE_FLAG,
];

/// Base address of the stack page; SP is an offset into it.
pub const STACK_BASE: u16 = 0x0100;
pub const STACK_TOP: u8 = 0xFF;
pub const RESET_VECTOR: u16 = 0xFFFC;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Running,
    Halted,
}

/// Every status bit by name, for state dumps and JSON responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusFlags {
    pub negative: bool,
    pub overflow: bool,
    pub unused: bool,
    pub break_command: bool,
    pub decimal: bool,
    pub interrupt_disable: bool,
    pub zero: bool,
    pub carry: bool,
}

/// Result of operand resolution. Addresses are computed here; the data
/// behind them is only touched by the instruction that needs it, so stores
/// never perform a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Implied,
    Accumulator,
    Immediate(u8),
    Address(u16),
}

#[derive(Debug)]
pub struct CPU {
    a: u8,
    x: u8,
    y: u8,
    pc: u16,
    sp: u8,
    status: u8,

    state: ExecutionState,
    // One tick per memory access made by the engine
    cycles: u64,
    instructions: u64,
}

impl CPU {
    pub fn new() -> Self {
        CPU {
            a: 0,
            x: 0,
            y: 0,
            pc: 0,
            sp: STACK_TOP,
            status: 0,
            state: ExecutionState::Running,
            cycles: 0,
            instructions: 0,
        }
    }

    /// Zero the register file, clear every flag and point PC at `entry_point`.
    /// Memory is left alone.
    pub fn reset(&mut self, entry_point: u16) {
        self.a = 0;
        self.x = 0;
        self.y = 0;
        self.sp = STACK_TOP;
        self.status = 0;
        self.pc = entry_point;
        self.state = ExecutionState::Running;
        self.cycles = 0;
        self.instructions = 0;
        log::debug!("cpu reset, entry point ${:04X}", entry_point);
    }

    /// Reset using the little-endian word stored at the reset vector.
    pub fn reset_from_vector(&mut self, memory: &Memory) {
        self.reset(memory.read_u16(RESET_VECTOR));
    }

    /// Execute exactly one instruction.
    ///
    /// A halted CPU stays halted and this returns `Ok(Halted)` without
    /// touching memory. An unassigned opcode halts the CPU and reports the
    /// byte together with the address it was fetched from.
    pub fn step(&mut self, memory: &mut Memory) -> Result<ExecutionState, EmulatorError> {
        if self.state == ExecutionState::Halted {
            return Ok(ExecutionState::Halted);
        }

        let pc = self.pc;
        let opcode = self.fetch_byte(memory);
        let instruction = match opcodes::decode(opcode) {
            Some(instruction) => instruction,
            None => {
                self.state = ExecutionState::Halted;
                return Err(EmulatorError::InvalidOpcode { opcode, pc });
            }
        };

        trace!(
            "${:04X}  {:02X}  {} {:?}  A={:02X} X={:02X} Y={:02X} SP={:02X} P={:02X}",
            pc,
            opcode,
            instruction.mnemonic,
            instruction.mode,
            self.a,
            self.x,
            self.y,
            self.sp,
            self.status
        );

        let operand = self.resolve_operand(memory, instruction.mode);
        self.execute(memory, instruction.mnemonic, operand);
        self.instructions += 1;

        Ok(self.state)
    }

    /// Run until a halt opcode or a fault. Returns the number of
    /// instructions executed by this call.
    pub fn run(&mut self, memory: &mut Memory) -> Result<u64, EmulatorError> {
        let start = self.instructions;
        while self.step(memory)? == ExecutionState::Running {}
        Ok(self.instructions - start)
    }

    /// Run at most `max_steps` instructions.
    pub fn run_for(&mut self, memory: &mut Memory, max_steps: u64) -> Result<u64, EmulatorError> {
        let start = self.instructions;
        for _ in 0..max_steps {
            if self.step(memory)? == ExecutionState::Halted {
                break;
            }
        }
        Ok(self.instructions - start)
    }

    // Getters
    pub fn get_register_a(&self) -> u8 { self.a }
    pub fn get_register_x(&self) -> u8 { self.x }
    pub fn get_register_y(&self) -> u8 { self.y }
    pub fn get_pc(&self) -> u16 { self.pc }
    pub fn get_sp(&self) -> u8 { self.sp }
    pub fn get_status(&self) -> u8 { self.status }
    pub fn get_cycles(&self) -> u64 { self.cycles }
    pub fn get_instructions(&self) -> u64 { self.instructions }
    pub fn state(&self) -> ExecutionState { self.state }
    pub fn is_halted(&self) -> bool { self.state == ExecutionState::Halted }

    pub fn flags(&self) -> StatusFlags {
        StatusFlags {
            negative: self.get_flag(NEGATIVE_FLAG),
            overflow: self.get_flag(OVERFLOW_FLAG),
            unused: self.get_flag(UNUSED_FLAG),
            break_command: self.get_flag(BREAK_COMMAND),
            decimal: self.get_flag(DECIMAL_MODE),
            interrupt_disable: self.get_flag(INTERRUPT_DISABLE),
            zero: self.get_flag(ZERO_FLAG),
            carry: self.get_flag(CARRY_FLAG),
        }
    }

    // Setters, used by snapshot restore and tests
    pub fn set_register_a(&mut self, value: u8) { self.a = value; }
    pub fn set_register_x(&mut self, value: u8) { self.x = value; }
    pub fn set_register_y(&mut self, value: u8) { self.y = value; }
    pub fn set_pc(&mut self, value: u16) { self.pc = value; }
    pub fn set_sp(&mut self, value: u8) { self.sp = value; }
    pub fn set_state(&mut self, state: ExecutionState) { self.state = state; }

    pub fn set_counters(&mut self, cycles: u64, instructions: u64) {
        self.cycles = cycles;
        self.instructions = instructions;
    }

    /// Copy every bit of `status` into the register, one named flag at a time.
    pub fn set_flags_from(&mut self, status: u8) {
        for flag in ALL_FLAGS {
            self.set_flag(flag, status & flag != 0);
        }
    }

    // Flag operations
    pub fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.status |= flag;
        } else {
            self.status &= !flag;
        }
    }

    pub fn get_flag(&self, flag: u8) -> bool {
        (self.status & flag) != 0
    }

    /// The single Z/N update shared by every instruction family.
    fn update_zero_and_negative_flags(&mut self, value: u8) {
        self.set_flag(ZERO_FLAG, value == 0);
        self.set_flag(NEGATIVE_FLAG, (value & 0x80) != 0);
    }

    // Bus access. Every access goes through here so the counter stays exact.
    fn fetch_byte(&mut self, memory: &Memory) -> u8 {
        let value = self.read_byte(memory, self.pc);
        self.pc = self.pc.wrapping_add(1);
        value
    }

    fn fetch_word(&mut self, memory: &Memory) -> u16 {
        let low = self.fetch_byte(memory) as u16;
        let high = self.fetch_byte(memory) as u16;
        (high << 8) | low
    }

    fn read_byte(&mut self, memory: &Memory, address: u16) -> u8 {
        self.cycles += 1;
        memory.read(address)
    }

    fn write_byte(&mut self, memory: &mut Memory, address: u16, value: u8) {
        self.cycles += 1;
        memory.write(address, value);
    }

    // Pointer stored in the zero page; the high byte wraps to $00 after $FF
    fn read_zero_page_word(&mut self, memory: &Memory, pointer: u8) -> u16 {
        let low = self.read_byte(memory, pointer as u16) as u16;
        let high = self.read_byte(memory, pointer.wrapping_add(1) as u16) as u16;
        (high << 8) | low
    }

    fn resolve_operand(&mut self, memory: &Memory, mode: AddressingMode) -> Operand {
        match mode {
            AddressingMode::Implied => Operand::Implied,
            AddressingMode::Accumulator => Operand::Accumulator,
            AddressingMode::Immediate => Operand::Immediate(self.fetch_byte(memory)),
            AddressingMode::ZeroPage => Operand::Address(self.fetch_byte(memory) as u16),
            AddressingMode::ZeroPageX => {
                let base = self.fetch_byte(memory);
                Operand::Address(base.wrapping_add(self.x) as u16)
            }
            AddressingMode::ZeroPageY => {
                let base = self.fetch_byte(memory);
                Operand::Address(base.wrapping_add(self.y) as u16)
            }
            AddressingMode::Relative => {
                let offset = self.fetch_byte(memory) as i8;
                // Relative to the address after the operand; i8 -> u16 sign-extends
                Operand::Address(self.pc.wrapping_add(offset as u16))
            }
            AddressingMode::Absolute => Operand::Address(self.fetch_word(memory)),
            AddressingMode::AbsoluteX => {
                let base = self.fetch_word(memory);
                Operand::Address(base.wrapping_add(self.x as u16))
            }
            AddressingMode::AbsoluteY => {
                let base = self.fetch_word(memory);
                Operand::Address(base.wrapping_add(self.y as u16))
            }
            AddressingMode::Indirect => {
                let pointer = self.fetch_word(memory);
                // NMOS bug: the high byte never leaves the pointer's page
                let low = self.read_byte(memory, pointer) as u16;
                let high_address = (pointer & 0xFF00) | (pointer.wrapping_add(1) & 0x00FF);
                let high = self.read_byte(memory, high_address) as u16;
                Operand::Address((high << 8) | low)
            }
            AddressingMode::IndexedIndirect => {
                let pointer = self.fetch_byte(memory).wrapping_add(self.x);
                Operand::Address(self.read_zero_page_word(memory, pointer))
            }
            AddressingMode::IndirectIndexed => {
                let pointer = self.fetch_byte(memory);
                let base = self.read_zero_page_word(memory, pointer);
                Operand::Address(base.wrapping_add(self.y as u16))
            }
        }
    }

    fn load_operand(&mut self, memory: &Memory, operand: Operand) -> u8 {
        match operand {
            Operand::Immediate(value) => value,
            Operand::Address(address) => self.read_byte(memory, address),
            Operand::Accumulator => self.a,
            Operand::Implied => 0,
        }
    }

    fn store_operand(&mut self, memory: &mut Memory, operand: Operand, value: u8) {
        match operand {
            Operand::Address(address) => self.write_byte(memory, address, value),
            Operand::Accumulator => self.a = value,
            Operand::Immediate(_) | Operand::Implied => {}
        }
    }

    fn execute(&mut self, memory: &mut Memory, mnemonic: Mnemonic, operand: Operand) {
        match mnemonic {
            // Loads and stores
            Mnemonic::LDA => {
                self.a = self.load_operand(memory, operand);
                self.update_zero_and_negative_flags(self.a);
            }
            Mnemonic::LDX => {
                self.x = self.load_operand(memory, operand);
                self.update_zero_and_negative_flags(self.x);
            }
            Mnemonic::LDY => {
                self.y = self.load_operand(memory, operand);
                self.update_zero_and_negative_flags(self.y);
            }
            Mnemonic::STA => self.store_operand(memory, operand, self.a),
            Mnemonic::STX => self.store_operand(memory, operand, self.x),
            Mnemonic::STY => self.store_operand(memory, operand, self.y),

            // Arithmetic
            Mnemonic::ADC => {
                let value = self.load_operand(memory, operand);
                self.add_with_carry(value);
            }
            Mnemonic::SBC => {
                let value = self.load_operand(memory, operand);
                self.subtract_with_carry(value);
            }
            Mnemonic::CMP => {
                let value = self.load_operand(memory, operand);
                self.compare(self.a, value);
            }
            Mnemonic::CPX => {
                let value = self.load_operand(memory, operand);
                self.compare(self.x, value);
            }
            Mnemonic::CPY => {
                let value = self.load_operand(memory, operand);
                self.compare(self.y, value);
            }

            // Logical
            Mnemonic::AND => {
                let value = self.load_operand(memory, operand);
                self.a &= value;
                self.update_zero_and_negative_flags(self.a);
            }
            Mnemonic::ORA => {
                let value = self.load_operand(memory, operand);
                self.a |= value;
                self.update_zero_and_negative_flags(self.a);
            }
            Mnemonic::EOR => {
                let value = self.load_operand(memory, operand);
                self.a ^= value;
                self.update_zero_and_negative_flags(self.a);
            }
            Mnemonic::BIT => {
                let value = self.load_operand(memory, operand);
                self.bit_test(value);
            }

            // Read-modify-write
            Mnemonic::ASL | Mnemonic::LSR | Mnemonic::ROL | Mnemonic::ROR => {
                let value = self.load_operand(memory, operand);
                let result = self.shift(mnemonic, value);
                self.store_operand(memory, operand, result);
            }
            Mnemonic::INC => {
                let value = self.load_operand(memory, operand).wrapping_add(1);
                self.store_operand(memory, operand, value);
                self.update_zero_and_negative_flags(value);
            }
            Mnemonic::DEC => {
                let value = self.load_operand(memory, operand).wrapping_sub(1);
                self.store_operand(memory, operand, value);
                self.update_zero_and_negative_flags(value);
            }
            Mnemonic::INX => {
                self.x = self.x.wrapping_add(1);
                self.update_zero_and_negative_flags(self.x);
            }
            Mnemonic::INY => {
                self.y = self.y.wrapping_add(1);
                self.update_zero_and_negative_flags(self.y);
            }
            Mnemonic::DEX => {
                self.x = self.x.wrapping_sub(1);
                self.update_zero_and_negative_flags(self.x);
            }
            Mnemonic::DEY => {
                self.y = self.y.wrapping_sub(1);
                self.update_zero_and_negative_flags(self.y);
            }

            // Transfers
            Mnemonic::TAX => {
                self.x = self.a;
                self.update_zero_and_negative_flags(self.x);
            }
            Mnemonic::TAY => {
                self.y = self.a;
                self.update_zero_and_negative_flags(self.y);
            }
            Mnemonic::TXA => {
                self.a = self.x;
                self.update_zero_and_negative_flags(self.a);
            }
            Mnemonic::TYA => {
                self.a = self.y;
                self.update_zero_and_negative_flags(self.a);
            }
            Mnemonic::TSX => {
                self.x = self.sp;
                self.update_zero_and_negative_flags(self.x);
            }
            Mnemonic::TXS => self.sp = self.x,

            // Stack
            Mnemonic::PHA => self.push(memory, self.a),
            Mnemonic::PLA => {
                self.a = self.pop(memory);
                self.update_zero_and_negative_flags(self.a);
            }
            Mnemonic::PHP => {
                // The pushed copy always has B and the unused bit set
                self.push(memory, self.status | BREAK_COMMAND | UNUSED_FLAG);
            }
            Mnemonic::PLP => {
                let value = self.pop(memory);
                self.restore_status(value);
            }

            // Control transfer
            Mnemonic::JMP => {
                if let Operand::Address(target) = operand {
                    self.pc = target;
                }
            }
            Mnemonic::JSR => {
                if let Operand::Address(target) = operand {
                    // PC now sits past the operand; push the address of its last byte
                    let return_addr = self.pc.wrapping_sub(1);
                    self.push_u16(memory, return_addr);
                    self.pc = target;
                }
            }
            Mnemonic::RTS => {
                self.pc = self.pop_u16(memory).wrapping_add(1);
            }
            Mnemonic::BCC => self.branch_if(operand, !self.get_flag(CARRY_FLAG)),
            Mnemonic::BCS => self.branch_if(operand, self.get_flag(CARRY_FLAG)),
            Mnemonic::BEQ => self.branch_if(operand, self.get_flag(ZERO_FLAG)),
            Mnemonic::BNE => self.branch_if(operand, !self.get_flag(ZERO_FLAG)),
            Mnemonic::BMI => self.branch_if(operand, self.get_flag(NEGATIVE_FLAG)),
            Mnemonic::BPL => self.branch_if(operand, !self.get_flag(NEGATIVE_FLAG)),
            Mnemonic::BVC => self.branch_if(operand, !self.get_flag(OVERFLOW_FLAG)),
            Mnemonic::BVS => self.branch_if(operand, self.get_flag(OVERFLOW_FLAG)),

            // Flag manipulation
            Mnemonic::CLC => self.set_flag(CARRY_FLAG, false),
            Mnemonic::SEC => self.set_flag(CARRY_FLAG, true),
            Mnemonic::CLI => self.set_flag(INTERRUPT_DISABLE, false),
            Mnemonic::SEI => self.set_flag(INTERRUPT_DISABLE, true),
            Mnemonic::CLD => self.set_flag(DECIMAL_MODE, false),
            Mnemonic::SED => self.set_flag(DECIMAL_MODE, true),
            Mnemonic::CLV => self.set_flag(OVERFLOW_FLAG, false),

            // System
            Mnemonic::NOP => {}
            Mnemonic::BRK => {
                // No interrupt vectoring: BRK marks the break and stops
                self.set_flag(BREAK_COMMAND, true);
                self.state = ExecutionState::Halted;
                log::debug!("BRK at ${:04X}", self.pc.wrapping_sub(1));
            }
            Mnemonic::KIL => {
                self.state = ExecutionState::Halted;
                log::debug!("halted at ${:04X}", self.pc.wrapping_sub(1));
            }
        }
    }

    fn add_with_carry(&mut self, value: u8) {
        let carry = self.get_flag(CARRY_FLAG) as u16;
        let result = self.a as u16 + value as u16 + carry;

        // Signed overflow: both inputs share a sign that the result lacks
        let overflow = (!(self.a ^ value) & (self.a ^ result as u8) & 0x80) != 0;

        self.set_flag(CARRY_FLAG, result > 0xFF);
        self.set_flag(OVERFLOW_FLAG, overflow);

        self.a = result as u8;
        self.update_zero_and_negative_flags(self.a);
    }

    // A - M - (1 - C) == A + !M + C in eight bits
    fn subtract_with_carry(&mut self, value: u8) {
        self.add_with_carry(!value);
    }

    fn compare(&mut self, register: u8, value: u8) {
        let result = register.wrapping_sub(value);
        self.set_flag(CARRY_FLAG, register >= value);
        self.update_zero_and_negative_flags(result);
    }

    fn bit_test(&mut self, value: u8) {
        self.set_flag(ZERO_FLAG, self.a & value == 0);
        self.set_flag(NEGATIVE_FLAG, value & 0x80 != 0);
        self.set_flag(OVERFLOW_FLAG, value & 0x40 != 0);
    }

    fn shift(&mut self, mnemonic: Mnemonic, value: u8) -> u8 {
        let carry_in = self.get_flag(CARRY_FLAG) as u8;
        let (result, carry_out) = match mnemonic {
            Mnemonic::ASL => (value << 1, value & 0x80 != 0),
            Mnemonic::LSR => (value >> 1, value & 0x01 != 0),
            Mnemonic::ROL => ((value << 1) | carry_in, value & 0x80 != 0),
            Mnemonic::ROR => ((value >> 1) | (carry_in << 7), value & 0x01 != 0),
            _ => (value, self.get_flag(CARRY_FLAG)),
        };
        self.set_flag(CARRY_FLAG, carry_out);
        self.update_zero_and_negative_flags(result);
        result
    }

    // B and the unused bit only exist in the pushed copy
    fn restore_status(&mut self, value: u8) {
        for flag in ALL_FLAGS {
            if flag == BREAK_COMMAND || flag == UNUSED_FLAG {
                continue;
            }
            self.set_flag(flag, value & flag != 0);
        }
    }

    fn branch_if(&mut self, operand: Operand, condition: bool) {
        if let (true, Operand::Address(target)) = (condition, operand) {
            self.pc = target;
        }
    }

    // Stack operations
    pub fn push(&mut self, memory: &mut Memory, value: u8) {
        self.write_byte(memory, STACK_BASE + self.sp as u16, value);
        self.sp = self.sp.wrapping_sub(1);
    }

    pub fn pop(&mut self, memory: &Memory) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        self.read_byte(memory, STACK_BASE + self.sp as u16)
    }

    // High byte first, so the low byte ends up at the lower address
    fn push_u16(&mut self, memory: &mut Memory, value: u16) {
        self.push(memory, (value >> 8) as u8);
        self.push(memory, (value & 0xFF) as u8);
    }

    fn pop_u16(&mut self, memory: &Memory) -> u16 {
        let low = self.pop(memory) as u16;
        let high = self.pop(memory) as u16;
        (high << 8) | low
    }
}

impl Default for CPU {
    fn default() -> Self {
        Self::new()
    }
}
