//! Static opcode table.
//!
//! Every opcode the engine understands is listed once in [`OPCODES`]; the
//! 256-entry [`INSTRUCTION_TABLE`] is built from it at compile time and is
//! what the dispatch loop consults. Bytes without an entry decode to `None`
//! and stop the engine with an invalid-opcode fault.

use serde::Serialize;

/// Opcode that freezes the processor and ends a run.
pub const HALT_OPCODE: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AddressingMode {
    Implied,
    Accumulator,
    Immediate,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
    Relative,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    Indirect,
    /// `(zp,X)`: X is added to the pointer before it is dereferenced.
    IndexedIndirect,
    /// `(zp),Y`: Y is added to the address read through the pointer.
    IndirectIndexed,
}

impl AddressingMode {
    /// Operand bytes that follow the opcode.
    pub const fn operand_len(self) -> u8 {
        match self {
            AddressingMode::Implied | AddressingMode::Accumulator => 0,
            AddressingMode::Immediate
            | AddressingMode::ZeroPage
            | AddressingMode::ZeroPageX
            | AddressingMode::ZeroPageY
            | AddressingMode::Relative
            | AddressingMode::IndexedIndirect
            | AddressingMode::IndirectIndexed => 1,
            AddressingMode::Absolute
            | AddressingMode::AbsoluteX
            | AddressingMode::AbsoluteY
            | AddressingMode::Indirect => 2,
        }
    }
}

macro_rules! mnemonics {
    ($($name:ident),* $(,)?) => {
        #[allow(clippy::upper_case_acronyms)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum Mnemonic {
            $($name),*
        }

        impl Mnemonic {
            pub const fn name(self) -> &'static str {
                match self {
                    $(Mnemonic::$name => stringify!($name)),*
                }
            }
        }
    };
}

mnemonics!(
    ADC, AND, ASL, BCC, BCS, BEQ, BIT, BMI, BNE, BPL, BRK, BVC, BVS, CLC, CLD, CLI, CLV, CMP, CPX,
    CPY, DEC, DEX, DEY, EOR, INC, INX, INY, JMP, JSR, KIL, LDA, LDX, LDY, LSR, NOP, ORA, PHA, PHP,
    PLA, PLP, ROL, ROR, RTS, SBC, SEC, SED, SEI, STA, STX, STY, TAX, TAY, TSX, TXA, TXS, TYA,
);

impl std::fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded form of one opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Instruction {
    pub opcode: u8,
    pub mnemonic: Mnemonic,
    pub mode: AddressingMode,
}

impl Instruction {
    /// Total encoded length, opcode included.
    pub const fn size(&self) -> u8 {
        1 + self.mode.operand_len()
    }
}

use AddressingMode::*;
use Mnemonic::*;

pub const OPCODES: &[(u8, Mnemonic, AddressingMode)] = &[
    // Loads
    (0xA9, LDA, Immediate),
    (0xA5, LDA, ZeroPage),
    (0xB5, LDA, ZeroPageX),
    (0xAD, LDA, Absolute),
    (0xBD, LDA, AbsoluteX),
    (0xB9, LDA, AbsoluteY),
    (0xA1, LDA, IndexedIndirect),
    (0xB1, LDA, IndirectIndexed),
    (0xA2, LDX, Immediate),
    (0xA6, LDX, ZeroPage),
    (0xB6, LDX, ZeroPageY),
    (0xAE, LDX, Absolute),
    (0xBE, LDX, AbsoluteY),
    (0xA0, LDY, Immediate),
    (0xA4, LDY, ZeroPage),
    (0xB4, LDY, ZeroPageX),
    (0xAC, LDY, Absolute),
    (0xBC, LDY, AbsoluteX),
    // Stores
    (0x85, STA, ZeroPage),
    (0x95, STA, ZeroPageX),
    (0x8D, STA, Absolute),
    (0x9D, STA, AbsoluteX),
    (0x99, STA, AbsoluteY),
    (0x81, STA, IndexedIndirect),
    (0x91, STA, IndirectIndexed),
    (0x86, STX, ZeroPage),
    (0x96, STX, ZeroPageY),
    (0x8E, STX, Absolute),
    (0x84, STY, ZeroPage),
    (0x94, STY, ZeroPageX),
    (0x8C, STY, Absolute),
    // Arithmetic
    (0x69, ADC, Immediate),
    (0x65, ADC, ZeroPage),
    (0x75, ADC, ZeroPageX),
    (0x6D, ADC, Absolute),
    (0x7D, ADC, AbsoluteX),
    (0x79, ADC, AbsoluteY),
    (0x61, ADC, IndexedIndirect),
    (0x71, ADC, IndirectIndexed),
    (0xE9, SBC, Immediate),
    (0xE5, SBC, ZeroPage),
    (0xF5, SBC, ZeroPageX),
    (0xED, SBC, Absolute),
    (0xFD, SBC, AbsoluteX),
    (0xF9, SBC, AbsoluteY),
    (0xE1, SBC, IndexedIndirect),
    (0xF1, SBC, IndirectIndexed),
    // Compare
    (0xC9, CMP, Immediate),
    (0xC5, CMP, ZeroPage),
    (0xD5, CMP, ZeroPageX),
    (0xCD, CMP, Absolute),
    (0xDD, CMP, AbsoluteX),
    (0xD9, CMP, AbsoluteY),
    (0xC1, CMP, IndexedIndirect),
    (0xD1, CMP, IndirectIndexed),
    (0xE0, CPX, Immediate),
    (0xE4, CPX, ZeroPage),
    (0xEC, CPX, Absolute),
    (0xC0, CPY, Immediate),
    (0xC4, CPY, ZeroPage),
    (0xCC, CPY, Absolute),
    // Logical
    (0x29, AND, Immediate),
    (0x25, AND, ZeroPage),
    (0x35, AND, ZeroPageX),
    (0x2D, AND, Absolute),
    (0x3D, AND, AbsoluteX),
    (0x39, AND, AbsoluteY),
    (0x21, AND, IndexedIndirect),
    (0x31, AND, IndirectIndexed),
    (0x09, ORA, Immediate),
    (0x05, ORA, ZeroPage),
    (0x15, ORA, ZeroPageX),
    (0x0D, ORA, Absolute),
    (0x1D, ORA, AbsoluteX),
    (0x19, ORA, AbsoluteY),
    (0x01, ORA, IndexedIndirect),
    (0x11, ORA, IndirectIndexed),
    (0x49, EOR, Immediate),
    (0x45, EOR, ZeroPage),
    (0x55, EOR, ZeroPageX),
    (0x4D, EOR, Absolute),
    (0x5D, EOR, AbsoluteX),
    (0x59, EOR, AbsoluteY),
    (0x41, EOR, IndexedIndirect),
    (0x51, EOR, IndirectIndexed),
    (0x24, BIT, ZeroPage),
    (0x2C, BIT, Absolute),
    // Shifts and rotates
    (0x0A, ASL, Accumulator),
    (0x06, ASL, ZeroPage),
    (0x16, ASL, ZeroPageX),
    (0x0E, ASL, Absolute),
    (0x1E, ASL, AbsoluteX),
    (0x4A, LSR, Accumulator),
    (0x46, LSR, ZeroPage),
    (0x56, LSR, ZeroPageX),
    (0x4E, LSR, Absolute),
    (0x5E, LSR, AbsoluteX),
    (0x2A, ROL, Accumulator),
    (0x26, ROL, ZeroPage),
    (0x36, ROL, ZeroPageX),
    (0x2E, ROL, Absolute),
    (0x3E, ROL, AbsoluteX),
    (0x6A, ROR, Accumulator),
    (0x66, ROR, ZeroPage),
    (0x76, ROR, ZeroPageX),
    (0x6E, ROR, Absolute),
    (0x7E, ROR, AbsoluteX),
    // Increment / decrement
    (0xE6, INC, ZeroPage),
    (0xF6, INC, ZeroPageX),
    (0xEE, INC, Absolute),
    (0xFE, INC, AbsoluteX),
    (0xC6, DEC, ZeroPage),
    (0xD6, DEC, ZeroPageX),
    (0xCE, DEC, Absolute),
    (0xDE, DEC, AbsoluteX),
    (0xE8, INX, Implied),
    (0xC8, INY, Implied),
    (0xCA, DEX, Implied),
    (0x88, DEY, Implied),
    // Transfers
    (0xAA, TAX, Implied),
    (0xA8, TAY, Implied),
    (0x8A, TXA, Implied),
    (0x98, TYA, Implied),
    (0xBA, TSX, Implied),
    (0x9A, TXS, Implied),
    // Stack
    (0x48, PHA, Implied),
    (0x68, PLA, Implied),
    (0x08, PHP, Implied),
    (0x28, PLP, Implied),
    // Jumps and subroutines
    (0x4C, JMP, Absolute),
    (0x6C, JMP, Indirect),
    (0x20, JSR, Absolute),
    (0x60, RTS, Implied),
    // Branches
    (0x90, BCC, Relative),
    (0xB0, BCS, Relative),
    (0xF0, BEQ, Relative),
    (0xD0, BNE, Relative),
    (0x30, BMI, Relative),
    (0x10, BPL, Relative),
    (0x50, BVC, Relative),
    (0x70, BVS, Relative),
    // Flags
    (0x18, CLC, Implied),
    (0x38, SEC, Implied),
    (0x58, CLI, Implied),
    (0x78, SEI, Implied),
    (0xD8, CLD, Implied),
    (0xF8, SED, Implied),
    (0xB8, CLV, Implied),
    // System
    (0xEA, NOP, Implied),
    (0x00, BRK, Implied),
    (HALT_OPCODE, KIL, Implied),
];

const fn build_table() -> [Option<Instruction>; 256] {
    let mut table: [Option<Instruction>; 256] = [None; 256];
    let mut i = 0;
    while i < OPCODES.len() {
        let (opcode, mnemonic, mode) = OPCODES[i];
        table[opcode as usize] = Some(Instruction { opcode, mnemonic, mode });
        i += 1;
    }
    table
}

pub static INSTRUCTION_TABLE: [Option<Instruction>; 256] = build_table();

pub fn decode(opcode: u8) -> Option<&'static Instruction> {
    INSTRUCTION_TABLE[opcode as usize].as_ref()
}

/// Mnemonic for metrics labels and traces; `"???"` for unassigned bytes.
pub fn instruction_name(opcode: u8) -> &'static str {
    decode(opcode).map_or("???", |instruction| instruction.mnemonic.name())
}
