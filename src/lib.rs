//! # MOS 6502 CPU Emulator
//!
//! An instruction-level emulator of the MOS 6502 8-bit microprocessor.
//! Opcodes are decoded through a static 256-entry table, operands are
//! resolved per addressing mode with the hardware's zero-page and
//! `JMP ($xxFF)` wraparound quirks, and the status register is updated bit
//! for bit the way the NMOS part does it.
//!
//! ## Features
//!
//! - All documented instructions except RTI, plus `KIL` ($02) as a halt
//! - Binary ADC/SBC with exact carry and overflow semantics
//! - Typed faults for unassigned opcodes, reported with the faulting PC
//! - EF and raw executable images
//! - Sessions with snapshots, an HTTP API and Prometheus metrics
//!
//! ## Example
//!
//! ```rust
//! use mos6502_core::cpu::CPU;
//! use mos6502_core::memory::Memory;
//!
//! let mut cpu = CPU::new();
//! let mut memory = Memory::new();
//!
//! // LDA #$02; ADC #$05; KIL
//! memory.load(0x8000, &[0xA9, 0x02, 0x69, 0x05, 0x02]);
//!
//! cpu.reset(0x8000);
//! let executed = cpu.run(&mut memory).unwrap();
//!
//! assert_eq!(executed, 3);
//! assert_eq!(cpu.get_register_a(), 0x07);
//! assert!(cpu.is_halted());
//! ```

#![recursion_limit = "256"]

pub mod config;
pub mod cpu;
pub mod emulator;
pub mod error;
pub mod image;
pub mod memory;
pub mod metrics;
pub mod opcodes;
pub mod server;
pub mod snapshots;

pub use config::Config;
pub use cpu::{ExecutionState, CPU};
pub use emulator::Emulator;
pub use error::{ConfigError, EmulatorError, ImageError, SnapshotError};
pub use image::Image;
pub use memory::Memory;
pub use snapshots::Snapshot;
