use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;

use crate::cpu::{ExecutionState, StatusFlags, CPU};
use crate::error::{EmulatorError, ImageError, SnapshotError};
use crate::image::Image;
use crate::memory::Memory;
use crate::metrics::{
    record_emulator_reset, record_fault, record_halt, record_instruction, record_program_load,
    update_cpu_registers, Timer,
};
use crate::opcodes;
use crate::snapshots::Snapshot;

#[derive(Debug, Clone, Serialize)]
pub struct CpuState {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub pc: u16,
    pub sp: u8,
    pub status: u8,
    pub flags: StatusFlags,
    pub cycles: u64,
    pub instructions: u64,
    pub halted: bool,
}

impl CpuState {
    pub fn of(cpu: &CPU) -> Self {
        CpuState {
            a: cpu.get_register_a(),
            x: cpu.get_register_x(),
            y: cpu.get_register_y(),
            pc: cpu.get_pc(),
            sp: cpu.get_sp(),
            status: cpu.get_status(),
            flags: cpu.flags(),
            cycles: cpu.get_cycles(),
            instructions: cpu.get_instructions(),
            halted: cpu.is_halted(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub executed: u64,
    pub halted: bool,
}

/// One emulated machine: a CPU, its 64 KiB of memory and a session id.
///
/// Every instruction executed through an `Emulator` is recorded in the
/// Prometheus metrics.
pub struct Emulator {
    id: String,
    cpu: CPU,
    memory: Memory,
    created_at: DateTime<Utc>,
}

impl Emulator {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_memory(id, Memory::new())
    }

    pub fn with_memory(id: impl Into<String>, memory: Memory) -> Self {
        Emulator {
            id: id.into(),
            cpu: CPU::new(),
            memory,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn cpu(&self) -> &CPU {
        &self.cpu
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn state(&self) -> CpuState {
        CpuState::of(&self.cpu)
    }

    /// Cold reset: clear memory and registers, then point PC at `entry_point`.
    pub fn reset(&mut self, entry_point: u16) {
        self.memory.reset();
        self.cpu.reset(entry_point);
        record_emulator_reset(&self.id);
        self.publish_registers();
    }

    /// Warm reset: registers only, memory is kept.
    pub fn restart(&mut self, entry_point: u16) {
        self.cpu.reset(entry_point);
        record_emulator_reset(&self.id);
        self.publish_registers();
    }

    pub fn load_program(&mut self, address: u16, data: &[u8]) -> Result<usize, ImageError> {
        self.load_image(&Image::raw(data.to_vec()), address)
    }

    pub fn load_image(&mut self, image: &Image, address: u16) -> Result<usize, ImageError> {
        let stored = image.load_into(&mut self.memory, address)?;
        record_program_load(&self.id);
        debug!("[{}] loaded {} bytes at ${:04X}", self.id, stored, address);
        Ok(stored)
    }

    pub fn step(&mut self) -> Result<ExecutionState, EmulatorError> {
        if self.cpu.is_halted() {
            return Ok(ExecutionState::Halted);
        }

        let opcode = self.memory.read(self.cpu.get_pc());
        let accesses_before = self.cpu.get_cycles();
        let timer = Timer::new();

        match self.cpu.step(&mut self.memory) {
            Ok(state) => {
                record_instruction(
                    opcode,
                    opcodes::instruction_name(opcode),
                    self.cpu.get_cycles() - accesses_before,
                    timer.elapsed(),
                );
                if state == ExecutionState::Halted {
                    record_halt();
                    debug!("[{}] halted at ${:04X}", self.id, self.cpu.get_pc());
                }
                Ok(state)
            }
            Err(err) => {
                record_fault(opcode);
                warn!("[{}] {}", self.id, err);
                Err(err)
            }
        }
    }

    /// Step until the program halts. Does not return for programs that
    /// never halt; use [`Emulator::run_for`] when that matters.
    pub fn run(&mut self) -> Result<u64, EmulatorError> {
        let mut executed = 0;
        while !self.cpu.is_halted() {
            self.step()?;
            executed += 1;
        }
        self.publish_registers();
        Ok(executed)
    }

    pub fn run_for(&mut self, max_steps: u64) -> Result<RunOutcome, EmulatorError> {
        let mut executed = 0;
        while executed < max_steps && !self.cpu.is_halted() {
            if let Err(err) = self.step() {
                self.publish_registers();
                return Err(err);
            }
            executed += 1;
        }
        self.publish_registers();
        Ok(RunOutcome {
            executed,
            halted: self.cpu.is_halted(),
        })
    }

    /// Read `length` bytes starting at `address`, wrapping past `$FFFF`.
    pub fn read_memory(&self, address: u16, length: u16) -> Vec<u8> {
        (0..length)
            .map(|i| self.memory.read(address.wrapping_add(i)))
            .collect()
    }

    pub fn write_memory(&mut self, address: u16, value: u8) {
        self.memory.write(address, value);
    }

    pub fn snapshot(&self, name: &str) -> Snapshot {
        Snapshot::capture(name, &self.cpu, &self.memory)
    }

    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        snapshot.restore(&mut self.cpu, &mut self.memory)?;
        self.publish_registers();
        Ok(())
    }

    fn publish_registers(&self) {
        update_cpu_registers(
            &self.id,
            self.cpu.get_register_a(),
            self.cpu.get_register_x(),
            self.cpu.get_register_y(),
            self.cpu.get_pc(),
            self.cpu.get_sp(),
            self.cpu.get_status(),
        );
    }
}
