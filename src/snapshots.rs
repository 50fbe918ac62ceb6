use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::cpu::{ExecutionState, CPU};
use crate::error::SnapshotError;
use crate::memory::{Memory, MEMORY_SIZE};

const RLE_MARKER: u8 = 0xFF;

/// Complete machine state: registers, counters and all of memory.
///
/// Memory is run-length encoded and then base64 encoded so a snapshot
/// travels as plain JSON. The checksum covers the uncompressed bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub cpu: CpuSnapshot,
    pub memory: String,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub pc: u16,
    pub sp: u8,
    pub status: u8,
    pub cycles: u64,
    pub instructions: u64,
    pub halted: bool,
}

impl CpuSnapshot {
    pub fn of(cpu: &CPU) -> Self {
        CpuSnapshot {
            a: cpu.get_register_a(),
            x: cpu.get_register_x(),
            y: cpu.get_register_y(),
            pc: cpu.get_pc(),
            sp: cpu.get_sp(),
            status: cpu.get_status(),
            cycles: cpu.get_cycles(),
            instructions: cpu.get_instructions(),
            halted: cpu.is_halted(),
        }
    }

    fn apply(&self, cpu: &mut CPU) {
        cpu.set_register_a(self.a);
        cpu.set_register_x(self.x);
        cpu.set_register_y(self.y);
        cpu.set_pc(self.pc);
        cpu.set_sp(self.sp);
        cpu.set_flags_from(self.status);
        cpu.set_counters(self.cycles, self.instructions);
        cpu.set_state(if self.halted {
            ExecutionState::Halted
        } else {
            ExecutionState::Running
        });
    }
}

impl Snapshot {
    pub fn capture(name: &str, cpu: &CPU, memory: &Memory) -> Self {
        let bytes = memory.as_slice();
        let compressed = compress_memory(bytes);
        debug!(
            "snapshot '{}': {} bytes compressed to {}",
            name,
            bytes.len(),
            compressed.len()
        );

        Snapshot {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
            cpu: CpuSnapshot::of(cpu),
            memory: STANDARD.encode(&compressed),
            checksum: checksum(bytes),
        }
    }

    /// Decode and verify the memory image. Nothing is modified.
    pub fn memory_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        let compressed = STANDARD.decode(&self.memory)?;
        let bytes = decompress_memory(&compressed)?;
        if bytes.len() != MEMORY_SIZE {
            return Err(SnapshotError::Corrupt(format!(
                "memory image is {} bytes, expected {}",
                bytes.len(),
                MEMORY_SIZE
            )));
        }
        if checksum(&bytes) != self.checksum {
            return Err(SnapshotError::ChecksumMismatch);
        }
        Ok(bytes)
    }

    /// Overwrite `cpu` and `memory` with the captured state. The snapshot is
    /// fully validated first; on error both are left untouched.
    pub fn restore(&self, cpu: &mut CPU, memory: &mut Memory) -> Result<(), SnapshotError> {
        let bytes = self.memory_bytes()?;
        memory.load(0, &bytes);
        self.cpu.apply(cpu);
        debug!("restored snapshot '{}' ({})", self.name, self.id);
        Ok(())
    }
}

/// Lowercase hex SHA-256.
pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

// Run-length encoding. `FF n v` is n copies of v; `FF 00` is a literal FF.
// Runs of four or more, and zero runs of any length, are encoded.
pub fn compress_memory(memory: &[u8]) -> Vec<u8> {
    let mut compressed = Vec::new();
    let mut i = 0;

    while i < memory.len() {
        let value = memory[i];
        let mut count = 1;
        while i + count < memory.len() && memory[i + count] == value && count < 255 {
            count += 1;
        }

        if count > 3 || value == 0 {
            compressed.extend_from_slice(&[RLE_MARKER, count as u8, value]);
        } else {
            for _ in 0..count {
                if value == RLE_MARKER {
                    compressed.extend_from_slice(&[RLE_MARKER, 0x00]);
                } else {
                    compressed.push(value);
                }
            }
        }

        i += count;
    }

    compressed
}

pub fn decompress_memory(compressed: &[u8]) -> Result<Vec<u8>, SnapshotError> {
    let mut out = Vec::with_capacity(MEMORY_SIZE);
    let mut i = 0;

    while i < compressed.len() {
        if compressed[i] != RLE_MARKER {
            out.push(compressed[i]);
            i += 1;
            continue;
        }

        match compressed.get(i + 1).copied() {
            None => return Err(SnapshotError::Corrupt("truncated RLE marker".to_string())),
            Some(0) => {
                out.push(RLE_MARKER);
                i += 2;
            }
            Some(count) => {
                let value = *compressed
                    .get(i + 2)
                    .ok_or_else(|| SnapshotError::Corrupt("truncated RLE run".to_string()))?;
                out.resize(out.len() + count as usize, value);
                i += 3;
            }
        }

        if out.len() > MEMORY_SIZE {
            return Err(SnapshotError::Corrupt("memory image too large".to_string()));
        }
    }

    Ok(out)
}
