use thiserror::Error;

/// Fatal conditions raised by the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EmulatorError {
    #[error("invalid opcode ${opcode:02X} at ${pc:04X}")]
    InvalidOpcode { opcode: u8, pc: u16 },
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("not an EF image (bad magic)")]
    BadMagic,

    #[error("image truncated: {0} bytes is shorter than the 4-byte header")]
    Truncated(usize),

    #[error("header declares {declared} bytes but image is {actual} bytes")]
    SizeMismatch { declared: usize, actual: usize },

    #[error("{len} bytes at ${base:04X} do not fit in the address space")]
    DoesNotFit { base: u16, len: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),

    #[error("snapshot checksum mismatch")]
    ChecksumMismatch,

    #[error("base64 decode error: {0}")]
    Decode(#[from] base64::DecodeError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
