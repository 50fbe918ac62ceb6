use std::sync::Once;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
};

use crate::cpu::{
    BREAK_COMMAND, CARRY_FLAG, DECIMAL_MODE, INTERRUPT_DISABLE, NEGATIVE_FLAG,
    OVERFLOW_FLAG, UNUSED_FLAG, ZERO_FLAG,
};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Instructions executed, by opcode byte and mnemonic
    pub static ref CPU_INSTRUCTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("cpu_instructions_total", "Total number of CPU instructions executed by opcode"),
        &["opcode", "mnemonic"]
    ).expect("Failed to create CPU instructions counter");

    /// Memory accesses made by the engine (fetches, reads and writes)
    pub static ref CPU_MEMORY_ACCESSES_TOTAL: Counter = Counter::new(
        "cpu_memory_accesses_total", "Total number of memory accesses made while executing"
    ).expect("Failed to create memory accesses counter");

    pub static ref INSTRUCTION_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("instruction_duration_seconds", "Time spent executing instructions")
            .buckets(vec![0.000001, 0.000005, 0.00001, 0.00005, 0.0001, 0.0005, 0.001]),
        &["mnemonic"]
    ).expect("Failed to create instruction duration histogram");

    /// Faults raised by the engine, by offending opcode
    pub static ref CPU_FAULTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("cpu_faults_total", "Total number of invalid opcode faults"),
        &["opcode"]
    ).expect("Failed to create CPU faults counter");

    pub static ref CPU_HALTS_TOTAL: Counter = Counter::new(
        "cpu_halts_total", "Total number of programs that halted normally"
    ).expect("Failed to create CPU halts counter");

    /// Counter for API requests by endpoint and method
    pub static ref API_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("api_requests_total", "Total number of API requests"),
        &["method", "endpoint", "status"]
    ).expect("Failed to create API requests counter");

    pub static ref API_REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("api_request_duration_seconds", "API request duration")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["method", "endpoint"]
    ).expect("Failed to create API request duration histogram");

    pub static ref ACTIVE_EMULATORS: Gauge = Gauge::new(
        "active_emulators_total", "Number of active emulator sessions"
    ).expect("Failed to create active emulators gauge");

    /// Register values by emulator ID
    pub static ref CPU_REGISTER_VALUES: GaugeVec = GaugeVec::new(
        Opts::new("cpu_register_value", "Current CPU register values"),
        &["emulator_id", "register"]
    ).expect("Failed to create CPU register values gauge");

    /// Flag states (0 or 1) by emulator ID
    pub static ref CPU_FLAGS: GaugeVec = GaugeVec::new(
        Opts::new("cpu_flags", "Current CPU flag states (0 or 1)"),
        &["emulator_id", "flag"]
    ).expect("Failed to create CPU flags gauge");

    pub static ref MEMORY_OPERATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("memory_operations_total", "Total memory reads and writes made through the API"),
        &["operation", "emulator_id"]
    ).expect("Failed to create memory operations counter");

    pub static ref EMULATOR_RESETS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("emulator_resets_total", "Total number of emulator resets"),
        &["emulator_id"]
    ).expect("Failed to create emulator resets counter");

    pub static ref PROGRAM_LOADS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("program_loads_total", "Total number of programs loaded"),
        &["emulator_id"]
    ).expect("Failed to create program loads counter");

    /// Snapshot captures and restores
    pub static ref SNAPSHOT_OPERATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("snapshot_operations_total", "Total snapshot captures and restores"),
        &["operation", "status"]
    ).expect("Failed to create snapshot operations counter");
}

static INIT: Once = Once::new();

/// Register every metric with the global registry. Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(CPU_INSTRUCTIONS_TOTAL.clone()))
            .expect("Failed to register CPU instructions counter");
        REGISTRY
            .register(Box::new(CPU_MEMORY_ACCESSES_TOTAL.clone()))
            .expect("Failed to register memory accesses counter");
        REGISTRY
            .register(Box::new(INSTRUCTION_DURATION.clone()))
            .expect("Failed to register instruction duration histogram");
        REGISTRY
            .register(Box::new(CPU_FAULTS_TOTAL.clone()))
            .expect("Failed to register CPU faults counter");
        REGISTRY
            .register(Box::new(CPU_HALTS_TOTAL.clone()))
            .expect("Failed to register CPU halts counter");
        REGISTRY
            .register(Box::new(API_REQUESTS_TOTAL.clone()))
            .expect("Failed to register API requests counter");
        REGISTRY
            .register(Box::new(API_REQUEST_DURATION.clone()))
            .expect("Failed to register API request duration histogram");
        REGISTRY
            .register(Box::new(ACTIVE_EMULATORS.clone()))
            .expect("Failed to register active emulators gauge");
        REGISTRY
            .register(Box::new(CPU_REGISTER_VALUES.clone()))
            .expect("Failed to register CPU register values gauge");
        REGISTRY
            .register(Box::new(CPU_FLAGS.clone()))
            .expect("Failed to register CPU flags gauge");
        REGISTRY
            .register(Box::new(MEMORY_OPERATIONS_TOTAL.clone()))
            .expect("Failed to register memory operations counter");
        REGISTRY
            .register(Box::new(EMULATOR_RESETS_TOTAL.clone()))
            .expect("Failed to register emulator resets counter");
        REGISTRY
            .register(Box::new(PROGRAM_LOADS_TOTAL.clone()))
            .expect("Failed to register program loads counter");
        REGISTRY
            .register(Box::new(SNAPSHOT_OPERATIONS_TOTAL.clone()))
            .expect("Failed to register snapshot operations counter");
    });
}

/// Record one executed instruction and the memory accesses it made
pub fn record_instruction(opcode: u8, mnemonic: &str, accesses: u64, duration: Duration) {
    CPU_INSTRUCTIONS_TOTAL
        .with_label_values(&[&format!("0x{:02X}", opcode), mnemonic])
        .inc();

    CPU_MEMORY_ACCESSES_TOTAL.inc_by(accesses as f64);

    INSTRUCTION_DURATION
        .with_label_values(&[mnemonic])
        .observe(duration.as_secs_f64());
}

pub fn record_fault(opcode: u8) {
    CPU_FAULTS_TOTAL
        .with_label_values(&[&format!("0x{:02X}", opcode)])
        .inc();
}

pub fn record_halt() {
    CPU_HALTS_TOTAL.inc();
}

/// Record an API request
pub fn record_api_request(method: &str, endpoint: &str, status: u16, duration: Duration) {
    API_REQUESTS_TOTAL
        .with_label_values(&[method, endpoint, &status.to_string()])
        .inc();

    API_REQUEST_DURATION
        .with_label_values(&[method, endpoint])
        .observe(duration.as_secs_f64());
}

pub fn set_active_emulators(count: usize) {
    ACTIVE_EMULATORS.set(count as f64);
}

/// Update register and flag gauges for an emulator
pub fn update_cpu_registers(emulator_id: &str, a: u8, x: u8, y: u8, pc: u16, sp: u8, status: u8) {
    for (register, value) in [
        ("A", a as f64),
        ("X", x as f64),
        ("Y", y as f64),
        ("PC", pc as f64),
        ("SP", sp as f64),
        ("STATUS", status as f64),
    ] {
        CPU_REGISTER_VALUES
            .with_label_values(&[emulator_id, register])
            .set(value);
    }

    update_cpu_flags(emulator_id, status);
}

const FLAG_LABELS: [(&str, u8); 8] = [
    ("carry", CARRY_FLAG),
    ("zero", ZERO_FLAG),
    ("interrupt_disable", INTERRUPT_DISABLE),
    ("decimal_mode", DECIMAL_MODE),
    ("break_command", BREAK_COMMAND),
    ("unused", UNUSED_FLAG),
    ("overflow", OVERFLOW_FLAG),
    ("negative", NEGATIVE_FLAG),
];

pub fn update_cpu_flags(emulator_id: &str, status: u8) {
    for (label, flag) in FLAG_LABELS {
        CPU_FLAGS
            .with_label_values(&[emulator_id, label])
            .set(if status & flag != 0 { 1.0 } else { 0.0 });
    }
}

/// Drop every per-emulator series once a session is deleted
pub fn forget_emulator(emulator_id: &str) {
    for register in ["A", "X", "Y", "PC", "SP", "STATUS"] {
        let _ = CPU_REGISTER_VALUES.remove_label_values(&[emulator_id, register]);
    }
    for (label, _) in FLAG_LABELS {
        let _ = CPU_FLAGS.remove_label_values(&[emulator_id, label]);
    }
    for operation in ["read", "write"] {
        let _ = MEMORY_OPERATIONS_TOTAL.remove_label_values(&[operation, emulator_id]);
    }
    let _ = EMULATOR_RESETS_TOTAL.remove_label_values(&[emulator_id]);
    let _ = PROGRAM_LOADS_TOTAL.remove_label_values(&[emulator_id]);
}

pub fn record_memory_operation(operation: &str, emulator_id: &str) {
    MEMORY_OPERATIONS_TOTAL
        .with_label_values(&[operation, emulator_id])
        .inc();
}

pub fn record_emulator_reset(emulator_id: &str) {
    EMULATOR_RESETS_TOTAL
        .with_label_values(&[emulator_id])
        .inc();
}

pub fn record_program_load(emulator_id: &str) {
    PROGRAM_LOADS_TOTAL
        .with_label_values(&[emulator_id])
        .inc();
}

pub fn record_snapshot_operation(operation: &str, ok: bool) {
    SNAPSHOT_OPERATIONS_TOTAL
        .with_label_values(&[operation, if ok { "ok" } else { "error" }])
        .inc();
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
