//! mos6502 - run 6502 programs from the command line or serve the HTTP API

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, warn, LevelFilter};
use simple_logger::SimpleLogger;

use mos6502_core::emulator::{CpuState, Emulator};
use mos6502_core::image::Image;
use mos6502_core::server::run_server;
use mos6502_core::Config;

#[derive(Parser, Debug)]
#[command(name = "mos6502")]
#[command(about = "MOS 6502 CPU emulator", long_about = None)]
struct Cli {
    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: LevelFilter,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load an image and run it until it halts
    Run {
        /// EF or raw binary image
        file: PathBuf,

        /// Where the payload is placed (hex with 0x or $, or decimal)
        #[arg(short, long, value_parser = parse_address)]
        load_address: Option<u16>,

        /// Initial PC; defaults to the load address
        #[arg(short, long, value_parser = parse_address)]
        entry_point: Option<u16>,

        /// Stop after this many instructions
        #[arg(short, long)]
        max_steps: Option<u64>,

        /// Treat the file as raw bytes even if it starts with the EF magic
        #[arg(long)]
        raw: bool,
    },

    /// Serve the HTTP API
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(short, long)]
        bind: Option<std::net::IpAddr>,
    },
}

fn parse_address(text: &str) -> Result<u16, String> {
    let text = text.trim();
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix('$')) {
        u16::from_str_radix(hex, 16)
    } else {
        text.parse::<u16>()
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", text, e))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = SimpleLogger::new().with_level(cli.log_level).init() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let config = match &cli.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load config {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    match cli.command {
        Command::Run {
            file,
            load_address,
            entry_point,
            max_steps,
            raw,
        } => run_program(&config, file, load_address, entry_point, max_steps, raw),
        Command::Serve { port, bind } => {
            let mut config = config;
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(bind) = bind {
                config.bind_address = bind;
            }
            run_server(config).await;
            ExitCode::SUCCESS
        }
    }
}

fn run_program(
    config: &Config,
    file: PathBuf,
    load_address: Option<u16>,
    entry_point: Option<u16>,
    max_steps: Option<u64>,
    raw: bool,
) -> ExitCode {
    let image = match Image::from_file(&file, raw) {
        Ok(image) => image,
        Err(e) => {
            error!("Failed to load {}: {}", file.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let load_address = load_address.unwrap_or(config.default_load_address);
    let entry_point = entry_point.unwrap_or(load_address);

    let mut emulator = Emulator::new("cli");
    emulator.reset(entry_point);
    if let Err(e) = emulator.load_image(&image, load_address) {
        error!("Failed to load {}: {}", file.display(), e);
        return ExitCode::FAILURE;
    }

    let result = match max_steps {
        Some(limit) => emulator.run_for(limit).map(|outcome| outcome.halted),
        None => emulator.run().map(|_| true),
    };

    let state = emulator.state();
    match result {
        Ok(halted) => {
            if !halted {
                warn!("Step limit reached before the program halted");
            }
            dump_cpu_state(&state);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Fault: {}", e);
            dump_cpu_state(&state);
            ExitCode::FAILURE
        }
    }
}

fn dump_cpu_state(state: &CpuState) {
    println!("CPU State:");
    println!("  A: ${:02X}", state.a);
    println!("  X: ${:02X}", state.x);
    println!("  Y: ${:02X}", state.y);
    println!("  SP: ${:02X}", state.sp);
    println!("  PC: ${:04X}", state.pc);
    println!("  Accesses: {}", state.cycles);
    println!("  Instructions: {}", state.instructions);

    let flags = &state.flags;
    println!("Flags (${:02X}):", state.status);
    for (name, set) in [
        ("Negative", flags.negative),
        ("Overflow", flags.overflow),
        ("Unused", flags.unused),
        ("Break", flags.break_command),
        ("Decimal", flags.decimal),
        ("Interrupt", flags.interrupt_disable),
        ("Zero", flags.zero),
        ("Carry", flags.carry),
    ] {
        println!("  {:<9} {}", name, set as u8);
    }
}
