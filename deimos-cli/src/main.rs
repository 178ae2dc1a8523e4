mod loader;
mod logging;
mod repl;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use deimos_core::board::{Board, BoardConfig, Halt};
use log::{error, info};

/// Exit codes as seen by the invoking shell.
const EXIT_POWER_OFF: u8 = 0;
const EXIT_DEBUGGER_QUIT: u8 = 1;
const EXIT_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(version, about = "RV64 virt-board emulator", long_about = None)]
struct Args {
    /// ELF binary to execute.
    elf: PathBuf,

    /// Attach a device, e.g. `virtio-block:disk.img`.
    #[arg(long = "device")]
    devices: Vec<String>,

    /// Drop into the interactive single-step debugger instead of running.
    #[arg(short = 'g')]
    debug: bool,

    /// Log verbosity.
    #[arg(long, value_enum, default_value = "warn")]
    loglevel: logging::LogLevel,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _logger_handle = logging::init(args.loglevel);

    match run(&args) {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            eprintln!("deimos: {err}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn run(args: &Args) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut block_image = None;
    for device in &args.devices {
        match device.split_once(':') {
            Some(("virtio-block", path)) => block_image = Some(PathBuf::from(path)),
            _ => return Err(format!("unknown device spec: {device}").into()),
        }
    }

    let program = std::fs::read(&args.elf)?;
    let entry = loader::entry_point(&program)?;

    let mut board = Board::new(BoardConfig {
        reset_vector: entry,
        block_image,
        uart_output: Box::new(std::io::stdout()),
    })?;
    loader::load_elf(&mut board, &program)?;
    info!("loaded {} entry {entry:#x}", args.elf.display());

    if args.debug {
        return Ok(match repl::run(&mut board) {
            repl::ReplExit::PowerOff => ExitCode::from(EXIT_POWER_OFF),
            repl::ReplExit::Quit => ExitCode::from(EXIT_DEBUGGER_QUIT),
            repl::ReplExit::Error(err) => {
                error!("{err}");
                eprintln!("deimos: {err}");
                ExitCode::from(EXIT_ERROR)
            }
        });
    }

    match board.run(u64::MAX)? {
        Halt::PowerOff => Ok(ExitCode::from(EXIT_POWER_OFF)),
        // Unreachable with an unlimited budget, but keep the arm for clarity.
        Halt::StepBudgetExhausted => Ok(ExitCode::from(EXIT_ERROR)),
    }
}
