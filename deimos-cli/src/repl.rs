//! Interactive single-step debugger.
//!
//! A small gdb-flavored REPL over the board's step interface. One command per line; command
//! parsing is delegated to clap in multicall mode so `help` comes for free.

use std::collections::BTreeSet;

use clap::{Parser, Subcommand};
use deimos_core::board::{Board, EmulatorError, StepOutcome};
use deimos_core::core::csr::CsrSpecifier;
use deimos_core::registers::Specifier;
use deimos_core::PrivilegeLevel;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

#[derive(Debug, Parser)]
#[command(multicall = true)]
enum Cli {
    /// Step a single instruction.
    #[command(alias = "s")]
    Si,

    /// Continue running, optionally for at most N instructions.
    #[command(name = "continue", alias = "c")]
    Continue {
        #[arg(default_value_t = u64::MAX)]
        steps: u64,
    },

    /// Print the PC, a register, a CSR, or memory.
    #[command(alias = "p", subcommand)]
    Print(PrintCmd),

    /// Set or delete a breakpoint.
    #[command(name = "break", alias = "b")]
    Breakpoint {
        #[arg(short = 'd', long = "delete")]
        delete: bool,
        /// Address; decimal by default, or hex if prefixed with `0x`.
        addr: String,
    },

    /// Quit the debugger.
    #[command(name = "quit", aliases = ["q", "exit"])]
    Quit,
}

#[derive(Debug, Subcommand)]
enum PrintCmd {
    Pc,
    Reg {
        /// Register index, 0..=31.
        index: u8,
    },
    Csr {
        /// CSR address; decimal by default, or hex if prefixed with `0x`.
        addr: String,
    },
    Mem {
        /// Address; decimal by default, or hex if prefixed with `0x`.
        addr: String,
        #[arg(short, long, default_value_t = 16)]
        len: u32,
    },
}

/// How a debugging session ended.
pub enum ReplExit {
    /// The guest powered itself off.
    PowerOff,
    /// The user quit.
    Quit,
    /// The emulator hit an unrecoverable error.
    Error(EmulatorError),
}

pub fn run(board: &mut Board) -> ReplExit {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("cannot open line editor: {err}");
            return ReplExit::Quit;
        }
    };
    let mut breakpoints = BTreeSet::new();

    println!("deimos debugger; `help` lists commands");
    loop {
        let line = match editor.readline("(deimos) ") {
            Ok(line) => line,
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => return ReplExit::Quit,
            Err(err) => {
                eprintln!("{err}");
                return ReplExit::Quit;
            }
        };
        let words = line.split_whitespace().collect::<Vec<_>>();
        if words.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(&line);

        let command = match Cli::try_parse_from(words.iter().copied()) {
            Ok(command) => command,
            Err(err) => {
                // clap renders help/usage itself.
                print!("{err}");
                continue;
            }
        };

        match command {
            Cli::Si => match step_until(board, 1, &breakpoints) {
                RunStop::Running => println!("pc = {:#018x}", board.pc()),
                RunStop::Breakpoint => println!("breakpoint hit at {:#x}", board.pc()),
                RunStop::PowerOff => return ReplExit::PowerOff,
                RunStop::Error(err) => return ReplExit::Error(err),
            },
            Cli::Continue { steps } => match step_until(board, steps, &breakpoints) {
                RunStop::Running => println!("stopped at pc = {:#018x}", board.pc()),
                RunStop::Breakpoint => println!("breakpoint hit at {:#x}", board.pc()),
                RunStop::PowerOff => return ReplExit::PowerOff,
                RunStop::Error(err) => return ReplExit::Error(err),
            },
            Cli::Print(print) => run_print(board, print),
            Cli::Breakpoint { delete, addr } => match parse_number(&addr) {
                Some(addr) if delete => {
                    breakpoints.remove(&addr);
                }
                Some(addr) => {
                    breakpoints.insert(addr);
                }
                None => eprintln!("bad address: {addr}"),
            },
            Cli::Quit => return ReplExit::Quit,
        }
    }
}

enum RunStop {
    Running,
    Breakpoint,
    PowerOff,
    Error(EmulatorError),
}

fn step_until(board: &mut Board, max_steps: u64, breakpoints: &BTreeSet<u64>) -> RunStop {
    for _ in 0..max_steps {
        match board.step() {
            Ok(StepOutcome::Continue) => {}
            Ok(StepOutcome::PowerOff) => return RunStop::PowerOff,
            Err(err) => return RunStop::Error(err),
        }
        if breakpoints.contains(&board.pc()) {
            return RunStop::Breakpoint;
        }
    }
    RunStop::Running
}

fn run_print(board: &Board, command: PrintCmd) {
    match command {
        PrintCmd::Pc => println!("pc = {:#018x}", board.pc()),
        PrintCmd::Reg { index } => match Specifier::new(index) {
            Some(specifier) => {
                println!("x{index} = {:#018x}", board.registers().x(specifier))
            }
            None => eprintln!("no such register: x{index}"),
        },
        PrintCmd::Csr { addr } => match parse_number(&addr) {
            Some(addr) => {
                match board.core().read_csr(
                    board.bus(),
                    addr as CsrSpecifier,
                    PrivilegeLevel::Machine,
                ) {
                    Ok(value) => println!("csr {addr:#x} = {value:#018x}"),
                    Err(err) => eprintln!("{err}"),
                }
            }
            None => eprintln!("bad CSR address: {addr}"),
        },
        PrintCmd::Mem { addr, len } => match parse_number(&addr) {
            Some(addr) => {
                let mut buf = vec![0u8; len as usize];
                match board.peek_ram(addr, &mut buf) {
                    Some(()) => {
                        for (i, chunk) in buf.chunks(16).enumerate() {
                            print!("{:#010x}: ", addr + i as u64 * 16);
                            for byte in chunk {
                                print!("{byte:02x} ");
                            }
                            println!();
                        }
                    }
                    None => eprintln!("address range not in RAM"),
                }
            }
            None => eprintln!("bad address: {addr}"),
        },
    }
}

fn parse_number(text: &str) -> Option<u64> {
    match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}
