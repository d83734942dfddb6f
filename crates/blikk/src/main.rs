//! blikk CLI
//!
//! Runs blikk programs from a file, from an inline `-c` argument, or
//! interactively with `-i`. Exit code is 0 on success and 1 on any compile
//! or runtime error.

mod repl;

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use clap_complete::{Shell, generate};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use blikk_lang::builtins;
use blikk_lang::{Compiler, Program, RunFlags, VirtualMachine};

#[derive(Parser)]
#[command(name = "blikk")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run blikk programs", long_about = None)]
struct Cli {
    /// Source file to run
    file: Option<PathBuf>,

    /// Run code directly from the argument
    #[arg(
        short = 'c',
        long = "command",
        value_name = "CODE",
        conflicts_with_all = ["file", "interactive"]
    )]
    command: Option<String>,

    /// Run code interactively (REPL)
    #[arg(short = 'i', long = "interactive", conflicts_with = "file")]
    interactive: bool,

    /// Dump executed instructions to stderr
    #[arg(long)]
    debug: bool,

    /// Generate shell completion scripts
    #[arg(long, value_enum, value_name = "SHELL", exclusive = true)]
    completions: Option<Shell>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("BLIKK_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        generate(shell, &mut Cli::command(), "blikk", &mut std::io::stdout());
        return ExitCode::SUCCESS;
    }

    let status = if cli.interactive {
        repl::run_interactive(cli.debug)
    } else if let Some(code) = &cli.command {
        run_code(code, "<inline>", cli.debug)
    } else if let Some(file) = &cli.file {
        let source = match fs::read_to_string(file) {
            Ok(source) => source,
            Err(err) => {
                eprintln!("Error: cannot read '{}': {}", file.display(), err);
                return ExitCode::FAILURE;
            }
        };

        run_code(&source, &file.display().to_string(), cli.debug)
    } else {
        let _ = Cli::command().print_help();
        return ExitCode::FAILURE;
    };

    if status == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run_code(source: &str, filename: &str, debug_instructions: bool) -> i32 {
    let mut program = Program::new();
    let mut compiler = Compiler::new(&mut program);
    builtins::import_all(&mut compiler, &mut program);

    debug!(filename, "compiling");
    if compiler.compile(&mut program, source, filename).is_err() {
        return 1;
    }

    let flags = RunFlags {
        hide_errors: false,
        debug: debug_instructions,
    };

    let mut vm = VirtualMachine::new();
    match vm.run(&program, flags) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}
