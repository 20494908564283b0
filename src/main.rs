use anyhow::Result;
use clap::Parser;
use env_logger::Builder;
use log::{error, LevelFilter};
use lox::vm::VM;
use lox::{interpret, run};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const EXIT_IO_ERROR: u8 = 74;

#[derive(Parser, Debug)]
#[command(about = "Lox bytecode interpreter")]
struct Args {
    /// Script to run. Starts a REPL when absent.
    #[arg(short, long)]
    file: Option<PathBuf>,
    /// Raise log verbosity, may be repeated.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logger(args.verbose);

    if let Some(path) = args.file {
        Ok(run_file(&path))
    } else {
        repl()?;
        Ok(ExitCode::SUCCESS)
    }
}

fn repl() -> Result<()> {
    let mut output = std::io::stdout();
    let mut vm = VM::new(&mut output);
    prompt()?;
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.is_empty() {
            break;
        }
        if let Err(e) = run(&mut vm, &line) {
            eprintln!("{}", e.to_string().trim_end());
        }
        prompt()?;
    }
    Ok(())
}

fn prompt() -> Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, "> ")?;
    stdout.flush()?;
    Ok(())
}

fn run_file(path: &Path) -> ExitCode {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            error!("Could not read {}: {e}", path.display());
            eprintln!("Could not read file \"{}\".", path.display());
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };
    match interpret(&contents, &mut std::io::stdout()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.to_string().trim_end());
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut builder = Builder::new();
    builder.filter_level(level);
    builder.parse_default_env();
    builder.init()
}
