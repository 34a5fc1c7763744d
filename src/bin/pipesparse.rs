//! `pipesparse` — read standard input until EOF and write a sparse file,
//! skipping writes for all-zero records.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use sparsetools::display::set_display_level;
use sparsetools::pipe::{pipe_sparse, PipeSparseOpts};

#[derive(Parser)]
#[command(
    name = "pipesparse",
    version,
    about = "Write standard input to a new sparse file, punching holes for zero runs"
)]
struct Args {
    /// Increase verbosity (repeatable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print errors only.
    #[arg(short = 'q', long = "quiet", conflicts_with = "verbose")]
    quiet: bool,

    /// Output file; must not already exist.
    path: PathBuf,
}

fn run(args: &Args) -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    pipe_sparse(&mut input, &args.path, &PipeSparseOpts::default())
        .with_context(|| format!("failed to write sparse file {}", args.path.display()))?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    set_display_level(if args.quiet { 1 } else { 2 + args.verbose as i32 });

    if std::io::stdin().is_terminal() {
        eprintln!("pipesparse: refusing to read from a console");
        return ExitCode::FAILURE;
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("pipesparse: {err:#}");
            ExitCode::FAILURE
        }
    }
}
