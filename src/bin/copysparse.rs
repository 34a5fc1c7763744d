//! `copysparse` — copy a file into a new sparse destination, writing only
//! the non-zero clusters.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use sparsetools::copy::{copy_sparse, CopySparseOpts};
use sparsetools::display::set_display_level;

#[derive(Parser)]
#[command(
    name = "copysparse",
    version,
    about = "Copy a file into a new sparse destination; zero clusters become holes"
)]
struct Args {
    /// Print the source's zero-cluster map after the copy.
    #[arg(short = 'm')]
    print_map: bool,

    /// Increase verbosity (repeatable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print errors only.
    #[arg(short = 'q', long = "quiet", conflicts_with = "verbose")]
    quiet: bool,

    /// Source file.
    src: PathBuf,

    /// Destination file; must not already exist.
    dst: PathBuf,
}

fn run(args: &Args) -> anyhow::Result<()> {
    let opts = CopySparseOpts {
        print_map: args.print_map,
        ..CopySparseOpts::default()
    };
    copy_sparse(&args.src, &args.dst, &opts).with_context(|| {
        format!(
            "failed to copy {} to {}",
            args.src.display(),
            args.dst.display()
        )
    })?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    set_display_level(if args.quiet { 1 } else { 2 + args.verbose as i32 });

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("copysparse: {err:#}");
            ExitCode::FAILURE
        }
    }
}
