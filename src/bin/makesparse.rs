//! `makesparse` — deallocate the zero clusters of an existing file in place.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use sparsetools::analyze::{make_sparse, MakeSparseOpts};
use sparsetools::display::set_display_level;

#[derive(Parser)]
#[command(
    name = "makesparse",
    version,
    about = "Analyze a file and deallocate its cluster-aligned zero ranges"
)]
struct Args {
    /// Restore access and modification timestamps after processing.
    #[arg(short = 'p')]
    preserve_times: bool,

    /// Print the map of zero clusters after processing.
    #[arg(short = 'm')]
    print_map: bool,

    /// Increase verbosity (repeatable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print errors only.
    #[arg(short = 'q', long = "quiet", conflicts_with = "verbose")]
    quiet: bool,

    /// File to make sparse.
    path: PathBuf,
}

fn run(args: &Args) -> anyhow::Result<()> {
    let opts = MakeSparseOpts {
        preserve_times: args.preserve_times,
        print_map: args.print_map,
        ..MakeSparseOpts::default()
    };
    make_sparse(&args.path, &opts)
        .with_context(|| format!("failed to make {} sparse", args.path.display()))?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    set_display_level(if args.quiet { 1 } else { 2 + args.verbose as i32 });

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("makesparse: {err:#}");
            ExitCode::FAILURE
        }
    }
}
