//! `stasm`: assemble Starch source into a stub binary.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

/// Assemble Starch source into a stub binary
#[derive(Clone, Debug, Parser)]
struct Args {
    /// starch source to assemble, standard input if omitted
    source: Option<PathBuf>,
    /// binary output
    #[arg(short, long, default_value = "a.stb")]
    output: PathBuf,
    /// maximum number of sections in the output stub
    #[arg(long, default_value_t = 4)]
    maxnsec: u32,
    /// increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    stderrlog::new()
        .verbosity(usize::from(args.verbose))
        .init()?;

    let mut out = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args.output)
        .with_context(|| {
            format!("failed to open \"{}\" for writing", args.output.display())
        })?;

    starch::assembler::assemble(args.source.as_deref(), &mut out, args.maxnsec)
}
