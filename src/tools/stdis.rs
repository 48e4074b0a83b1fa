//! `stdis`: disassemble a stub binary into a textual listing.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

/// Disassemble a Starch stub binary
#[derive(Clone, Debug, Parser)]
struct Args {
    /// starch binary to disassemble
    binary: PathBuf,
    /// listing output, standard output if omitted
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    stderrlog::new()
        .verbosity(usize::from(args.verbose))
        .init()?;

    let mut infile = File::open(&args.binary).with_context(|| {
        format!("failed to open \"{}\"", args.binary.display())
    })?;

    match &args.output {
        Some(path) => {
            let file = File::create(path).with_context(|| {
                format!("failed to open \"{}\" for writing", path.display())
            })?;
            starch::disasm::disassemble(&mut infile, &mut BufWriter::new(file))
        }
        None => {
            let stdout = std::io::stdout();
            starch::disasm::disassemble(&mut infile, &mut stdout.lock())
        }
    }
}
