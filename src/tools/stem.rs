//! `stem`: load and execute a stub binary.
//!
//! Exits 0 when the program halts (or the cycle budget runs out), with the
//! interrupt number otherwise.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use starch::core::Core;
use starch::isa::Interrupt;
use starch::mem::Mem;

/// Emulate a Starch stub binary
#[derive(Clone, Debug, Parser)]
struct Args {
    /// starch image to execute
    image: PathBuf,
    /// maximum number of cycles to execute
    #[arg(short, long)]
    cycles: Option<u64>,
    /// write a hex dump of touched memory on termination
    #[arg(short, long)]
    dump: Option<PathBuf>,
    /// increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    stderrlog::new()
        .verbosity(usize::from(args.verbose))
        .init()?;

    let mut infile = File::open(&args.image).with_context(|| {
        format!("failed to open image file \"{}\"", args.image.display())
    })?;

    let mut mem = Mem::new();
    let mut core = Core::new();
    core.load_stub(&mut mem, &mut infile)
        .with_context(|| format!("failed to load \"{}\"", args.image.display()))?;

    let mut result = Interrupt::None;
    let mut cycles = 0u64;
    while args.cycles.map_or(true, |max| cycles < max) {
        if let Err(int) = core.step(&mut mem) {
            result = int;
            break;
        }
        cycles += 1;
    }

    if let Some(path) = &args.dump {
        let mut dumpfile = File::create(path).with_context(|| {
            format!("failed to open hex dump file \"{}\"", path.display())
        })?;
        mem.dump_hex(0, 0, &mut dumpfile)?;
    }

    match result {
        Interrupt::None | Interrupt::Halt => Ok(()),
        fault => {
            eprintln!("error: an error occurred during emulation: {fault}");
            std::process::exit(i32::from(u8::from(fault)));
        }
    }
}
