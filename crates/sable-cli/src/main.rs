//! Sable command-line front end
//!
//! `sable <bytecode-file> [verify | runtime]` loads an image and executes
//! it. Without a mode the run is checked and silent; `verify` proves the
//! image statically and then runs without checks, `runtime` keeps every
//! check on. Both timed modes report to stderr. `--disasm` prints the
//! decoded program instead of executing.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Instant;

use sable_vm::{disassemble, run_checked, run_unchecked, verify, Image, Runtime};

#[derive(Parser)]
#[command(name = "sable")]
#[command(about = "Sable bytecode interpreter", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the bytecode file
    file: PathBuf,

    /// Execution mode; omitted means a checked run without timing output
    #[arg(value_enum)]
    mode: Option<Mode>,

    /// Disassemble the image to stdout instead of executing it
    #[arg(long)]
    disasm: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// Run the static verifier, then execute without runtime checks
    Verify,
    /// Skip verification and execute with every runtime check enabled
    Runtime,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut image = Image::load(&cli.file)
        .with_context(|| format!("failed to load bytecode file: {}", cli.file.display()))?;

    if cli.disasm {
        print!("{}", disassemble(&image));
        return Ok(());
    }

    let mut rt = Runtime::new();
    match cli.mode {
        None => run_checked(&image, &mut rt)?,
        Some(Mode::Verify) => {
            let before = Instant::now();
            verify(&mut image)?;
            let after_verification = Instant::now();
            run_unchecked(&image, &mut rt)?;
            let after_execution = Instant::now();
            eprintln!(
                "verification took {:.3}s",
                (after_verification - before).as_secs_f64()
            );
            eprintln!(
                "execution without checks took {:.3}s",
                (after_execution - after_verification).as_secs_f64()
            );
        }
        Some(Mode::Runtime) => {
            let before = Instant::now();
            run_checked(&image, &mut rt)?;
            eprintln!(
                "execution with checks took {:.3}s",
                before.elapsed().as_secs_f64()
            );
        }
    }

    Ok(())
}
