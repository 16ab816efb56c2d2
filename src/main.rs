use std::error::Error;
use std::fs;
use std::path::PathBuf;

use clap::Parser;
use memmap2::Mmap;

use btfenc::dwarf::Cu;
use btfenc::encoder::{BtfEncoder, EncoderCfg};

/// Surveys which functions and per-CPU variables of an object file are
/// eligible for BTF encoding.
#[derive(Parser)]
#[command(name = "btfenc")]
struct Cli {
    /// Object file with a symbol table (e.g. vmlinux)
    file: PathBuf,
    /// List every eligible function and per-CPU variable
    #[arg(short, long)]
    verbose: bool,
    /// Downgrade invalid-name errors to warnings
    #[arg(long)]
    force: bool,
    /// Skip per-CPU variable collection
    #[arg(long)]
    skip_vars: bool,
    /// Write the BTF blob produced for this object
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Cli::parse();

    let file = fs::File::open(&args.file)?;
    let mmap = unsafe { Mmap::map(&file) }?;
    let elf = object::File::parse(&*mmap)?;

    let cfg = EncoderCfg {
        verbose: args.verbose,
        force: args.force,
        skip_encoding_vars: args.skip_vars,
        base_type_cnt: 0,
    };
    let mut encoder = BtfEncoder::new(cfg);
    let cu = Cu::new(args.file.display().to_string(), Some(&elf));
    encoder.encode_cu(&cu)?;

    println!(
        "{}: {} traceable functions, {} percpu variables",
        args.file.display(),
        encoder.functions().len(),
        encoder.percpu_vars().len()
    );
    if args.verbose {
        for func in encoder.functions() {
            println!("  func {} @ 0x{:x}", func.name(), func.addr());
        }
        for var in encoder.percpu_vars() {
            println!("  percpu {} @ 0x{:x} sz {}", var.name(), var.addr(), var.size());
        }
    }

    if let Some(out) = &args.output {
        if let Some(btf) = encoder.finalize()? {
            fs::write(out, &btf.data)?;
        }
    }

    Ok(())
}
