use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aasm::bytecode::Executable;
use aasm::bytecode::compile::{Compiler, CompilerConfig};
use aasm::bytecode::disasm::print_exe;
use aasm::lang::program::Program;
use aasm::runtime::vm_bc::{Vm, VmConfig};

#[derive(Parser, Debug)]
#[command(name = "aasm")]
#[command(about = "Lower an arrow-asm program tree to bytecode and run it")]
struct Cli {
    /// JSON program tree, or `-` for stdin
    input: String,

    /// Treat INPUT as a serialized executable instead of a program tree
    #[arg(long)]
    exe: bool,

    /// Write the lowered executable to PATH instead of running it
    #[arg(long, value_name = "PATH")]
    emit: Option<PathBuf>,

    /// Print the disassembly listing and exit
    #[arg(long)]
    disasm: bool,

    /// Report operand type mismatches as warnings
    #[arg(long)]
    lenient: bool,

    /// Fault after N dispatched instructions
    #[arg(long, value_name = "N")]
    max_steps: Option<u64>,

    /// Fault when calls nest deeper than N frames
    #[arg(long, value_name = "N")]
    max_call_depth: Option<usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aasm=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let bytes = read_input(&cli.input)?;

    let exe = if cli.exe {
        Executable::from_bytes(&bytes)
            .with_context(|| format!("failed to decode executable '{}'", cli.input))?
    } else {
        let program: Program = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse program tree '{}'", cli.input))?;
        let config = CompilerConfig {
            strict_types: !cli.lenient,
        };
        Compiler::with_config(config)
            .compile_program(&program)
            .context("lowering failed")?
    };
    info!(chunks = exe.chunks.len(), classes = exe.classes.len(), "executable ready");

    if let Some(path) = &cli.emit {
        let encoded = exe.to_bytes().context("failed to encode executable")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write '{}'", path.display()))?;
        return Ok(());
    }

    if cli.disasm {
        print_exe(&exe);
        return Ok(());
    }

    let config = VmConfig {
        max_steps: cli.max_steps,
        max_call_depth: cli.max_call_depth,
    };
    let mut vm = Vm::with_config(config, io::stdout());

    let outcome = vm.run(&exe);
    let mut out = vm.into_output();
    out.flush().context("failed to flush program output")?;

    match outcome {
        Ok(result) => std::process::exit(result as i32),
        Err(fault) => {
            error!(%fault, "execution aborted");
            eprintln!("{}", fault);
            std::process::abort();
        }
    }
}

fn read_input(input: &str) -> Result<Vec<u8>> {
    if input == "-" {
        let mut bytes = Vec::new();
        io::stdin()
            .read_to_end(&mut bytes)
            .context("failed to read stdin")?;
        return Ok(bytes);
    }
    fs::read(input).with_context(|| format!("failed to read '{}'", input))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_flags() {
        let cli = Cli::try_parse_from(["aasm", "--max-steps", "100", "--max-call-depth", "12", "prog.json"]).unwrap();
        assert_eq!(cli.max_steps, Some(100));
        assert_eq!(cli.max_call_depth, Some(12));
        assert_eq!(cli.input, "prog.json");
        assert!(!cli.exe && !cli.lenient && !cli.disasm);
    }

    #[test]
    fn test_limits_default_to_unbounded() {
        let cli = Cli::try_parse_from(["aasm", "-"]).unwrap();
        assert_eq!(cli.max_steps, None);
        assert_eq!(cli.max_call_depth, None);
    }
}
