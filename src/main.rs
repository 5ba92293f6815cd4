use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use vbpf::cli::{RunOptions, dump_file, parse_hex, run_file};

#[derive(Parser, Debug)]
#[command(name = "vbpf")]
#[command(about = "Run and inspect register-machine bytecode", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Finalize a program file, run it once and print R0
    Run {
        /// Raw little-endian stream of 8-byte instructions
        file: PathBuf,

        /// Context buffer passed in R1, as hex
        #[arg(long = "ctx-hex")]
        ctx_hex: Option<String>,

        /// Declared stack depth in bytes
        #[arg(long, default_value = "0")]
        stack_depth: u32,

        /// Try the JIT backend
        #[arg(long)]
        jit: bool,

        /// Fail unless the JIT backend produces native code
        #[arg(long)]
        jit_required: bool,

        /// Blind constants before compiling
        #[arg(long)]
        harden: bool,
    },

    /// Print the decoded instructions and the program tag
    Dump {
        file: PathBuf,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    vbpf_utils::logger::init_logging();

    match Cli::parse().command {
        Command::Run {
            file,
            ctx_hex,
            stack_depth,
            jit,
            jit_required,
            harden,
        } => {
            let options = RunOptions {
                ctx: ctx_hex.as_deref().map(parse_hex).transpose()?.unwrap_or_default(),
                stack_depth,
                jit,
                jit_required,
                harden,
            };
            let (ret, _) = run_file(&file, &options)?;
            println!("{ret:#x}");
        }
        Command::Dump { file, json } => print!("{}", dump_file(&file, json)?),
    }
    Ok(())
}
