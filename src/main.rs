use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use numjit::RuntimeConfig;
use numjit::compiler;

#[derive(Parser)]
#[command(name = "numjit")]
#[command(about = "A JIT compiler for a JavaScript-like numeric language", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile the first function in a source file and call it
    Run {
        /// The source file to compile
        file: PathBuf,

        /// Arguments to pass to the compiled function
        args: Vec<f64>,

        /// Trace JIT compilation events
        #[arg(long)]
        trace_jit: bool,

        /// Hex-dump the emitted machine code to stderr
        #[arg(long)]
        dump_code: bool,
    },
    /// Compile a source file and hex-dump its machine code
    Dump {
        /// The source file to compile
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            args,
            trace_jit,
            dump_code,
        } => {
            let config = RuntimeConfig {
                trace_jit,
                dump_code,
            };
            match compiler::run_file(&file, &config, &args) {
                Ok(result) => println!("{}", result),
                Err(e) => {
                    eprintln!("{}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
        Commands::Dump { file } => {
            match compiler::compile_file(&file, &RuntimeConfig::default()) {
                Ok(compiled) => print!("{}", compiler::format_code(compiled.code())),
                Err(e) => {
                    eprintln!("{}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
    }

    ExitCode::SUCCESS
}
