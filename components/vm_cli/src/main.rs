//! tiervm command-line entry point
//!
//! Parses CLI arguments and delegates to the Runtime for execution.

use clap::Parser as ClapParser;
use core_types::Value;
use tracing_subscriber::EnvFilter;
use vm_cli::{runtime, Cli, CliError, Command, Runtime};

fn install_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Run(args) => {
            let mut runtime = Runtime::from_args(&args)?;
            let result = runtime.execute_file(&args.file)?;
            // Print result if not None
            if !matches!(result, Value::None) {
                println!("{}", result.repr());
            }
        }
        Command::Disassemble { file } => {
            print!("{}", runtime::disassemble_file(&file)?);
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    install_tracing(cli.verbose);

    if let Err(err) = run(cli) {
        eprintln!("{}", err);
        std::process::exit(err.exit_code());
    }
}
