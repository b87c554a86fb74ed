mod cmd;
mod exit;
mod logging;
mod output;

use std::path::PathBuf;

use clap::Parser;

use crate::cmd::{Command, Context};
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "fleetwire", version, about = "fleetwire channel diagnostics")]
struct Cli {
    /// Transport config file (JSON). Defaults apply when omitted.
    #[arg(long, value_name = "FILE", env = "FLEETWIRE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Transport name, overriding the config file (tcp, ipc, ws).
    #[arg(long, value_name = "NAME", global = true)]
    transport: Option<String>,

    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = Context::load(cli.config.as_ref(), cli.transport.as_deref(), format)
        .and_then(|ctx| cmd::run(cli.command, ctx));

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}
