use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use fleetwire_channel::TransportConfig;

use crate::exit::{channel_error, CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod publish;
pub mod pubd;
pub mod request;
pub mod serve;
pub mod subscribe;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an echo request server.
    Serve(ServeArgs),
    /// Send one request and print the reply.
    Request(RequestArgs),
    /// Run the publish daemon.
    PublishDaemon(PublishDaemonArgs),
    /// Push one message to a running publish daemon.
    Publish(PublishArgs),
    /// Print published messages.
    Subscribe(SubscribeArgs),
    /// Show version information.
    Version(VersionArgs),
}

/// Settings shared by every command.
pub struct Context {
    pub config: TransportConfig,
    pub format: OutputFormat,
}

impl Context {
    /// Load `--config` (defaults when absent) and apply `--transport`.
    pub fn load(
        config: Option<&PathBuf>,
        transport: Option<&str>,
        format: OutputFormat,
    ) -> CliResult<Self> {
        let mut config = match config {
            Some(path) => TransportConfig::from_path(path)
                .map_err(|err| channel_error(&format!("load {}", path.display()), err))?,
            None => TransportConfig::default(),
        };
        if let Some(transport) = transport {
            config.transport = transport.to_string();
        }
        Ok(Self { config, format })
    }
}

pub fn run(command: Command, ctx: Context) -> CliResult<i32> {
    if let Command::Version(args) = &command {
        return version::run(args);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::new(INTERNAL, format!("failed to start runtime: {err}")))?;

    runtime.block_on(async move {
        match command {
            Command::Serve(args) => serve::run(args, &ctx).await,
            Command::Request(args) => request::run(args, &ctx).await,
            Command::PublishDaemon(args) => pubd::run(args, &ctx).await,
            Command::Publish(args) => publish::run(args, &ctx).await,
            Command::Subscribe(args) => subscribe::run(args, &ctx).await,
            Command::Version(args) => version::run(&args),
        }
    })
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {}

#[derive(Args, Debug)]
pub struct RequestArgs {
    /// JSON load to send.
    #[arg(default_value = "{}")]
    pub json: String,
    /// Attempts before giving up. Default: `request_tries` from the config.
    #[arg(long)]
    pub tries: Option<u32>,
    /// Per-attempt timeout (e.g. 5s, 500ms). Default: `request_timeout_secs`.
    #[arg(long)]
    pub timeout: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct PublishDaemonArgs {}

#[derive(Args, Debug)]
pub struct PublishArgs {
    /// JSON message to publish.
    pub json: String,
    /// Deliver only to the subscriber with this identity (repeatable).
    #[arg(long = "topic", value_name = "ID")]
    pub topics: Vec<String>,
}

#[derive(Args, Debug)]
pub struct SubscribeArgs {
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
    /// Give up when nothing arrives for this long (e.g. 5s, 500ms).
    #[arg(long)]
    pub timeout: Option<String>,
    /// Identity announced to the publisher, for topic delivery.
    #[arg(long)]
    pub id: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show build details and available transports.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `5s`, `150ms` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

/// Parse a command-line JSON argument.
pub fn parse_json(input: &str) -> CliResult<serde_json::Value> {
    serde_json::from_str(input)
        .map_err(|err| CliError::new(USAGE, format!("invalid JSON argument: {err}")))
}

pub async fn ctrl_c() -> CliResult<()> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|err| CliError::new(INTERNAL, format!("failed to install ctrl-c handler: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(
            parse_duration("2s").expect("2s should parse"),
            Duration::from_secs(2)
        );
        assert_eq!(
            parse_duration("150ms").expect("150ms should parse"),
            Duration::from_millis(150)
        );
        assert_eq!(
            parse_duration("3").expect("bare seconds should parse"),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn transport_flag_overrides_config() {
        let ctx = Context::load(None, Some("ws"), OutputFormat::Json).expect("defaults should load");
        assert_eq!(ctx.config.transport, "ws");
        assert_eq!(ctx.config.ret_port, 4506);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let path = PathBuf::from("/nonexistent/fleetwire.json");
        assert!(Context::load(Some(&path), None, OutputFormat::Json).is_err());
    }
}
