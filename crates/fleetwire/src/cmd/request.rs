use fleetwire::{selector, RequestChannel};
use tracing::debug;

use crate::cmd::{parse_duration, parse_json, Context, RequestArgs};
use crate::exit::{channel_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::print_message;

pub async fn run(args: RequestArgs, ctx: &Context) -> CliResult<i32> {
    let load = parse_json(&args.json)?;
    if !load.is_object() {
        return Err(CliError::new(USAGE, "request load must be a JSON object"));
    }
    let tries = args.tries.unwrap_or(ctx.config.request_tries);
    if tries == 0 {
        return Err(CliError::new(USAGE, "--tries must be at least 1"));
    }
    let timeout = match args.timeout.as_deref() {
        Some(text) => parse_duration(text)?,
        None => ctx.config.request_timeout(),
    };

    let client = selector::request_client(&ctx.config).map_err(|err| channel_error("request", err))?;
    let endpoint = client.endpoint().to_string();
    debug!(%endpoint, tries, ?timeout, "sending request");

    let result = client.send(load, tries, timeout).await;
    client.close().await;
    let reply = result.map_err(|err| channel_error(&format!("request to {endpoint}"), err))?;

    print_message("reply", &endpoint, &reply, ctx.format);
    Ok(SUCCESS)
}
