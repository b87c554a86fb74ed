use fleetwire::{handler_fn, selector, Dispatch, RequestService, TaskManager};
use serde_json::json;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::cmd::{ctrl_c, Context, ServeArgs};
use crate::exit::{channel_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::print_message;

pub async fn run(_args: ServeArgs, ctx: &Context) -> CliResult<i32> {
    let server = selector::request_server(&ctx.config).map_err(|err| channel_error("serve", err))?;
    let manager = TaskManager::new(Handle::current());

    server
        .pre_fork(&manager)
        .await
        .map_err(|err| channel_error("bind request server", err))?;
    let echo = handler_fn(|load| async move {
        debug!(%load, "echoing request");
        Ok((load, Dispatch::Send))
    });
    server
        .post_fork(echo, &Handle::current())
        .await
        .map_err(|err| channel_error("start workers", err))?;

    let endpoint = server
        .endpoint()
        .ok_or_else(|| CliError::new(INTERNAL, "request server has no bound endpoint"))?
        .to_string();
    info!(%endpoint, transport = %ctx.config.transport, "echo server ready");
    print_message(
        "listening",
        &endpoint,
        &json!({"processes": manager.names()}),
        ctx.format,
    );

    let waited = ctrl_c().await;
    info!("shutting down");
    server.close().await;
    manager.shutdown().await;
    waited.map(|()| SUCCESS)
}
