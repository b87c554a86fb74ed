use std::sync::Arc;

use fleetwire::{selector, ConnectionCallback, PublishChannel};
use tracing::{info, warn};

use crate::cmd::{ctrl_c, parse_duration, Context, SubscribeArgs};
use crate::exit::{channel_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::print_message;

pub async fn run(args: SubscribeArgs, ctx: &Context) -> CliResult<i32> {
    let timeout = args.timeout.as_deref().map(parse_duration).transpose()?;
    let mut config = ctx.config.clone();
    if args.id.is_some() {
        config.id = args.id;
    }

    let client = selector::publish_client(&config).map_err(|err| channel_error("subscribe", err))?;
    let on_connection: ConnectionCallback = Arc::new(|connected: bool| {
        if connected {
            info!("connected to publisher");
        } else {
            warn!("lost publisher connection; reconnecting");
        }
    });
    client
        .connect(timeout, Some(on_connection))
        .await
        .map_err(|err| channel_error("connect to publisher", err))?;

    let source = ctx.config.transport.clone();
    let mut received = 0usize;
    let outcome = loop {
        if args.count.is_some_and(|count| received >= count) {
            break Ok(SUCCESS);
        }
        let next = tokio::select! {
            next = client.recv(timeout) => next,
            waited = ctrl_c() => break waited.map(|()| SUCCESS),
        };
        match next {
            Ok(Some(message)) => {
                received += 1;
                print_message("message", &source, &message, ctx.format);
            }
            Ok(None) => {
                break Err(CliError::new(
                    TIMEOUT,
                    format!("no message within {timeout:?} after {received} received"),
                ))
            }
            Err(err) => break Err(channel_error("receive", err)),
        }
    };

    client.close().await;
    outcome
}
