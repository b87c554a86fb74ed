use fleetwire::{selector, PublishService};
use serde_json::json;

use crate::cmd::{parse_json, Context, PublishArgs};
use crate::exit::{channel_error, CliResult, SUCCESS};
use crate::output::print_message;

pub async fn run(args: PublishArgs, ctx: &Context) -> CliResult<i32> {
    let load = parse_json(&args.json)?;
    let topics = (!args.topics.is_empty()).then_some(args.topics);

    let publisher =
        selector::publish_server(&ctx.config).map_err(|err| channel_error("publish", err))?;
    let result = publisher.publish(load.clone(), topics.clone()).await;
    publisher.close().await;
    result.map_err(|err| channel_error("push to publish daemon", err))?;

    print_message(
        "published",
        &ctx.config.transport,
        &json!({"load": load, "topics": topics}),
        ctx.format,
    );
    Ok(SUCCESS)
}
