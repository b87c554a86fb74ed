use std::sync::Arc;

use fleetwire::channel::{PresenceHook, SubscriberInfo};
use fleetwire::{selector, PublishServer, PublishService, TaskManager};
use serde_json::json;
use tokio::runtime::Handle;
use tracing::info;

use crate::cmd::{ctrl_c, Context, PublishDaemonArgs};
use crate::exit::{channel_error, CliResult, SUCCESS};
use crate::output::print_message;

struct LogPresence;

impl PresenceHook for LogPresence {
    fn on_connect(&self, subscriber: &SubscriberInfo) {
        info!(
            subscriber = subscriber.id,
            peer = %subscriber.peer,
            identity = ?subscriber.identity,
            "subscriber connected"
        );
    }

    fn on_disconnect(&self, subscriber: &SubscriberInfo) {
        info!(
            subscriber = subscriber.id,
            peer = %subscriber.peer,
            identity = ?subscriber.identity,
            "subscriber disconnected"
        );
    }
}

pub async fn run(_args: PublishDaemonArgs, ctx: &Context) -> CliResult<i32> {
    let binding =
        selector::resolve(&ctx.config.transport).map_err(|err| channel_error("publish-daemon", err))?;
    let server =
        PublishServer::new(&ctx.config, binding).map_err(|err| channel_error("publish-daemon", err))?;
    server.set_presence(Some(Arc::new(LogPresence)));

    let manager = TaskManager::new(Handle::current());
    server
        .pre_fork(&manager)
        .await
        .map_err(|err| channel_error("start publish daemon", err))?;
    let endpoint = server
        .wait_started()
        .await
        .map_err(|err| channel_error("start publish daemon", err))?
        .to_string();
    let pull = server.pull_endpoint().map(|pull| pull.to_string());
    info!(%endpoint, ?pull, "publish daemon ready");
    print_message("listening", &endpoint, &json!({"pull": pull}), ctx.format);

    let waited = ctrl_c().await;
    info!(subscribers = server.subscriber_count(), "shutting down");
    server.close().await;
    manager.shutdown().await;
    waited.map(|()| SUCCESS)
}
