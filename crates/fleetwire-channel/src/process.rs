use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::lock;

/// A long-running unit of work a service hands to its host.
pub type ProcessFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Host-side supervisor that runs the processes services register in `pre_fork`.
///
/// The registered future must be driven to completion (or dropped) for the
/// service's `close` to return.
pub trait ProcessManager: Send + Sync {
    fn add_process(&self, name: &str, process: ProcessFuture);
}

/// Runs each registered process as a task on a Tokio runtime.
pub struct TaskManager {
    handle: Handle,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TaskManager {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Names of the registered processes, in registration order.
    pub fn names(&self) -> Vec<String> {
        lock(&self.tasks)
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Number of registered processes that have not finished.
    pub fn running(&self) -> usize {
        lock(&self.tasks)
            .iter()
            .filter(|(_, task)| !task.is_finished())
            .count()
    }

    /// Abort every process and wait for them to unwind.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for (name, task) in tasks {
            task.abort();
            let _ = task.await;
            debug!(process = %name, "process stopped");
        }
    }
}

impl ProcessManager for TaskManager {
    fn add_process(&self, name: &str, process: ProcessFuture) {
        debug!(process = %name, "starting process");
        let task = self.handle.spawn(process);
        lock(&self.tasks).push((name.to_string(), task));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn runs_and_stops_processes() {
        let manager = TaskManager::new(Handle::current());
        let (tx, rx) = tokio::sync::oneshot::channel();
        manager.add_process(
            "notifier",
            Box::pin(async move {
                let _ = tx.send(());
            }),
        );
        manager.add_process(
            "forever",
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }),
        );

        rx.await.expect("process should run");
        assert_eq!(manager.names(), vec!["notifier", "forever"]);

        manager.shutdown().await;
        assert_eq!(manager.running(), 0);
        assert!(manager.names().is_empty());
    }
}
