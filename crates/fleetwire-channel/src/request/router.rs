use fleetwire_frame::Message;

use crate::config::{WorkerPool, ANY_COMMAND};

/// Payload key naming the command a request carries.
pub const COMMAND_KEY: &str = "cmd";

/// Picks the worker pool for a request payload.
///
/// Order of precedence: the first pool listing the payload's `cmd`, then the
/// first pool listing `"*"`, then the first pool.
#[derive(Debug, Clone)]
pub struct Router {
    pools: Vec<WorkerPool>,
}

impl Router {
    pub fn new(pools: Vec<WorkerPool>) -> Self {
        Self { pools }
    }

    pub fn pools(&self) -> &[WorkerPool] {
        &self.pools
    }

    /// Index of the pool named `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.pools.iter().position(|pool| pool.name == name)
    }

    pub fn route(&self, payload: &Message) -> usize {
        let command = payload.get(COMMAND_KEY).and_then(Message::as_str);
        if let Some(command) = command {
            if let Some(idx) = self.find(|c| c == command) {
                return idx;
            }
        }
        self.find(|c| c == ANY_COMMAND).unwrap_or(0)
    }

    fn find(&self, matches: impl Fn(&str) -> bool) -> Option<usize> {
        self.pools
            .iter()
            .position(|pool| pool.commands.iter().any(|c| matches(c)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn pool(name: &str, commands: &[&str]) -> WorkerPool {
        WorkerPool {
            name: name.to_string(),
            worker_count: 1,
            commands: commands.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn routes_by_command_then_wildcard() {
        let router = Router::new(vec![
            pool("auth", &["_auth"]),
            pool("general", &["*"]),
            pool("returns", &["_return", "_syndic_return"]),
        ]);

        assert_eq!(router.route(&json!({"cmd": "_auth"})), 0);
        assert_eq!(router.route(&json!({"cmd": "_syndic_return"})), 2);
        assert_eq!(router.route(&json!({"cmd": "_minion_event"})), 1);
        assert_eq!(router.route(&json!({"no_cmd": true})), 1);
    }

    #[test]
    fn unknown_command_without_wildcard_goes_to_first_pool() {
        let router = Router::new(vec![pool("a", &["x"]), pool("b", &["y"])]);
        assert_eq!(router.route(&json!({"cmd": "z"})), 0);
        assert_eq!(router.position("b"), Some(1));
        assert_eq!(router.position("c"), None);
    }
}
