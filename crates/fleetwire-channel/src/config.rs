//! Transport configuration.
//!
//! Every field has a default, so a partial JSON document (or none at all)
//! yields a usable configuration. Call [`TransportConfig::validate`] (the
//! channel constructors do) before opening sockets.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetwire_frame::DEFAULT_MAX_PAYLOAD;
use fleetwire_transport::{BindOptions, KeepaliveOptions};
use serde::{Deserialize, Serialize};

use crate::binding::WORKER_PORT_SPAN;
use crate::error::{ChannelError, Result};

/// Wildcard command entry: the pool accepts anything not routed elsewhere.
pub const ANY_COMMAND: &str = "*";

/// How node-local endpoints (publish pull, worker sockets) are addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpcMode {
    /// Unix domain sockets under `sock_dir`.
    #[default]
    Ipc,
    /// TCP on the loopback interface.
    Tcp,
}

/// A named pool of request workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPool {
    pub name: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Commands routed to this pool; `"*"` catches unrouted commands.
    #[serde(default)]
    pub commands: Vec<String>,
}

fn default_worker_count() -> usize {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Binding name: `tcp`, `ipc`, `ws` (and aliases).
    pub transport: String,
    /// Interface servers bind to.
    pub interface: String,
    /// Address clients connect to.
    pub master_ip: String,
    pub ret_port: u16,
    pub publish_port: u16,
    pub sock_dir: PathBuf,
    pub ipc_mode: IpcMode,
    pub tcp_publish_pull_port: u16,
    pub tcp_workers_port: u16,
    /// Pool a client addresses when forwarding locally.
    pub pool_name: Option<String>,
    /// Worker count of the implicit default pool when `worker_pools` is empty.
    pub worker_threads: usize,
    pub worker_pools: Vec<WorkerPool>,
    pub worker_queue_depth: usize,
    pub expose_worker_sockets: bool,
    pub backlog: u32,
    pub socket_mode: u32,
    pub keepalive: KeepaliveOptions,
    /// Per-subscriber queue depth before frames are dropped.
    pub pub_hwm: usize,
    pub filtering: bool,
    pub encrypted_transfer: bool,
    pub reconnect_backoff_secs: f64,
    pub request_timeout_secs: f64,
    pub request_tries: u32,
    pub request_pool_size: usize,
    pub ws_path: String,
    pub max_payload_size: usize,
    /// Identity a publish client announces to the server.
    pub id: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transport: "tcp".to_string(),
            interface: "127.0.0.1".to_string(),
            master_ip: "127.0.0.1".to_string(),
            ret_port: 4506,
            publish_port: 4505,
            sock_dir: std::env::temp_dir().join("fleetwire"),
            ipc_mode: IpcMode::Ipc,
            tcp_publish_pull_port: 4514,
            tcp_workers_port: 4515,
            pool_name: None,
            worker_threads: 5,
            worker_pools: Vec::new(),
            worker_queue_depth: 1000,
            expose_worker_sockets: false,
            backlog: 128,
            socket_mode: 0o600,
            keepalive: KeepaliveOptions::default(),
            pub_hwm: 1000,
            filtering: true,
            encrypted_transfer: false,
            reconnect_backoff_secs: 1.0,
            request_timeout_secs: 60.0,
            request_tries: 3,
            request_pool_size: 1,
            ws_path: "/ws".to_string(),
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            id: None,
        }
    }
}

impl TransportConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            ChannelError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    /// Check names and numeric limits before any socket is opened.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for pool in &self.worker_pools {
            validate_pool_name(&pool.name)?;
            if !seen.insert(pool.name.as_str()) {
                return Err(ChannelError::Config(format!(
                    "duplicate worker pool {:?}",
                    pool.name
                )));
            }
            if pool.worker_count == 0 {
                return Err(ChannelError::Config(format!(
                    "worker pool {:?} has no workers",
                    pool.name
                )));
            }
        }
        if let Some(name) = &self.pool_name {
            validate_pool_name(name)?;
        }

        for (field, value) in [
            ("worker_threads", self.worker_threads),
            ("worker_queue_depth", self.worker_queue_depth),
            ("pub_hwm", self.pub_hwm),
            ("request_pool_size", self.request_pool_size),
            ("max_payload_size", self.max_payload_size),
        ] {
            if value == 0 {
                return Err(ChannelError::Config(format!("{field} must be positive")));
            }
        }
        if self.request_tries == 0 {
            return Err(ChannelError::Config("request_tries must be positive".into()));
        }
        if self.backlog == 0 {
            return Err(ChannelError::Config("backlog must be positive".into()));
        }
        for (field, secs) in [
            ("reconnect_backoff_secs", self.reconnect_backoff_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ] {
            if Duration::try_from_secs_f64(secs).is_err() {
                return Err(ChannelError::Config(format!(
                    "{field} must be a non-negative number of seconds, got {secs}"
                )));
            }
        }
        if self.ipc_mode == IpcMode::Tcp
            && u64::from(self.tcp_workers_port) + WORKER_PORT_SPAN > u64::from(u16::MAX) + 1
        {
            return Err(ChannelError::Config(format!(
                "tcp_workers_port {} must leave {WORKER_PORT_SPAN} ports for worker pools",
                self.tcp_workers_port
            )));
        }
        if !self.ws_path.starts_with('/') {
            return Err(ChannelError::Config(format!(
                "ws_path {:?} must start with '/'",
                self.ws_path
            )));
        }
        if self.ret_port != 0 && self.ret_port == self.publish_port {
            return Err(ChannelError::Config(format!(
                "ret_port and publish_port are both {}",
                self.ret_port
            )));
        }
        Ok(())
    }

    /// Worker pools in routing order; a single catch-all pool when none are configured.
    pub fn effective_pools(&self) -> Vec<WorkerPool> {
        if self.worker_pools.is_empty() {
            vec![WorkerPool {
                name: "default".to_string(),
                worker_count: self.worker_threads,
                commands: vec![ANY_COMMAND.to_string()],
            }]
        } else {
            self.worker_pools.clone()
        }
    }

    pub fn reconnect_backoff(&self) -> Duration {
        seconds(self.reconnect_backoff_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        seconds(self.request_timeout_secs)
    }

    pub fn bind_options(&self) -> BindOptions {
        BindOptions {
            backlog: self.backlog,
            socket_mode: self.socket_mode,
            keepalive: self.keepalive.clone(),
        }
    }

    pub fn frame_config(&self) -> fleetwire_frame::FrameConfig {
        fleetwire_frame::FrameConfig {
            max_payload_size: self.max_payload_size,
        }
    }
}

/// Saturating conversion for configs that skipped `validate`.
fn seconds(secs: f64) -> Duration {
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) => duration,
        Err(_) if secs > 0.0 => Duration::MAX,
        Err(_) => Duration::ZERO,
    }
}

/// Reject pool names that are empty or could escape `sock_dir` when used
/// in a socket file name.
pub fn validate_pool_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("must not be empty")
    } else if name.contains('/') || name.contains('\\') {
        Some("must not contain path separators")
    } else if name.contains("..") {
        Some("must not contain '..'")
    } else if name.contains('\0') {
        Some("must not contain NUL")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ChannelError::Config(format!(
            "invalid pool name {name:?}: {reason}"
        ))),
        None => Ok(()),
    }
}
