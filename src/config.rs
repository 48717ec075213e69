//! Declarative process configuration.
//!
//! A [`ProcessConfig`] names the program, its arguments and the transport
//! to start it with. It is plain serde data, so it can live in a JSON file
//! next to the caller's own settings.
//!
//! # Example
//!
//! ```
//! use proc_ipc::config::{ProcessConfig, TransportConfig};
//!
//! let config = ProcessConfig::from_json(
//!     r#"{ "program": "cat", "transport": { "mode": "pipes" } }"#,
//! ).unwrap();
//! assert_eq!(config.transport, TransportConfig::Pipes);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::process::{Process, ProcessOptions, DEFAULT_LISTEN_BACKLOG};
use crate::transport::{SocketDomain, DEFAULT_ACCEPT_TIMEOUT, DEFAULT_SHM_SIZE};

/// Which transport to start the child with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Anonymous pipes on the child's stdin/stdout/stderr.
    #[default]
    Pipes,
    /// Three listeners on `base_port..=base_port + 2`.
    Sockets {
        base_port: u16,
        #[serde(default = "default_domain")]
        domain: SocketDomain,
    },
    /// Two shared-memory regions of `size` bytes plus two semaphores.
    SharedMemory {
        #[serde(default = "default_shm_size")]
        size: usize,
    },
}

fn default_domain() -> SocketDomain {
    SocketDomain::Unix
}

fn default_shm_size() -> usize {
    DEFAULT_SHM_SIZE
}

fn default_accept_timeout_ms() -> u64 {
    DEFAULT_ACCEPT_TIMEOUT.as_millis() as u64
}

fn default_listen_backlog() -> i32 {
    DEFAULT_LISTEN_BACKLOG
}

/// Everything needed to spawn one child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub transport: TransportConfig,
    /// Per-listener accept bound, sockets only.
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,
}

impl ProcessConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Options derived from this configuration.
    pub fn options(&self) -> ProcessOptions {
        ProcessOptions {
            accept_timeout: Duration::from_millis(self.accept_timeout_ms),
            listen_backlog: self.listen_backlog,
        }
    }

    /// Build the [`Process`] without starting it.
    pub fn build(&self) -> Process {
        Process::with_options(&self.program, self.args.iter(), self.options())
    }

    /// Build the [`Process`] and start it with the configured transport.
    pub fn spawn(&self) -> Result<Process> {
        let mut process = self.build();
        match self.transport {
            TransportConfig::Pipes => process.start()?,
            TransportConfig::Sockets { base_port, domain } => {
                process.start_sockets(base_port, domain)?
            }
            TransportConfig::SharedMemory { size } => process.start_shared_memory(size)?,
        }
        Ok(process)
    }
}

/// `Duration` as whole milliseconds.
///
/// Use with `#[serde(with = "crate::config::duration_ms")]`.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
