//! Error types for proc-ipc.

use std::time::Duration;

use thiserror::Error;

/// Exit status reported by a child whose executable could not be launched.
///
/// `execvp` failure is only observable after `fork` already succeeded, so it
/// is surfaced through the child's exit status rather than as an error.
pub const EXIT_LAUNCH_FAILURE: i32 = 127;

/// Sentinel returned by `Process::wait` when the child was killed by a signal
/// or the wait itself failed.
pub const WAIT_FAILED: i32 = -1;

/// Main error type for all proc-ipc operations.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Allocating a pipe, socket, shared-memory segment or semaphore failed.
    #[error("failed to create {resource}: {source}")]
    ResourceCreation {
        /// What was being created (e.g. "pipe", "shared memory /ipc1.0.shm_in").
        resource: String,
        #[source]
        source: std::io::Error,
    },

    /// `fork` failed; no child exists.
    #[error("failed to spawn child process: {0}")]
    Spawn(#[source] std::io::Error),

    /// Dialing a socket failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// No inbound connection arrived within the accept bound.
    #[error("no connection on {addr} within {timeout:?}")]
    AcceptTimeout { addr: String, timeout: Duration },

    /// Binding or listening on an address failed (usually already in use).
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// An operation other than `start*` was called before the process started.
    #[error("process has not been started")]
    NotStarted,

    /// A `start*` method was called on a process that was already started.
    #[error("process has already been started")]
    AlreadyStarted,

    /// A name, argument or port range was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be parsed.
    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IpcError {
    pub(crate) fn resource(resource: impl Into<String>, source: impl Into<std::io::Error>) -> Self {
        IpcError::ResourceCreation {
            resource: resource.into(),
            source: source.into(),
        }
    }
}

impl From<nix::Error> for IpcError {
    fn from(errno: nix::Error) -> Self {
        IpcError::Io(errno.into())
    }
}

/// Result type alias using IpcError.
pub type Result<T> = std::result::Result<T, IpcError>;
