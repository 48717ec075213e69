//! # proc-ipc
//!
//! Spawn a child process and exchange its standard streams with it over one
//! of three interchangeable transports.
//!
//! ## Architecture
//!
//! - **Pipes**: anonymous pipes on the child's stdin/stdout/stderr
//! - **Sockets**: Unix-domain or IPv4 stream connections, ports passed in argv
//! - **Shared memory**: two named regions signalled by two process-shared
//!   counting semaphores, names passed in argv
//!
//! The parent side is [`Process`]. Children that use sockets or shared
//! memory find their endpoints through [`control`].
//!
//! ## Example
//!
//! ```
//! use proc_ipc::Process;
//!
//! let mut child = Process::new("cat", Vec::<String>::new());
//! child.start().unwrap();
//! child.write_stdin(b"round trip").unwrap();
//! child.close_stdin().unwrap();
//! assert_eq!(&child.read_stdout().unwrap()[..], b"round trip");
//! assert_eq!(child.wait(), 0);
//! ```

#[cfg(not(unix))]
compile_error!("proc-ipc only supports Unix targets");

pub mod config;
pub mod control;
pub mod error;
pub mod platform;
pub mod process;
pub mod semaphore;
pub mod transport;

pub use config::{ProcessConfig, TransportConfig};
pub use error::{IpcError, Result, EXIT_LAUNCH_FAILURE, WAIT_FAILED};
pub use process::{Process, ProcessBuilder, ProcessOptions, ProcessState, TransportMode};
pub use semaphore::CrossProcessSemaphore;
pub use transport::SocketDomain;
