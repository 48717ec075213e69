//! Control plane - how a child finds its endpoints.
//!
//! The parent encodes the endpoints of the socket and shared-memory
//! transports as a four-argument argv prefix ([`ChildArgs`]). The child
//! decodes it and attaches with [`SocketStreams`] or
//! [`SharedMemoryEndpoints`].
//!
//! # Workflow
//!
//! 1. Parent creates listeners (or regions and semaphores)
//! 2. Parent spawns the child with the prefix ahead of the user arguments
//! 3. Child parses its argv and connects (or attaches)
//! 4. Raw bytes flow on the data plane
//!
//! # Example
//!
//! ```ignore
//! use proc_ipc::control::{ChildArgs, SharedMemoryEndpoints};
//!
//! let (args, _rest) = ChildArgs::from_env()?;
//! let mut endpoints = SharedMemoryEndpoints::attach(&args)?;
//! let msg = endpoints.recv()?;
//! endpoints.send(&msg)?;
//! ```

mod args;
mod child;

pub use args::{ChildArgs, PREFIX_LEN};
pub use child::{SharedMemoryEndpoints, SocketStreams};
