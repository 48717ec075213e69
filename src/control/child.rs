//! Child-side endpoint attachment.
//!
//! A child started with sockets or shared memory decodes its argv with
//! [`ChildArgs`](super::ChildArgs) and attaches through one of these types.
//!
//! # Example
//!
//! ```ignore
//! use proc_ipc::control::{ChildArgs, SocketStreams};
//! use proc_ipc::transport::{ReadChannel, RetryPolicy, WriteChannel};
//!
//! let (args, _rest) = ChildArgs::from_env()?;
//! let mut streams = SocketStreams::connect(&args, "127.0.0.1", &RetryPolicy::default())?;
//! let input = streams.stdin.read_all();
//! streams.stdout.write(&input);
//! ```

use bytes::Bytes;

use super::ChildArgs;
use crate::error::{IpcError, Result};
use crate::semaphore::CrossProcessSemaphore;
use crate::transport::{RetryPolicy, SharedMemoryChannel, SocketChannel};

/// The child's three socket connections.
///
/// Dropping the struct closes all three, which is what lets the parent's
/// draining reads finish.
#[derive(Debug)]
pub struct SocketStreams {
    pub stdin: SocketChannel,
    pub stdout: SocketChannel,
    pub stderr: SocketChannel,
}

impl SocketStreams {
    /// Connect to the parent's listeners in the order it accepts them.
    ///
    /// `host` is only used for IPv4.
    pub fn connect(args: &ChildArgs, host: &str, policy: &RetryPolicy) -> Result<Self> {
        let ChildArgs::Sockets {
            domain,
            port_in,
            port_out,
            port_err,
        } = *args
        else {
            return Err(IpcError::InvalidArgument(
                "socket endpoints expected".to_string(),
            ));
        };

        let stdin = SocketChannel::connect_with_retry(domain, host, port_in, policy)?;
        let stdout = SocketChannel::connect_with_retry(domain, host, port_out, policy)?;
        let stderr = SocketChannel::connect_with_retry(domain, host, port_err, policy)?;
        tracing::debug!("Connected {} streams on ports {}-{}", domain, port_in, port_err);

        Ok(Self {
            stdin,
            stdout,
            stderr,
        })
    }
}

/// The child's view of a shared-memory transport.
///
/// "in" carries parent → child, "out" child → parent. Each message is one
/// write to a region followed by one post on the matching semaphore.
#[derive(Debug)]
pub struct SharedMemoryEndpoints {
    shm_in: SharedMemoryChannel,
    shm_out: SharedMemoryChannel,
    sem_in: CrossProcessSemaphore,
    sem_out: CrossProcessSemaphore,
}

impl SharedMemoryEndpoints {
    /// Map both regions and open both semaphores created by the parent.
    pub fn attach(args: &ChildArgs) -> Result<Self> {
        let ChildArgs::SharedMemory {
            shm_in,
            shm_out,
            sem_in,
            sem_out,
        } = args
        else {
            return Err(IpcError::InvalidArgument(
                "shared memory endpoints expected".to_string(),
            ));
        };

        Ok(Self {
            shm_in: SharedMemoryChannel::attach(shm_in)?,
            shm_out: SharedMemoryChannel::attach(shm_out)?,
            sem_in: CrossProcessSemaphore::open(sem_in)?,
            sem_out: CrossProcessSemaphore::open(sem_out)?,
        })
    }

    /// Block until the parent posts, then return the "in" value.
    pub fn recv(&mut self) -> Result<Bytes> {
        self.sem_in.wait()?;
        Ok(self.shm_in.read())
    }

    /// Store `data` in "out" and wake the parent. Returns the stored length.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        let stored = self.shm_out.write(data);
        self.sem_out.post()?;
        Ok(stored)
    }

    /// Usable payload per message.
    pub fn capacity(&self) -> usize {
        self.shm_out.size().saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ReadChannel, SocketDomain, WriteChannel};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_socket_streams_connect_in_order() {
        let ports = [47111, 47112, 47113];
        let listeners: Vec<SocketChannel> = ports
            .iter()
            .map(|&port| {
                let mut l = SocketChannel::create(SocketDomain::Unix).unwrap();
                l.bind_and_listen(port, 1).unwrap();
                l
            })
            .collect();

        let args = ChildArgs::Sockets {
            domain: SocketDomain::Unix,
            port_in: ports[0],
            port_out: ports[1],
            port_err: ports[2],
        };
        let child = thread::spawn(move || {
            let mut streams =
                SocketStreams::connect(&args, "127.0.0.1", &RetryPolicy::default()).unwrap();
            let input = streams.stdin.read_all();
            streams.stdout.write(&input);
            streams.stderr.write(b"ok");
        });

        let timeout = Duration::from_secs(5);
        let mut stdin = listeners[0].accept_client(timeout).unwrap();
        let mut stdout = listeners[1].accept_client(timeout).unwrap();
        let mut stderr = listeners[2].accept_client(timeout).unwrap();

        stdin.write(b"relay");
        stdin.close_write();
        assert_eq!(&stdout.read_all()[..], b"relay");
        assert_eq!(&stderr.read_all()[..], b"ok");
        child.join().unwrap();
    }

    #[test]
    fn test_socket_streams_reject_shared_memory_args() {
        let args = ChildArgs::SharedMemory {
            shm_in: "/a".into(),
            shm_out: "/b".into(),
            sem_in: "/c".into(),
            sem_out: "/d".into(),
        };
        let err = SocketStreams::connect(&args, "127.0.0.1", &RetryPolicy::no_retry()).unwrap_err();
        assert!(matches!(err, IpcError::InvalidArgument(_)));
    }

    #[test]
    fn test_shared_memory_exchange() {
        let tag = |role: &str| format!("/ipcc{}.{}", std::process::id(), role);
        let args = ChildArgs::SharedMemory {
            shm_in: tag("shm_in"),
            shm_out: tag("shm_out"),
            sem_in: tag("sem_in"),
            sem_out: tag("sem_out"),
        };
        let ChildArgs::SharedMemory {
            shm_in,
            shm_out,
            sem_in,
            sem_out,
        } = &args
        else {
            unreachable!()
        };

        let mut parent_in = SharedMemoryChannel::create(shm_in, 128).unwrap();
        let parent_out = SharedMemoryChannel::create(shm_out, 128).unwrap();
        let parent_sem_in = CrossProcessSemaphore::create(sem_in, 0).unwrap();
        let parent_sem_out = CrossProcessSemaphore::create(sem_out, 0).unwrap();

        let child_args = args.clone();
        let child = thread::spawn(move || {
            let mut endpoints = SharedMemoryEndpoints::attach(&child_args).unwrap();
            assert_eq!(endpoints.capacity(), 127);
            let msg = endpoints.recv().unwrap();
            let mut reply = b"child: ".to_vec();
            reply.extend_from_slice(&msg);
            endpoints.send(&reply).unwrap();
        });

        parent_in.write(b"hello");
        parent_sem_in.post().unwrap();
        parent_sem_out.wait().unwrap();
        assert_eq!(&parent_out.read()[..], b"child: hello");
        child.join().unwrap();
    }
}
