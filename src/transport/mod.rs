//! Transport module - the three channel backends behind one contract.
//!
//! - [`PipeChannel`]: anonymous unidirectional pipe
//! - [`SocketChannel`]: Unix-domain or IPv4 stream socket
//! - [`SharedMemoryChannel`]: named fixed-size region, last-value semantics
//!
//! Every backend implements [`Channel`]; readable and writable backends add
//! [`ReadChannel`] / [`WriteChannel`]. Stream I/O failures never surface as
//! errors once a channel is open: reads stop with what was gathered and
//! writes report how many bytes made it out.

use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};

use bytes::{Bytes, BytesMut};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};

mod pipe;
mod retry;
mod shm;
mod socket;

pub use pipe::PipeChannel;
pub use retry::RetryPolicy;
pub use shm::{SharedMemoryChannel, DEFAULT_SHM_SIZE};
pub use socket::{unix_socket_path, SocketChannel, SocketDomain, DEFAULT_ACCEPT_TIMEOUT};

/// Read chunk size for draining reads.
const READ_CHUNK: usize = 4096;

/// Which backend a channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Pipe,
    Socket,
    SharedMemory,
}

/// Capabilities shared by every channel.
pub trait Channel {
    /// The backend this channel belongs to.
    fn kind(&self) -> ChannelKind;

    /// Release every OS resource owned by the channel.
    ///
    /// Idempotent; also runs on drop.
    fn close(&mut self);
}

/// A channel that can be read from.
pub trait ReadChannel: Channel {
    /// Read what the peer produced.
    ///
    /// Pipes and sockets drain until end of stream. Shared memory returns the
    /// region's current contents.
    fn read_all(&mut self) -> Bytes;
}

/// A channel that can be written to.
pub trait WriteChannel: Channel {
    /// Write `data`, returning the number of bytes delivered.
    fn write(&mut self, data: &[u8]) -> usize;
}

/// Read from `reader` until end of stream.
///
/// `EINTR` is retried; any other error ends the read with the bytes gathered
/// so far.
pub(crate) fn drain<R: Read>(reader: &mut R) -> Bytes {
    let mut out = BytesMut::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("Read ended early: {}", e);
                break;
            }
        }
    }

    out.freeze()
}

/// Push all of `data` into `writer`, retrying short writes and `EINTR`.
///
/// Returns how many bytes were written before the peer went away.
pub(crate) fn write_fully<W: Write>(writer: &mut W, data: &[u8]) -> usize {
    let mut written = 0;

    while written < data.len() {
        match writer.write(&data[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(
                    "Write truncated at {} of {} bytes: {}",
                    written,
                    data.len(),
                    e
                );
                break;
            }
        }
    }

    written
}

/// Mark `fd` close-on-exec so only explicitly redirected descriptors reach a child.
pub(crate) fn set_cloexec(fd: &OwnedFd) -> nix::Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map(|_| ())
}
