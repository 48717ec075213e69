//! Anonymous pipe channel.
//!
//! A pipe has two ends with independent lifetimes. The parent keeps one end
//! and hands the other to the child through the launcher, then closes it.
//!
//! # Example
//!
//! ```
//! use proc_ipc::transport::{PipeChannel, ReadChannel, WriteChannel};
//!
//! let mut pipe = PipeChannel::create().unwrap();
//! pipe.write(b"hello");
//! pipe.close_write();
//! assert_eq!(&pipe.read_all()[..], b"hello");
//! ```

use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use bytes::Bytes;

#[cfg(any(target_os = "linux", target_os = "android"))]
use nix::fcntl::OFlag;

use super::{drain, write_fully, Channel, ChannelKind, ReadChannel, WriteChannel};
use crate::error::{IpcError, Result};
use crate::platform;

#[cfg(any(target_os = "linux", target_os = "android"))]
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(OFlag::O_CLOEXEC)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    let (r, w) = nix::unistd::pipe()?;
    super::set_cloexec(&r)?;
    super::set_cloexec(&w)?;
    Ok((r, w))
}

/// Unidirectional byte pipe.
///
/// Both ends are close-on-exec; only the end dup'ed onto a child's stdio
/// survives `execvp`.
#[derive(Debug, Default)]
pub struct PipeChannel {
    read: Option<File>,
    write: Option<File>,
}

impl PipeChannel {
    /// Allocate both ends of a new pipe.
    pub fn create() -> Result<Self> {
        platform::ensure_initialized();

        let (r, w) = cloexec_pipe().map_err(|e| IpcError::resource("pipe", e))?;

        Ok(Self {
            read: Some(File::from(r)),
            write: Some(File::from(w)),
        })
    }

    /// Release the read end. No-op if already closed.
    pub fn close_read(&mut self) {
        self.read.take();
    }

    /// Release the write end. No-op if already closed.
    ///
    /// Closing the last write end is what lets the reader see end of stream.
    pub fn close_write(&mut self) {
        self.write.take();
    }

    /// Borrow the read end, if still open.
    pub fn read_fd(&self) -> Option<BorrowedFd<'_>> {
        self.read.as_ref().map(|f| f.as_fd())
    }

    /// Borrow the write end, if still open.
    pub fn write_fd(&self) -> Option<BorrowedFd<'_>> {
        self.write.as_ref().map(|f| f.as_fd())
    }

    pub fn is_read_open(&self) -> bool {
        self.read.is_some()
    }

    pub fn is_write_open(&self) -> bool {
        self.write.is_some()
    }
}

impl Channel for PipeChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Pipe
    }

    fn close(&mut self) {
        self.close_read();
        self.close_write();
    }
}

impl ReadChannel for PipeChannel {
    /// Drain the read end until every writer has closed.
    ///
    /// Returns empty when the read end is already closed.
    fn read_all(&mut self) -> Bytes {
        match self.read.as_mut() {
            Some(file) => drain(file),
            None => Bytes::new(),
        }
    }
}

impl WriteChannel for PipeChannel {
    /// Returns 0 without writing when the write end is closed.
    fn write(&mut self, data: &[u8]) -> usize {
        match self.write.as_mut() {
            Some(file) => write_fully(file, data),
            None => 0,
        }
    }
}
