//! Named POSIX shared-memory channel.
//!
//! The region is a single overwrite buffer, not a queue: every `write`
//! replaces the previous value. Content is NUL-terminated, so a write keeps
//! at most `size - 1` bytes and a read stops at the first zero byte. Pair the
//! channel with a [`CrossProcessSemaphore`](crate::semaphore::CrossProcessSemaphore)
//! so the reader only looks after the writer has posted.
//!
//! # Example
//!
//! ```ignore
//! use proc_ipc::transport::SharedMemoryChannel;
//!
//! let mut owner = SharedMemoryChannel::create("/demo_region", 4096)?;
//! owner.write(b"hello");
//!
//! let peer = SharedMemoryChannel::open("/demo_region", 4096)?;
//! assert_eq!(&peer.read()[..], b"hello");
//! ```

use std::ffi::c_void;
use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use bytes::Bytes;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;

use super::{Channel, ChannelKind, ReadChannel, WriteChannel};
use crate::error::{IpcError, Result};

/// Default region size used by the shared-memory transport.
pub const DEFAULT_SHM_SIZE: usize = 4096;

/// A live mapping of a shared-memory object.
#[derive(Debug)]
struct Mapping {
    ptr: NonNull<c_void>,
    len: usize,
    _file: File,
}

impl Mapping {
    fn map(file: File, len: usize) -> nix::Result<Self> {
        let length = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
        // SAFETY: a fresh shared mapping of a descriptor we own; no existing
        // Rust memory is aliased.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )?
        };
        Ok(Self {
            ptr,
            len,
            _file: file,
        })
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from the successful mmap in `Mapping::map`.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            tracing::warn!("munmap failed: {}", e);
        }
    }
}

/// Fixed-size named shared-memory region.
#[derive(Debug)]
pub struct SharedMemoryChannel {
    name: String,
    mapping: Option<Mapping>,
    creator: bool,
}

// SAFETY: the mapping is process-shared memory accessed only through raw
// copies; moving the owner to another thread changes nothing about that.
unsafe impl Send for SharedMemoryChannel {}

fn validate_name(name: &str) -> Result<()> {
    let valid = name.len() > 1 && name.starts_with('/') && !name[1..].contains('/');
    if valid && !name.contains('\0') {
        Ok(())
    } else {
        Err(IpcError::InvalidArgument(format!(
            "shared memory name must look like \"/name\": {name:?}"
        )))
    }
}

fn mode() -> Mode {
    Mode::S_IRUSR | Mode::S_IWUSR
}

impl SharedMemoryChannel {
    /// Create (or take over) the region `name` with exactly `size` zeroed bytes.
    ///
    /// The creator unlinks the name again on [`Channel::close`].
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::create_with(name, size, OFlag::O_CREAT | OFlag::O_RDWR)
    }

    /// Like [`SharedMemoryChannel::create`], but fails if `name` already exists.
    ///
    /// A live region of the same name is left untouched.
    pub fn create_exclusive(name: &str, size: usize) -> Result<Self> {
        Self::create_with(name, size, OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR)
    }

    fn create_with(name: &str, size: usize, flags: OFlag) -> Result<Self> {
        validate_name(name)?;
        let resource = || format!("shared memory {name}");
        if size == 0 {
            return Err(IpcError::InvalidArgument(
                "shared memory size must be non-zero".to_string(),
            ));
        }

        let fd = shm_open(name, flags, mode()).map_err(|e| IpcError::resource(resource(), e))?;
        let file = File::from(fd);
        let mapping = file
            .set_len(size as u64)
            .and_then(|()| Mapping::map(file, size).map_err(std::io::Error::from))
            .map_err(|e| {
                // The name is ours now; do not leave it behind half-built.
                let _ = shm_unlink(name);
                IpcError::resource(resource(), e)
            })?;
        // SAFETY: the mapping is `size` bytes long and writable.
        unsafe { std::ptr::write_bytes(mapping.as_mut_ptr(), 0, size) };

        tracing::debug!("Created shared memory {} ({} bytes)", name, size);
        Ok(Self {
            name: name.to_string(),
            mapping: Some(mapping),
            creator: true,
        })
    }

    /// Map the region `name` as a second participant.
    ///
    /// The region is created if it does not exist yet and grown if it is
    /// smaller than `size`; existing content is never reset.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        validate_name(name)?;
        let resource = || format!("shared memory {name}");

        let fd = shm_open(name, OFlag::O_CREAT | OFlag::O_RDWR, mode())
            .map_err(|e| IpcError::resource(resource(), e))?;
        let file = File::from(fd);
        let current = file.metadata()?.len();
        if current < size as u64 {
            file.set_len(size as u64)
                .map_err(|e| IpcError::resource(resource(), e))?;
        }

        let mapping = Mapping::map(file, size).map_err(|e| IpcError::resource(resource(), e))?;
        tracing::debug!("Opened shared memory {} ({} bytes)", name, size);
        Ok(Self {
            name: name.to_string(),
            mapping: Some(mapping),
            creator: false,
        })
    }

    /// Map an existing region at its current size, without creating it.
    ///
    /// Used by children, which only learn region names from argv.
    pub fn attach(name: &str) -> Result<Self> {
        validate_name(name)?;
        let resource = || format!("shared memory {name}");

        let fd = shm_open(name, OFlag::O_RDWR, mode()).map_err(|e| IpcError::resource(resource(), e))?;
        let file = File::from(fd);
        let size = usize::try_from(file.metadata()?.len())
            .map_err(|_| IpcError::InvalidArgument(format!("{name} is too large to map")))?;

        let mapping = Mapping::map(file, size).map_err(|e| IpcError::resource(resource(), e))?;
        Ok(Self {
            name: name.to_string(),
            mapping: Some(mapping),
            creator: false,
        })
    }

    /// Store `data` as the region's value.
    ///
    /// Copies at most `size - 1` bytes and NUL-terminates. Returns the number
    /// of bytes stored; 0 once closed.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let Some(mapping) = self.mapping.as_ref() else {
            return 0;
        };

        let stored = data.len().min(mapping.len - 1);
        if stored < data.len() {
            tracing::warn!(
                "{}: value truncated from {} to {} bytes",
                self.name,
                data.len(),
                stored
            );
        }

        // SAFETY: stored + 1 <= mapping.len, and `data` cannot overlap the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapping.as_mut_ptr(), stored);
            mapping.as_mut_ptr().add(stored).write(0);
        }
        stored
    }

    /// Current value: the bytes up to the first NUL.
    pub fn read(&self) -> Bytes {
        let Some(mapping) = self.mapping.as_ref() else {
            return Bytes::new();
        };

        let mut buf = vec![0u8; mapping.len];
        // SAFETY: the mapping holds mapping.len readable bytes.
        unsafe { std::ptr::copy_nonoverlapping(mapping.as_mut_ptr(), buf.as_mut_ptr(), mapping.len) };
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        buf.truncate(end);
        Bytes::from(buf)
    }

    /// The POSIX name, including the leading `/`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapped size in bytes; 0 once closed.
    pub fn size(&self) -> usize {
        self.mapping.as_ref().map_or(0, |m| m.len)
    }

    /// Whether this handle created the region and unlinks it on close.
    pub fn is_creator(&self) -> bool {
        self.creator
    }

    /// Whether the region is still mapped.
    pub fn is_open(&self) -> bool {
        self.mapping.is_some()
    }

    /// Base address of the mapping, for structures laid out inside it.
    pub(crate) fn as_mut_ptr(&self) -> Option<*mut u8> {
        self.mapping.as_ref().map(Mapping::as_mut_ptr)
    }
}

impl Channel for SharedMemoryChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::SharedMemory
    }

    /// Unmap; the creator also removes the name.
    fn close(&mut self) {
        if self.mapping.take().is_none() {
            return;
        }
        if self.creator {
            match shm_unlink(self.name.as_str()) {
                Ok(()) => tracing::debug!("Unlinked shared memory {}", self.name),
                Err(Errno::ENOENT) => {}
                Err(e) => tracing::warn!("shm_unlink {} failed: {}", self.name, e),
            }
        }
    }
}

impl ReadChannel for SharedMemoryChannel {
    fn read_all(&mut self) -> Bytes {
        self.read()
    }
}

impl WriteChannel for SharedMemoryChannel {
    fn write(&mut self, data: &[u8]) -> usize {
        SharedMemoryChannel::write(self, data)
    }
}

impl Drop for SharedMemoryChannel {
    fn drop(&mut self) {
        self.close();
    }
}
