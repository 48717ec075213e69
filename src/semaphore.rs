//! Counting semaphore shared between unrelated processes.
//!
//! The state lives in a small shared-memory segment:
//!
//! ```text
//! ┌───────────────────┬──────────────────┬───────┐
//! │ pthread_mutex_t   │ pthread_cond_t   │ value │
//! │ PROCESS_SHARED    │ PROCESS_SHARED   │ c_int │
//! └───────────────────┴──────────────────┴───────┘
//! ```
//!
//! Exactly one participant creates the segment and constructs the mutex and
//! condition variable; everyone else opens it and must not construct them
//! again. Creation has to happen-before any opener's first `wait`/`post`:
//! the spawning code creates every semaphore before forking the child.
//!
//! # Example
//!
//! ```ignore
//! use proc_ipc::semaphore::CrossProcessSemaphore;
//!
//! let sem = CrossProcessSemaphore::create("/demo_sem", 0)?;
//! // ... spawn the child, which calls CrossProcessSemaphore::open("/demo_sem")
//! sem.post()?;
//! ```

use std::io;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};

use crate::error::{IpcError, Result};
use crate::transport::{Channel, SharedMemoryChannel};

/// Size of the segment backing one semaphore.
const SEGMENT_SIZE: usize = 4096;

#[repr(C)]
struct SemaphoreRecord {
    mutex: libc::pthread_mutex_t,
    cond: libc::pthread_cond_t,
    value: libc::c_int,
}

const _: () = assert!(std::mem::size_of::<SemaphoreRecord>() <= SEGMENT_SIZE);

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

/// Counting semaphore usable across processes that know its name.
#[derive(Debug)]
pub struct CrossProcessSemaphore {
    shm: SharedMemoryChannel,
    record: NonNull<SemaphoreRecord>,
}

// SAFETY: every access to the record goes through the process-shared mutex,
// which also serializes threads within one process.
unsafe impl Send for CrossProcessSemaphore {}
unsafe impl Sync for CrossProcessSemaphore {}

impl CrossProcessSemaphore {
    /// Create the semaphore `name` with `initial_value`.
    ///
    /// Returns only after the mutex and condition variable are fully
    /// constructed. Fails with [`IpcError::ResourceCreation`] if `name` is
    /// already live, leaving the existing semaphore untouched.
    pub fn create(name: &str, initial_value: u32) -> Result<Self> {
        let value = libc::c_int::try_from(initial_value).map_err(|_| {
            IpcError::InvalidArgument(format!("initial value {initial_value} is too large"))
        })?;
        let shm = SharedMemoryChannel::create_exclusive(name, SEGMENT_SIZE)?;
        let record = Self::record_ptr(&shm)?;
        let resource = || format!("semaphore {name}");

        // SAFETY: the segment is freshly zeroed, SEGMENT_SIZE bytes long and
        // nobody else may touch it until this constructor returns.
        unsafe {
            let rec = record.as_ptr();

            let mut mattr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            check(libc::pthread_mutexattr_init(mattr.as_mut_ptr()))
                .map_err(|e| IpcError::resource(resource(), e))?;
            let shared = libc::pthread_mutexattr_setpshared(
                mattr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            );
            let init = libc::pthread_mutex_init(ptr::addr_of_mut!((*rec).mutex), mattr.as_ptr());
            libc::pthread_mutexattr_destroy(mattr.as_mut_ptr());
            check(shared)
                .and_then(|()| check(init))
                .map_err(|e| IpcError::resource(resource(), e))?;

            let mut cattr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
            check(libc::pthread_condattr_init(cattr.as_mut_ptr()))
                .map_err(|e| IpcError::resource(resource(), e))?;
            let shared = libc::pthread_condattr_setpshared(
                cattr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            );
            let init = libc::pthread_cond_init(ptr::addr_of_mut!((*rec).cond), cattr.as_ptr());
            libc::pthread_condattr_destroy(cattr.as_mut_ptr());
            check(shared)
                .and_then(|()| check(init))
                .map_err(|e| IpcError::resource(resource(), e))?;

            (*rec).value = value;
        }

        tracing::debug!("Created semaphore {} (value {})", name, initial_value);
        Ok(Self { shm, record })
    }

    /// Open a semaphore some other participant already created.
    ///
    /// Never creates the segment: without a creator this fails with
    /// [`IpcError::ResourceCreation`].
    pub fn open(name: &str) -> Result<Self> {
        let shm = SharedMemoryChannel::attach(name)?;
        if shm.size() < std::mem::size_of::<SemaphoreRecord>() {
            return Err(IpcError::resource(
                format!("semaphore {name}"),
                io::Error::new(io::ErrorKind::InvalidData, "segment too small"),
            ));
        }
        let record = Self::record_ptr(&shm)?;
        tracing::debug!("Opened semaphore {}", name);
        Ok(Self { shm, record })
    }

    /// Create (`is_creator`) or open the semaphore `name`.
    ///
    /// `initial_value` is ignored when opening.
    pub fn init(name: &str, is_creator: bool, initial_value: u32) -> Result<Self> {
        if is_creator {
            Self::create(name, initial_value)
        } else {
            Self::open(name)
        }
    }

    fn record_ptr(shm: &SharedMemoryChannel) -> Result<NonNull<SemaphoreRecord>> {
        shm.as_mut_ptr()
            .and_then(|p| NonNull::new(p.cast::<SemaphoreRecord>()))
            .ok_or_else(|| {
                IpcError::resource(shm.name(), io::Error::from(io::ErrorKind::InvalidInput))
            })
    }

    /// Run `f` on the value while holding the mutex.
    fn locked<T>(&self, f: impl FnOnce(*mut SemaphoreRecord) -> io::Result<T>) -> Result<T> {
        let rec = self.record.as_ptr();
        // SAFETY: the record was constructed by the creator before this
        // handle could exist, and stays mapped for the lifetime of `self`.
        unsafe {
            check(libc::pthread_mutex_lock(ptr::addr_of_mut!((*rec).mutex)))?;
            let result = f(rec);
            check(libc::pthread_mutex_unlock(ptr::addr_of_mut!((*rec).mutex)))?;
            Ok(result?)
        }
    }

    /// Block until the value is positive, then decrement it.
    pub fn wait(&self) -> Result<()> {
        self.locked(|rec| unsafe {
            while (*rec).value == 0 {
                check(libc::pthread_cond_wait(
                    ptr::addr_of_mut!((*rec).cond),
                    ptr::addr_of_mut!((*rec).mutex),
                ))?;
            }
            (*rec).value -= 1;
            Ok(())
        })
    }

    /// Decrement without blocking. Returns `false` when the value was 0.
    pub fn try_wait(&self) -> Result<bool> {
        self.locked(|rec| unsafe {
            if (*rec).value == 0 {
                return Ok(false);
            }
            (*rec).value -= 1;
            Ok(true)
        })
    }

    /// Increment the value and wake one waiter.
    pub fn post(&self) -> Result<()> {
        self.locked(|rec| unsafe {
            (*rec).value = (*rec)
                .value
                .checked_add(1)
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EOVERFLOW))?;
            check(libc::pthread_cond_signal(ptr::addr_of_mut!((*rec).cond)))
        })
    }

    /// Snapshot of the current value.
    pub fn value(&self) -> Result<u32> {
        self.locked(|rec| unsafe { Ok((*rec).value as u32) })
    }

    /// The name passed to `create`/`open`.
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// Whether this handle constructed the record and unlinks it on close.
    pub fn is_creator(&self) -> bool {
        self.shm.is_creator()
    }

    /// Detach; the creator also removes the name so later opens start fresh.
    ///
    /// Consumes the handle, so no call can reach the unmapped record.
    pub fn close(mut self) {
        self.shm.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn unique(tag: &str) -> String {
        format!("/ipcs{}.{}", std::process::id(), tag)
    }

    #[test]
    fn test_posts_then_waits_never_block() {
        let sem = CrossProcessSemaphore::create(&unique("count"), 0).unwrap();
        for _ in 0..5 {
            sem.post().unwrap();
        }
        assert_eq!(sem.value().unwrap(), 5);
        for _ in 0..5 {
            sem.wait().unwrap();
        }
        assert_eq!(sem.value().unwrap(), 0);
    }

    #[test]
    fn test_initial_value() {
        let sem = CrossProcessSemaphore::create(&unique("initial"), 2).unwrap();
        assert!(sem.is_creator());
        assert!(sem.try_wait().unwrap());
        assert!(sem.try_wait().unwrap());
        assert!(!sem.try_wait().unwrap());
        assert_eq!(sem.value().unwrap(), 0);
    }

    #[test]
    fn test_wait_blocks_until_post() {
        let name = unique("block");
        let sem = CrossProcessSemaphore::create(&name, 0).unwrap();
        let (tx, rx) = mpsc::channel();

        let waiter = thread::spawn(move || {
            let opener = CrossProcessSemaphore::open(&name).unwrap();
            assert!(!opener.is_creator());
            opener.wait().unwrap();
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        sem.post().unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
        assert_eq!(sem.value().unwrap(), 0);
    }

    #[test]
    fn test_opener_shares_value() {
        let name = unique("share");
        let creator = CrossProcessSemaphore::init(&name, true, 0).unwrap();
        let opener = CrossProcessSemaphore::init(&name, false, 99).unwrap();

        opener.post().unwrap();
        opener.post().unwrap();
        assert_eq!(creator.value().unwrap(), 2);

        opener.close();
        assert!(creator.try_wait().unwrap());
        assert_eq!(creator.value().unwrap(), 1);
    }

    #[test]
    fn test_open_without_creator_fails() {
        let name = unique("orphan");
        let err = CrossProcessSemaphore::open(&name).unwrap_err();
        assert!(matches!(err, IpcError::ResourceCreation { .. }));

        // Nothing was left behind under the name.
        assert!(SharedMemoryChannel::attach(&name).is_err());
    }

    #[test]
    fn test_second_creator_is_rejected() {
        let name = unique("twice");
        let first = CrossProcessSemaphore::create(&name, 0).unwrap();
        first.post().unwrap();
        first.post().unwrap();

        let err = CrossProcessSemaphore::create(&name, 0).unwrap_err();
        assert!(matches!(err, IpcError::ResourceCreation { .. }));
        assert_eq!(first.value().unwrap(), 2);

        // The rejected creator did not unlink the live name.
        let opener = CrossProcessSemaphore::open(&name).unwrap();
        assert!(opener.try_wait().unwrap());
        assert_eq!(first.value().unwrap(), 1);
    }

    #[test]
    fn test_creator_close_unlinks() {
        let name = unique("gone");
        let sem = CrossProcessSemaphore::create(&name, 3).unwrap();
        sem.close();
        assert!(SharedMemoryChannel::attach(&name).is_err());
    }
}
