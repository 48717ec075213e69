//! fork/exec primitive.
//!
//! Everything that allocates (argv strings, the pointer array handed to
//! `execvp`) is prepared before `fork`. Between `fork` and `exec` the child
//! only calls `dup2`, `fcntl`, `execvp` and `_exit`, so launching from a
//! multi-threaded parent cannot deadlock on a lock some other thread held at
//! fork time.

use std::ffi::{c_char, CString};
use std::os::fd::RawFd;
use std::ptr;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::{dup2, fork, ForkResult, Pid};

use crate::error::{IpcError, Result, EXIT_LAUNCH_FAILURE};

/// Descriptors to install as the child's standard streams.
///
/// `None` leaves the inherited stream in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildStdio {
    pub stdin: Option<RawFd>,
    pub stdout: Option<RawFd>,
    pub stderr: Option<RawFd>,
}

impl ChildStdio {
    fn redirections(&self) -> [(Option<RawFd>, RawFd); 3] {
        [
            (self.stdin, libc::STDIN_FILENO),
            (self.stdout, libc::STDOUT_FILENO),
            (self.stderr, libc::STDERR_FILENO),
        ]
    }
}

fn to_cstring(s: &str) -> Result<CString> {
    CString::new(s)
        .map_err(|_| IpcError::InvalidArgument(format!("argument contains a NUL byte: {s:?}")))
}

/// Fork and exec `program` (looked up on `PATH`) with `args`.
///
/// Returns the child's pid. A program that cannot be executed still yields a
/// pid; the child exits with [`EXIT_LAUNCH_FAILURE`].
pub fn launch<S: AsRef<str>>(
    program: &str,
    args: &[S],
    stdio: Option<ChildStdio>,
) -> Result<Pid> {
    let file = to_cstring(program)?;
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(file.clone());
    for arg in args {
        argv.push(to_cstring(arg.as_ref())?);
    }
    let mut argv_ptrs: Vec<*const c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(ptr::null());

    // SAFETY: the child branch only performs async-signal-safe calls.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            tracing::debug!("Spawned {} as pid {}", program, child);
            Ok(child)
        }
        Ok(ForkResult::Child) => {
            if let Some(stdio) = stdio {
                redirect(&stdio);
            }
            // SAFETY: `file` and `argv_ptrs` are NUL-terminated and outlive
            // the call; `_exit` skips the parent's atexit handlers.
            unsafe {
                libc::execvp(file.as_ptr(), argv_ptrs.as_ptr());
                libc::_exit(EXIT_LAUNCH_FAILURE)
            }
        }
        Err(e) => {
            tracing::error!("fork failed for {}: {}", program, e);
            Err(IpcError::Spawn(e.into()))
        }
    }
}

/// Child side: move each provided descriptor onto its standard stream.
fn redirect(stdio: &ChildStdio) {
    for (source, target) in stdio.redirections() {
        let Some(fd) = source else { continue };
        let ok = if fd == target {
            // Already in place; only the close-on-exec flag has to go.
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).is_ok()
        } else {
            dup2(fd, target).is_ok()
        };
        if !ok {
            // SAFETY: async-signal-safe, never returns.
            unsafe { libc::_exit(EXIT_LAUNCH_FAILURE) }
        }
    }
}
