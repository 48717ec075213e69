//! Child process lifecycle and transport wiring.
//!
//! A [`Process`] is started exactly once, with one of three transports:
//!
//! | start                        | stdin / stdout / stderr                       |
//! |------------------------------|-----------------------------------------------|
//! | [`Process::start`]           | anonymous pipes on fds 0/1/2                  |
//! | [`Process::start_sockets`]   | three accepted connections, ports in argv     |
//! | [`Process::start_shared_memory`] | two regions + two semaphores, names in argv |
//!
//! The parent then talks to the child through [`Process::write_stdin`],
//! [`Process::read_stdout`] and [`Process::read_stderr`], and joins it with
//! [`Process::wait`].
//!
//! # Example
//!
//! ```
//! use proc_ipc::Process;
//!
//! let mut child = Process::new("echo", ["Hello"]);
//! child.start().unwrap();
//! assert_eq!(&child.read_stdout().unwrap()[..], b"Hello\n");
//! assert_eq!(child.wait(), 0);
//! ```

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::control::ChildArgs;
use crate::error::{IpcError, Result, WAIT_FAILED};
use crate::semaphore::CrossProcessSemaphore;
use crate::transport::{
    Channel, PipeChannel, ReadChannel, SharedMemoryChannel, SocketChannel, SocketDomain,
    WriteChannel, DEFAULT_ACCEPT_TIMEOUT,
};

pub mod launch;

pub use launch::{launch, ChildStdio};

/// Default listen backlog for the socket transport. One peer per listener.
pub const DEFAULT_LISTEN_BACKLOG: i32 = 1;

/// Instance counter for shared-memory and semaphore names.
static NEXT_INSTANCE: AtomicU32 = AtomicU32::new(0);

/// Tunables that apply to every transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Bound on each of the three accepts in [`Process::start_sockets`].
    pub accept_timeout: Duration,
    pub listen_backlog: i32,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
        }
    }
}

/// Lifecycle of a [`Process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Unstarted,
    Started,
    /// Reaped by [`Process::wait`].
    Waited,
    /// Killed by [`Process::terminate`]; may still need reaping.
    Terminated,
}

/// The transport a started [`Process`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Pipes,
    Sockets(SocketDomain),
    SharedMemory,
}

/// Parent-side endpoints of the active transport.
#[derive(Debug)]
enum Endpoints {
    None,
    Pipes {
        stdin: PipeChannel,
        stdout: PipeChannel,
        stderr: PipeChannel,
    },
    Sockets {
        domain: SocketDomain,
        stdin: SocketChannel,
        stdout: SocketChannel,
        stderr: SocketChannel,
    },
    SharedMemory {
        shm_in: SharedMemoryChannel,
        shm_out: SharedMemoryChannel,
        sem_in: CrossProcessSemaphore,
        sem_out: CrossProcessSemaphore,
    },
}

/// A child process and the parent's ends of its streams.
#[derive(Debug)]
pub struct Process {
    program: String,
    args: Vec<String>,
    options: ProcessOptions,
    state: ProcessState,
    pid: Option<Pid>,
    exit_status: Option<i32>,
    endpoints: Endpoints,
}

impl Process {
    /// Describe a child; nothing runs until one of the `start*` calls.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_options(program, args, ProcessOptions::default())
    }

    /// Like [`Process::new`], with explicit options.
    pub fn with_options<I, S>(program: impl Into<String>, args: I, options: ProcessOptions) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            options,
            state: ProcessState::Unstarted,
            pid: None,
            exit_status: None,
            endpoints: Endpoints::None,
        }
    }

    /// Fluent alternative to [`Process::new`].
    pub fn builder(program: impl Into<String>) -> ProcessBuilder {
        ProcessBuilder::new(program)
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Start the child with its stdin/stdout/stderr on anonymous pipes.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_unstarted()?;

        let mut stdin = PipeChannel::create()?;
        let mut stdout = PipeChannel::create()?;
        let mut stderr = PipeChannel::create()?;

        let stdio = ChildStdio {
            stdin: stdin.read_fd().map(|fd| fd.as_raw_fd()),
            stdout: stdout.write_fd().map(|fd| fd.as_raw_fd()),
            stderr: stderr.write_fd().map(|fd| fd.as_raw_fd()),
        };
        let pid = launch(&self.program, &self.args, Some(stdio))?;

        // The child holds its own copies now.
        stdin.close_read();
        stdout.close_write();
        stderr.close_write();

        self.started(
            pid,
            Endpoints::Pipes {
                stdin,
                stdout,
                stderr,
            },
        );
        Ok(())
    }

    /// Start the child connected through three stream sockets.
    ///
    /// Listens on `base_port`, `base_port + 1` and `base_port + 2` (in, out,
    /// err) before spawning, passes `[domain, port_in, port_out, port_err]`
    /// ahead of the user arguments, then accepts the child's connections in
    /// that order. If an accept fails the child is killed and reaped.
    pub fn start_sockets(&mut self, base_port: u16, domain: SocketDomain) -> Result<()> {
        self.ensure_unstarted()?;

        let ports = socket_ports(base_port)?;
        let backlog = self.options.listen_backlog;
        let listen = |port: u16| -> Result<SocketChannel> {
            let mut listener = SocketChannel::create(domain)?;
            listener.bind_and_listen(port, backlog)?;
            Ok(listener)
        };
        let listeners = [listen(ports[0])?, listen(ports[1])?, listen(ports[2])?];

        let child_args = ChildArgs::Sockets {
            domain,
            port_in: ports[0],
            port_out: ports[1],
            port_err: ports[2],
        };
        let pid = launch(&self.program, &self.child_argv(&child_args), None)?;

        let timeout = self.options.accept_timeout;
        let accept_all = || -> Result<[SocketChannel; 3]> {
            Ok([
                listeners[0].accept_client(timeout)?,
                listeners[1].accept_client(timeout)?,
                listeners[2].accept_client(timeout)?,
            ])
        };
        let [stdin, stdout, stderr] = match accept_all() {
            Ok(conns) => conns,
            Err(e) => {
                tracing::error!("Child {} never connected: {}", pid, e);
                kill_and_reap(pid);
                return Err(e);
            }
        };
        // Listeners drop here; Unix listeners remove their socket files.
        drop(listeners);

        self.started(
            pid,
            Endpoints::Sockets {
                domain,
                stdin,
                stdout,
                stderr,
            },
        );
        Ok(())
    }

    /// Start the child exchanging data through shared memory.
    ///
    /// Creates the "in" and "out" regions (`size` bytes each) and their
    /// semaphores (value 0) before forking, and passes
    /// `[shm_in, shm_out, sem_in, sem_out]` ahead of the user arguments.
    pub fn start_shared_memory(&mut self, size: usize) -> Result<()> {
        self.ensure_unstarted()?;

        let names = SharedMemoryNames::next();
        let shm_in = SharedMemoryChannel::create(&names.shm_in, size)?;
        let shm_out = SharedMemoryChannel::create(&names.shm_out, size)?;
        let sem_in = CrossProcessSemaphore::create(&names.sem_in, 0)?;
        let sem_out = CrossProcessSemaphore::create(&names.sem_out, 0)?;

        let child_args = ChildArgs::SharedMemory {
            shm_in: names.shm_in,
            shm_out: names.shm_out,
            sem_in: names.sem_in,
            sem_out: names.sem_out,
        };
        let pid = launch(&self.program, &self.child_argv(&child_args), None)?;

        self.started(
            pid,
            Endpoints::SharedMemory {
                shm_in,
                shm_out,
                sem_in,
                sem_out,
            },
        );
        Ok(())
    }

    fn ensure_unstarted(&self) -> Result<()> {
        if self.state == ProcessState::Unstarted {
            Ok(())
        } else {
            tracing::warn!("{} was already started", self.program);
            Err(IpcError::AlreadyStarted)
        }
    }

    fn child_argv(&self, prefix: &ChildArgs) -> Vec<String> {
        let mut argv = prefix.to_args();
        argv.extend(self.args.iter().cloned());
        argv
    }

    fn started(&mut self, pid: Pid, endpoints: Endpoints) {
        self.pid = Some(pid);
        self.endpoints = endpoints;
        self.state = ProcessState::Started;
    }

    // ========================================================================
    // Stream I/O
    // ========================================================================

    /// Send `data` to the child. Returns how many bytes were delivered.
    ///
    /// With shared memory the data replaces the "in" region's value (at most
    /// `size - 1` bytes) and the child is signalled through `sem_in`.
    pub fn write_stdin(&mut self, data: &[u8]) -> Result<usize> {
        match &mut self.endpoints {
            Endpoints::None => Err(IpcError::NotStarted),
            Endpoints::Pipes { stdin, .. } => Ok(write_channel(stdin, data)),
            Endpoints::Sockets { stdin, .. } => Ok(write_channel(stdin, data)),
            Endpoints::SharedMemory { shm_in, sem_in, .. } => {
                let stored = shm_in.write(data);
                sem_in.post()?;
                Ok(stored)
            }
        }
    }

    /// Read what the child wrote to stdout.
    ///
    /// Pipes and sockets read until the child closes the stream. Shared
    /// memory blocks until the child signals `sem_out`, then returns the
    /// "out" region's value.
    pub fn read_stdout(&mut self) -> Result<Bytes> {
        match &mut self.endpoints {
            Endpoints::None => Err(IpcError::NotStarted),
            Endpoints::Pipes { stdout, .. } => Ok(read_channel(stdout)),
            Endpoints::Sockets { stdout, .. } => Ok(read_channel(stdout)),
            Endpoints::SharedMemory {
                shm_out, sem_out, ..
            } => {
                sem_out.wait()?;
                Ok(shm_out.read())
            }
        }
    }

    /// Read what the child wrote to stderr. Always empty with shared memory.
    pub fn read_stderr(&mut self) -> Result<Bytes> {
        match &mut self.endpoints {
            Endpoints::None => Err(IpcError::NotStarted),
            Endpoints::Pipes { stderr, .. } => Ok(read_channel(stderr)),
            Endpoints::Sockets { stderr, .. } => Ok(read_channel(stderr)),
            Endpoints::SharedMemory { .. } => Ok(Bytes::new()),
        }
    }

    /// Signal end of input to the child. No-op with shared memory.
    pub fn close_stdin(&mut self) -> Result<()> {
        match &mut self.endpoints {
            Endpoints::None => return Err(IpcError::NotStarted),
            Endpoints::Pipes { stdin, .. } => stdin.close_write(),
            Endpoints::Sockets { stdin, .. } => stdin.close_write(),
            Endpoints::SharedMemory { .. } => {}
        }
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Block until the child exits and return its exit status.
    ///
    /// Returns [`WAIT_FAILED`] when the child was killed by a signal, the
    /// wait failed, or the process was never started. The status is cached,
    /// so waiting again returns the same value.
    pub fn wait(&mut self) -> i32 {
        if let Some(status) = self.exit_status {
            return status;
        }
        let Some(pid) = self.pid else {
            tracing::warn!("wait() on {} before start", self.program);
            return WAIT_FAILED;
        };

        let status = reap(pid);
        tracing::debug!("Reaped pid {} with status {}", pid, status);
        self.exit_status = Some(status);
        if self.state == ProcessState::Started {
            self.state = ProcessState::Waited;
        }
        status
    }

    /// Kill the child with `SIGKILL`.
    ///
    /// Idempotent, and harmless once the child has exited. Call
    /// [`Process::wait`] afterwards to reap it.
    pub fn terminate(&mut self) -> Result<()> {
        let pid = self.pid.ok_or(IpcError::NotStarted)?;
        if self.exit_status.is_some() {
            // Reaped already; the pid may belong to someone else by now.
            return Ok(());
        }

        match kill(pid, Signal::SIGKILL) {
            Ok(()) => tracing::debug!("Sent SIGKILL to pid {}", pid),
            Err(Errno::ESRCH) => {}
            Err(e) => return Err(e.into()),
        }
        self.state = ProcessState::Terminated;
        Ok(())
    }

    /// The child's pid once started.
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// The active transport, if started.
    pub fn transport(&self) -> Option<TransportMode> {
        match &self.endpoints {
            Endpoints::None => None,
            Endpoints::Pipes { .. } => Some(TransportMode::Pipes),
            Endpoints::Sockets { domain, .. } => Some(TransportMode::Sockets(*domain)),
            Endpoints::SharedMemory { .. } => Some(TransportMode::SharedMemory),
        }
    }

    /// Program as given to the constructor, before any `PATH` lookup.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// User arguments, without any transport endpoints prepended at start.
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

fn write_channel(channel: &mut dyn WriteChannel, data: &[u8]) -> usize {
    let written = channel.write(data);
    if written < data.len() {
        tracing::debug!(
            "{:?} stdin accepted {} of {} bytes",
            channel.kind(),
            written,
            data.len()
        );
    }
    written
}

fn read_channel(channel: &mut dyn ReadChannel) -> Bytes {
    channel.read_all()
}

/// `[base, base + 1, base + 2]`, rejecting ranges past `u16::MAX`.
fn socket_ports(base_port: u16) -> Result<[u16; 3]> {
    match base_port.checked_add(2) {
        Some(_) => Ok([base_port, base_port + 1, base_port + 2]),
        None => Err(IpcError::InvalidArgument(format!(
            "base port {base_port} leaves no room for three consecutive ports"
        ))),
    }
}

/// `waitpid` until the child is gone, mapping the outcome to an exit status.
fn reap(pid: Pid) -> i32 {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return code,
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                tracing::debug!("pid {} killed by {}", pid, signal);
                return WAIT_FAILED;
            }
            Ok(other) => tracing::debug!("Ignoring wait status {:?}", other),
            Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::warn!("waitpid({}) failed: {}", pid, e);
                return WAIT_FAILED;
            }
        }
    }
}

fn kill_and_reap(pid: Pid) {
    if let Err(e) = kill(pid, Signal::SIGKILL) {
        tracing::warn!("Could not kill pid {}: {}", pid, e);
    }
    reap(pid);
}

/// Names of the four shared objects behind one shared-memory transport.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SharedMemoryNames {
    shm_in: String,
    shm_out: String,
    sem_in: String,
    sem_out: String,
}

impl SharedMemoryNames {
    /// `/ipc<pid>.<n>.<role>`, unique per process and instance.
    fn next() -> Self {
        let pid = std::process::id();
        let n = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        let name = |role: &str| format!("/ipc{pid}.{n}.{role}");
        Self {
            shm_in: name("shm_in"),
            shm_out: name("shm_out"),
            sem_in: name("sem_in"),
            sem_out: name("sem_out"),
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Fluent construction of a [`Process`].
///
/// ```
/// use std::time::Duration;
/// use proc_ipc::Process;
///
/// let process = Process::builder("cat")
///     .arg("-u")
///     .accept_timeout(Duration::from_secs(5))
///     .build();
/// assert_eq!(process.args(), ["-u"]);
/// ```
#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    program: String,
    args: Vec<String>,
    options: ProcessOptions,
}

impl ProcessBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            options: ProcessOptions::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Bound on each accept in [`Process::start_sockets`].
    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.options.accept_timeout = timeout;
        self
    }

    pub fn listen_backlog(mut self, backlog: i32) -> Self {
        self.options.listen_backlog = backlog;
        self
    }

    pub fn build(self) -> Process {
        Process::with_options(self.program, self.args, self.options)
    }
}
