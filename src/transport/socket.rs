//! Stream socket channel over Unix-domain or IPv4 sockets.
//!
//! One type plays three roles:
//! - listener: [`SocketChannel::create`] + [`SocketChannel::bind_and_listen`]
//! - accepted connection: returned by [`SocketChannel::accept_client`]
//! - client: [`SocketChannel::connect_to`] or [`SocketChannel::connect_with_retry`]
//!
//! Unix-domain sockets are addressed by port number too: the port maps to a
//! fixed path under the temp directory (see [`unix_socket_path`]) so both
//! sides can derive it from the same argv.
//!
//! # Example
//!
//! ```ignore
//! use proc_ipc::transport::{SocketChannel, SocketDomain, RetryPolicy};
//!
//! let mut listener = SocketChannel::create(SocketDomain::Unix)?;
//! listener.bind_and_listen(9000, 1)?;
//! let mut conn = listener.accept_client(Duration::from_secs(2))?;
//! let data = conn.read_all();
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    self, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, UnixAddr,
};
use serde::{Deserialize, Serialize};

use super::{
    drain, set_cloexec, write_fully, Channel, ChannelKind, ReadChannel, RetryPolicy, WriteChannel,
};
use crate::error::{IpcError, Result};
use crate::platform;

/// Default bound on how long a listener waits for its peer.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Path prefix for Unix-domain sockets, followed by the decimal port.
const UNIX_PATH_PREFIX: &str = "ipc_sock_";

// Close-on-exec at creation time where the platform allows it, so a fork on
// another thread never inherits the descriptor.
#[cfg(any(target_os = "linux", target_os = "android"))]
const CLOEXEC: SockFlag = SockFlag::SOCK_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const CLOEXEC: SockFlag = SockFlag::empty();

#[cfg(any(target_os = "linux", target_os = "android"))]
fn accept_cloexec(fd: RawFd) -> nix::Result<RawFd> {
    socket::accept4(fd, CLOEXEC)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn accept_cloexec(fd: RawFd) -> nix::Result<RawFd> {
    socket::accept(fd)
}

/// Address family of a [`SocketChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketDomain {
    /// Filesystem-path stream socket.
    Unix,
    /// Loopback/wildcard TCP.
    Ipv4,
}

impl SocketDomain {
    /// The argv spelling of this domain.
    pub fn as_str(self) -> &'static str {
        match self {
            SocketDomain::Unix => "unix",
            SocketDomain::Ipv4 => "ipv4",
        }
    }

    fn family(self) -> AddressFamily {
        match self {
            SocketDomain::Unix => AddressFamily::Unix,
            SocketDomain::Ipv4 => AddressFamily::Inet,
        }
    }
}

impl fmt::Display for SocketDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SocketDomain {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unix" => Ok(SocketDomain::Unix),
            "ipv4" => Ok(SocketDomain::Ipv4),
            other => Err(IpcError::InvalidArgument(format!(
                "unknown socket domain: {other}"
            ))),
        }
    }
}

/// Filesystem path of the Unix-domain socket for `port`.
///
/// Format: `<tmp>/ipc_sock_<port>`
pub fn unix_socket_path(port: u16) -> PathBuf {
    std::env::temp_dir().join(format!("{UNIX_PATH_PREFIX}{port}"))
}

fn describe(domain: SocketDomain, host: &str, port: u16) -> String {
    match domain {
        SocketDomain::Unix => unix_socket_path(port).display().to_string(),
        SocketDomain::Ipv4 => format!("{host}:{port}"),
    }
}

fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddrV4> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(SocketAddrV4::new(ip, port));
    }
    if host == "localhost" {
        return Ok(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
    }

    (host, port)
        .to_socket_addrs()
        .map_err(|e| IpcError::InvalidArgument(format!("cannot resolve {host}: {e}")))?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| IpcError::InvalidArgument(format!("no IPv4 address for {host}")))
}

/// A connected stream, typed by domain so std handles the I/O.
#[derive(Debug)]
enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    fn from_fd(domain: SocketDomain, fd: OwnedFd) -> Self {
        match domain {
            SocketDomain::Unix => Stream::Unix(UnixStream::from(fd)),
            SocketDomain::Ipv4 => Stream::Tcp(TcpStream::from(fd)),
        }
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.shutdown(how),
            Stream::Tcp(s) => s.shutdown(how),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.read(buf),
            Stream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.write(buf),
            Stream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.flush(),
            Stream::Tcp(s) => s.flush(),
        }
    }
}

#[derive(Debug)]
enum State {
    Closed,
    /// Created, neither bound nor connected.
    Open(OwnedFd),
    Listening {
        fd: OwnedFd,
        addr: String,
        /// Unix path to unlink on close.
        path: Option<PathBuf>,
    },
    Connected {
        stream: Stream,
        read_open: bool,
        write_open: bool,
    },
}

/// Stream socket channel. Movable, never cloned: exactly one owner per descriptor.
#[derive(Debug)]
pub struct SocketChannel {
    domain: SocketDomain,
    state: State,
}

impl SocketChannel {
    /// Open a new, unbound stream socket of the given domain.
    ///
    /// IPv4 sockets get `SO_REUSEADDR` so a restarted parent can rebind
    /// quickly.
    pub fn create(domain: SocketDomain) -> Result<Self> {
        platform::ensure_initialized();

        let resource = || format!("{domain} socket");
        let fd = socket::socket(domain.family(), SockType::Stream, CLOEXEC, None)
            .map_err(|e| IpcError::resource(resource(), e))?;
        set_cloexec(&fd).map_err(|e| IpcError::resource(resource(), e))?;

        if domain == SocketDomain::Ipv4 {
            if let Err(e) = socket::setsockopt(&fd, sockopt::ReuseAddr, &true) {
                tracing::warn!("setsockopt(SO_REUSEADDR) failed: {}", e);
            }
        }

        Ok(Self {
            domain,
            state: State::Open(fd),
        })
    }

    /// Bind to the address derived from `port` and start listening.
    ///
    /// Unix: `<tmp>/ipc_sock_<port>`, removing a stale file first.
    /// IPv4: `0.0.0.0:<port>`.
    pub fn bind_and_listen(&mut self, port: u16, backlog: i32) -> Result<()> {
        let fd = match std::mem::replace(&mut self.state, State::Closed) {
            State::Open(fd) => fd,
            other => {
                self.state = other;
                return Err(IpcError::InvalidArgument(
                    "only a freshly created socket can be bound".to_string(),
                ));
            }
        };

        let addr = describe(self.domain, "0.0.0.0", port);
        let bound = match self.domain {
            SocketDomain::Unix => {
                let path = unix_socket_path(port);
                match std::fs::remove_file(&path) {
                    Ok(()) => tracing::debug!("Removed stale socket file {}", path.display()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!("Could not remove {}: {}", path.display(), e),
                }
                UnixAddr::new(&path)
                    .and_then(|sa| socket::bind(fd.as_raw_fd(), &sa))
                    .map(|()| Some(path))
            }
            SocketDomain::Ipv4 => {
                let sa = SockaddrIn::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
                socket::bind(fd.as_raw_fd(), &sa).map(|()| None)
            }
        };

        let path = match bound {
            Ok(path) => path,
            Err(e) => {
                tracing::error!("bind {} failed: {}", addr, e);
                self.state = State::Open(fd);
                return Err(IpcError::Bind {
                    addr,
                    source: e.into(),
                });
            }
        };

        if let Err(e) = Backlog::new(backlog).and_then(|b| socket::listen(&fd, b)) {
            tracing::error!("listen on {} failed: {}", addr, e);
            if let Some(path) = &path {
                let _ = std::fs::remove_file(path);
            }
            self.state = State::Open(fd);
            return Err(IpcError::Bind {
                addr,
                source: e.into(),
            });
        }

        tracing::debug!("Listening on {} (backlog {})", addr, backlog);
        self.state = State::Listening { fd, addr, path };
        Ok(())
    }

    /// Wait up to `timeout` for one incoming connection.
    ///
    /// The listener is left untouched and can accept again.
    pub fn accept_client(&self, timeout: Duration) -> Result<SocketChannel> {
        let (fd, addr) = match &self.state {
            State::Listening { fd, addr, .. } => (fd, addr),
            _ => {
                return Err(IpcError::InvalidArgument(
                    "socket is not listening".to_string(),
                ))
            }
        };

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let millis = u16::try_from(remaining.as_millis()).unwrap_or(u16::MAX);
            let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];

            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(0) if Instant::now() >= deadline => {
                    tracing::warn!("No connection on {} within {:?}", addr, timeout);
                    return Err(IpcError::AcceptTimeout {
                        addr: addr.clone(),
                        timeout,
                    });
                }
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => break,
                Err(e) => return Err(e.into()),
            }
        }

        let raw = loop {
            match accept_cloexec(fd.as_raw_fd()) {
                Ok(raw) => break raw,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        };
        // SAFETY: accept returned a fresh descriptor that nothing else owns.
        let conn = unsafe { OwnedFd::from_raw_fd(raw) };
        set_cloexec(&conn)?;

        tracing::debug!("Accepted connection on {}", addr);
        Ok(SocketChannel {
            domain: self.domain,
            state: State::Connected {
                stream: Stream::from_fd(self.domain, conn),
                read_open: true,
                write_open: true,
            },
        })
    }

    /// Dial the listener for `port` once.
    ///
    /// Unix sockets ignore `host`. After a failed attempt the socket is
    /// spent; use [`SocketChannel::connect_with_retry`] to keep trying.
    pub fn connect_to(&mut self, host: &str, port: u16) -> Result<()> {
        let fd = match std::mem::replace(&mut self.state, State::Closed) {
            State::Open(fd) => fd,
            other => {
                self.state = other;
                return Err(IpcError::InvalidArgument(
                    "only a freshly created socket can connect".to_string(),
                ));
            }
        };

        let addr = describe(self.domain, host, port);
        let result = match self.domain {
            SocketDomain::Unix => UnixAddr::new(&unix_socket_path(port))
                .and_then(|sa| socket::connect(fd.as_raw_fd(), &sa)),
            SocketDomain::Ipv4 => {
                let target = match resolve_ipv4(host, port) {
                    Ok(target) => target,
                    Err(e) => {
                        self.state = State::Open(fd);
                        return Err(e);
                    }
                };
                socket::connect(fd.as_raw_fd(), &SockaddrIn::from(target))
            }
        };

        match result {
            Ok(()) => {
                tracing::debug!("Connected to {}", addr);
                self.state = State::Connected {
                    stream: Stream::from_fd(self.domain, fd),
                    read_open: true,
                    write_open: true,
                };
                Ok(())
            }
            Err(e) => {
                self.state = State::Open(fd);
                Err(IpcError::Connect {
                    addr,
                    source: e.into(),
                })
            }
        }
    }

    /// Dial with a fresh socket per attempt, backing off per `policy`.
    pub fn connect_with_retry(
        domain: SocketDomain,
        host: &str,
        port: u16,
        policy: &RetryPolicy,
    ) -> Result<SocketChannel> {
        let attempts = policy.attempts();
        let mut attempt = 0;

        loop {
            let mut channel = SocketChannel::create(domain)?;
            match channel.connect_to(host, port) {
                Ok(()) => return Ok(channel),
                Err(e @ IpcError::Connect { .. }) if attempt + 1 < attempts => {
                    let delay = policy.backoff(attempt);
                    tracing::debug!(
                        "Connect attempt {}/{} failed ({}), retrying in {:?}",
                        attempt + 1,
                        attempts,
                        e,
                        delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Shut down the receiving direction. Idempotent.
    pub fn close_read(&mut self) {
        if let State::Connected {
            stream, read_open, ..
        } = &mut self.state
        {
            if *read_open {
                let _ = stream.shutdown(Shutdown::Read);
                *read_open = false;
            }
        }
    }

    /// Shut down the sending direction, signalling end of stream to the peer. Idempotent.
    pub fn close_write(&mut self) {
        if let State::Connected {
            stream, write_open, ..
        } = &mut self.state
        {
            if *write_open {
                let _ = stream.shutdown(Shutdown::Write);
                *write_open = false;
            }
        }
    }

    /// Address family this channel was created for.
    pub fn domain(&self) -> SocketDomain {
        self.domain
    }

    /// Whether `listen` succeeded and no connection was accepted yet.
    pub fn is_listening(&self) -> bool {
        matches!(self.state, State::Listening { .. })
    }

    /// Whether a peer stream is attached.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Connected { .. })
    }

    /// Whether the socket is gone, after `close` or a failed bind/connect.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }
}

impl Channel for SocketChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Socket
    }

    fn close(&mut self) {
        if let State::Listening {
            path: Some(path), ..
        } = &self.state
        {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!("Could not remove {}: {}", path.display(), e);
            }
        }
        self.state = State::Closed;
    }
}

impl ReadChannel for SocketChannel {
    /// Receive until the peer shuts down its sending side.
    fn read_all(&mut self) -> Bytes {
        match &mut self.state {
            State::Connected {
                stream,
                read_open: true,
                ..
            } => drain(stream),
            _ => Bytes::new(),
        }
    }
}

impl WriteChannel for SocketChannel {
    fn write(&mut self, data: &[u8]) -> usize {
        match &mut self.state {
            State::Connected {
                stream,
                write_open: true,
                ..
            } => write_fully(stream, data),
            _ => 0,
        }
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn quick_retry() -> RetryPolicy {
        RetryPolicy::fixed(100, Duration::from_millis(10))
    }

    fn echo_roundtrip(domain: SocketDomain, port: u16) {
        let mut listener = SocketChannel::create(domain).unwrap();
        listener.bind_and_listen(port, 1).unwrap();
        assert!(listener.is_listening());

        let client = thread::spawn(move || {
            let mut c =
                SocketChannel::connect_with_retry(domain, "127.0.0.1", port, &quick_retry())
                    .unwrap();
            assert_eq!(c.write(b"over the wire"), 13);
            c.close_write();
            c.read_all()
        });

        let mut server = listener.accept_client(Duration::from_secs(5)).unwrap();
        assert!(server.is_connected());
        assert_eq!(&server.read_all()[..], b"over the wire");
        server.write(b"reply");
        server.close_write();

        assert_eq!(&client.join().unwrap()[..], b"reply");
    }

    #[test]
    fn test_unix_roundtrip() {
        echo_roundtrip(SocketDomain::Unix, 47101);
    }

    #[test]
    fn test_ipv4_roundtrip() {
        echo_roundtrip(SocketDomain::Ipv4, 47102);
    }

    #[test]
    fn test_accept_times_out() {
        let mut listener = SocketChannel::create(SocketDomain::Unix).unwrap();
        listener.bind_and_listen(47103, 1).unwrap();

        let started = Instant::now();
        let err = listener
            .accept_client(Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, IpcError::AcceptTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_ipv4_port_in_use_is_bind_error() {
        let mut first = SocketChannel::create(SocketDomain::Ipv4).unwrap();
        first.bind_and_listen(47104, 1).unwrap();

        let mut second = SocketChannel::create(SocketDomain::Ipv4).unwrap();
        let err = second.bind_and_listen(47104, 1).unwrap_err();
        assert!(matches!(err, IpcError::Bind { .. }));
        assert!(!second.is_listening());
    }

    #[test]
    fn test_unix_listener_removes_path_on_close() {
        let path = unix_socket_path(47105);
        let mut listener = SocketChannel::create(SocketDomain::Unix).unwrap();
        listener.bind_and_listen(47105, 1).unwrap();
        assert!(path.exists());

        listener.close();
        assert!(!path.exists());
        assert!(listener.is_closed());
        listener.close();
    }

    #[test]
    fn test_stale_unix_path_is_replaced() {
        let path = unix_socket_path(47106);
        std::fs::write(&path, b"stale").unwrap();

        let mut listener = SocketChannel::create(SocketDomain::Unix).unwrap();
        listener.bind_and_listen(47106, 1).unwrap();
        assert!(listener.is_listening());
    }

    #[test]
    fn test_connect_without_listener_fails() {
        let mut c = SocketChannel::create(SocketDomain::Unix).unwrap();
        let err = c.connect_to("ignored", 47107).unwrap_err();
        assert!(matches!(err, IpcError::Connect { .. }));

        let err = SocketChannel::connect_with_retry(
            SocketDomain::Unix,
            "ignored",
            47107,
            &RetryPolicy::fixed(3, Duration::from_millis(1)),
        )
        .unwrap_err();
        assert!(matches!(err, IpcError::Connect { .. }));
    }

    #[test]
    fn test_closed_halves_are_independent() {
        let mut listener = SocketChannel::create(SocketDomain::Unix).unwrap();
        listener.bind_and_listen(47108, 1).unwrap();

        let client = thread::spawn(move || {
            let mut c = SocketChannel::connect_with_retry(
                SocketDomain::Unix,
                "",
                47108,
                &quick_retry(),
            )
            .unwrap();
            c.close_read();
            assert!(c.read_all().is_empty());
            c.write(b"still writable");
            c.close_write();
            assert_eq!(c.write(b"gone"), 0);
        });

        let mut server = listener.accept_client(Duration::from_secs(5)).unwrap();
        assert_eq!(&server.read_all()[..], b"still writable");
        client.join().unwrap();
    }

    #[test]
    fn test_unconnected_io_is_noop() {
        let mut s = SocketChannel::create(SocketDomain::Ipv4).unwrap();
        assert!(s.read_all().is_empty());
        assert_eq!(s.write(b"x"), 0);
        assert!(s.accept_client(Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_domain_parsing() {
        assert_eq!("unix".parse::<SocketDomain>().unwrap(), SocketDomain::Unix);
        assert_eq!("ipv4".parse::<SocketDomain>().unwrap(), SocketDomain::Ipv4);
        assert!("ipv6".parse::<SocketDomain>().is_err());
        assert_eq!(SocketDomain::Ipv4.to_string(), "ipv4");
    }

    #[test]
    fn test_unix_socket_path_format() {
        let path = unix_socket_path(9000);
        assert!(path.starts_with(std::env::temp_dir()));
        assert!(path.to_string_lossy().ends_with("ipc_sock_9000"));
    }
}
