//! Child argv convention.
//!
//! The parent prepends four positional arguments naming the endpoints; the
//! child's own arguments follow unchanged.
//!
//! ```text
//! sockets:        <unix|ipv4> <port_in> <port_out> <port_err> [user args...]
//! shared memory:  <shm_in> <shm_out> <sem_in> <sem_out>       [user args...]
//! ```
//!
//! Pipes need no prefix: the endpoints already are the child's stdio.

use std::str::FromStr;

use crate::error::{IpcError, Result};
use crate::transport::SocketDomain;

/// Number of positional arguments in every prefix.
pub const PREFIX_LEN: usize = 4;

/// Endpoints a child was started with, as encoded in its argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildArgs {
    Sockets {
        domain: SocketDomain,
        port_in: u16,
        port_out: u16,
        port_err: u16,
    },
    SharedMemory {
        shm_in: String,
        shm_out: String,
        sem_in: String,
        sem_out: String,
    },
}

impl ChildArgs {
    /// The argv prefix for this set of endpoints.
    pub fn to_args(&self) -> Vec<String> {
        match self {
            ChildArgs::Sockets {
                domain,
                port_in,
                port_out,
                port_err,
            } => vec![
                domain.to_string(),
                port_in.to_string(),
                port_out.to_string(),
                port_err.to_string(),
            ],
            ChildArgs::SharedMemory {
                shm_in,
                shm_out,
                sem_in,
                sem_out,
            } => vec![
                shm_in.clone(),
                shm_out.clone(),
                sem_in.clone(),
                sem_out.clone(),
            ],
        }
    }

    /// Decode either prefix, telling them apart by the first argument.
    ///
    /// `args` excludes the program name. Returns the decoded endpoints and
    /// the remaining user arguments.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<(Self, &[S])> {
        match args.first() {
            Some(first) if first.as_ref().starts_with('/') => Self::parse_shared_memory(args),
            Some(_) => Self::parse_sockets(args),
            None => Err(missing(0)),
        }
    }

    pub fn parse_sockets<S: AsRef<str>>(args: &[S]) -> Result<(Self, &[S])> {
        let (prefix, rest) = split_prefix(args)?;
        let domain = SocketDomain::from_str(prefix[0].as_ref())?;
        let port = |s: &S| {
            let s = s.as_ref();
            s.parse::<u16>()
                .map_err(|_| IpcError::InvalidArgument(format!("invalid port: {s:?}")))
        };
        let parsed = ChildArgs::Sockets {
            domain,
            port_in: port(&prefix[1])?,
            port_out: port(&prefix[2])?,
            port_err: port(&prefix[3])?,
        };
        Ok((parsed, rest))
    }

    pub fn parse_shared_memory<S: AsRef<str>>(args: &[S]) -> Result<(Self, &[S])> {
        let (prefix, rest) = split_prefix(args)?;
        let parsed = ChildArgs::SharedMemory {
            shm_in: prefix[0].as_ref().to_string(),
            shm_out: prefix[1].as_ref().to_string(),
            sem_in: prefix[2].as_ref().to_string(),
            sem_out: prefix[3].as_ref().to_string(),
        };
        Ok((parsed, rest))
    }

    /// Decode the current process's own argv.
    pub fn from_env() -> Result<(Self, Vec<String>)> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let (parsed, rest) = Self::parse(args.as_slice())?;
        let rest = rest.to_vec();
        Ok((parsed, rest))
    }
}

fn missing(got: usize) -> IpcError {
    IpcError::InvalidArgument(format!(
        "expected {PREFIX_LEN} endpoint arguments, got {got}"
    ))
}

fn split_prefix<S>(args: &[S]) -> Result<(&[S], &[S])> {
    if args.len() < PREFIX_LEN {
        return Err(missing(args.len()));
    }
    Ok(args.split_at(PREFIX_LEN))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_prefix_and_user_args() {
        let args = ChildArgs::Sockets {
            domain: SocketDomain::Ipv4,
            port_in: 9000,
            port_out: 9001,
            port_err: 9002,
        };
        assert_eq!(args.to_args(), ["ipv4", "9000", "9001", "9002"]);

        let argv = ["unix", "7000", "7001", "7002", "--flag", "value"];
        let (parsed, rest) = ChildArgs::parse(&argv).unwrap();
        assert_eq!(
            parsed,
            ChildArgs::Sockets {
                domain: SocketDomain::Unix,
                port_in: 7000,
                port_out: 7001,
                port_err: 7002,
            }
        );
        assert_eq!(rest, ["--flag", "value"]);
    }

    #[test]
    fn test_shared_memory_detected_by_leading_slash() {
        let argv = ["/a.shm_in", "/a.shm_out", "/a.sem_in", "/a.sem_out"];
        let (parsed, rest) = ChildArgs::parse(&argv).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed.to_args(), argv);
    }

    #[test]
    fn test_too_few_arguments() {
        assert!(matches!(
            ChildArgs::parse::<&str>(&[]),
            Err(IpcError::InvalidArgument(_))
        ));
        assert!(matches!(
            ChildArgs::parse(&["unix", "1", "2"]),
            Err(IpcError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_bad_domain_or_port() {
        assert!(ChildArgs::parse(&["ipv6", "1", "2", "3"]).is_err());
        assert!(ChildArgs::parse(&["ipv4", "1", "70000", "3"]).is_err());
        assert!(ChildArgs::parse_sockets(&["ipv4", "1", "two", "3"]).is_err());
    }
}
