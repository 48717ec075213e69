//! Integration tests for proc-ipc.
//!
//! These tests spawn real children: standard tools for the pipe transport
//! and the `ipc-child` binary for sockets, shared memory and the
//! cross-process semaphore.

use std::time::Duration;

use proc_ipc::{
    CrossProcessSemaphore, IpcError, Process, ProcessConfig, ProcessState, SocketDomain,
    TransportMode, EXIT_LAUNCH_FAILURE, WAIT_FAILED,
};

const CHILD: &str = env!("CARGO_BIN_EXE_ipc-child");

fn no_args() -> Vec<String> {
    Vec::new()
}

// ============================================================================
// Pipes
// ============================================================================

/// `echo Hello` writes one line and exits cleanly.
#[test]
fn test_echo_hello_via_pipes() {
    let mut process = Process::new("echo", ["Hello"]);
    process.start().unwrap();

    assert_eq!(&process.read_stdout().unwrap()[..], b"Hello\n");
    assert_eq!(process.wait(), 0);
    assert_eq!(process.state(), ProcessState::Waited);
}

/// An executable that cannot be exec'd surfaces as exit status 127.
#[test]
fn test_missing_executable_exits_127() {
    let mut process = Process::new("this-program-does-not-exist-anywhere", no_args());
    process.start().unwrap();

    assert!(process.read_stdout().unwrap().is_empty());
    assert_eq!(process.wait(), EXIT_LAUNCH_FAILURE);
}

#[test]
fn test_exit_status_and_stderr() {
    let mut process = Process::new("sh", ["-c", "echo oops >&2; exit 3"]);
    process.start().unwrap();

    assert!(process.read_stdout().unwrap().is_empty());
    assert_eq!(&process.read_stderr().unwrap()[..], b"oops\n");
    assert_eq!(process.wait(), 3);
}

/// Writing after the child is gone truncates instead of killing the parent.
#[test]
fn test_write_after_child_exit() {
    let mut process = Process::new("true", no_args());
    process.start().unwrap();
    assert_eq!(process.wait(), 0);

    assert_eq!(process.write_stdin(b"nobody reads this").unwrap(), 0);
}

#[test]
fn test_terminate_long_running_child() {
    let mut process = Process::new("sleep", ["30"]);
    process.start().unwrap();
    assert!(process.pid().is_some());

    process.terminate().unwrap();
    assert_eq!(process.wait(), WAIT_FAILED);
    assert_eq!(process.state(), ProcessState::Terminated);
}

// ============================================================================
// Sockets
// ============================================================================

fn socket_echo(base_port: u16, domain: SocketDomain) {
    let mut process = Process::new(CHILD, no_args());
    process.start_sockets(base_port, domain).unwrap();
    assert_eq!(process.transport(), Some(TransportMode::Sockets(domain)));

    assert_eq!(process.write_stdin(b"ping").unwrap(), 4);
    process.close_stdin().unwrap();

    assert_eq!(&process.read_stdout().unwrap()[..], b"echo: ping");
    assert_eq!(&process.read_stderr().unwrap()[..], b"done\n");
    assert_eq!(process.wait(), 0);
}

#[test]
fn test_unix_socket_echo() {
    socket_echo(47201, SocketDomain::Unix);

    for port in 47201..=47203 {
        assert!(!proc_ipc::transport::unix_socket_path(port).exists());
    }
}

#[test]
fn test_ipv4_socket_echo() {
    socket_echo(47211, SocketDomain::Ipv4);
}

/// A port that is already taken fails before any child is spawned.
#[test]
fn test_bind_failure_before_spawn() {
    let _blocker = std::net::TcpListener::bind("0.0.0.0:47222").unwrap();

    let mut process = Process::new(CHILD, no_args());
    let err = process.start_sockets(47220, SocketDomain::Ipv4).unwrap_err();

    assert!(matches!(err, IpcError::Bind { .. }), "got {err:?}");
    assert_eq!(process.state(), ProcessState::Unstarted);
    assert!(process.pid().is_none());
}

/// A child that never connects is reaped and the start fails.
#[test]
fn test_accept_timeout_when_child_never_connects() {
    let mut process = Process::builder("true")
        .accept_timeout(Duration::from_millis(200))
        .build();
    let err = process.start_sockets(47231, SocketDomain::Unix).unwrap_err();

    assert!(matches!(err, IpcError::AcceptTimeout { .. }), "got {err:?}");
    assert_eq!(process.state(), ProcessState::Unstarted);
}

// ============================================================================
// Shared memory
// ============================================================================

#[test]
fn test_shared_memory_echo() {
    let mut process = Process::new(CHILD, no_args());
    process.start_shared_memory(4096).unwrap();
    assert_eq!(process.transport(), Some(TransportMode::SharedMemory));

    assert_eq!(process.write_stdin(b"hello").unwrap(), 5);
    assert_eq!(&process.read_stdout().unwrap()[..], b"child: hello");

    process.write_stdin(b"second").unwrap();
    assert_eq!(&process.read_stdout().unwrap()[..], b"child: second");
    assert!(process.read_stderr().unwrap().is_empty());

    // No end-of-stream on shared memory; the child keeps serving.
    process.close_stdin().unwrap();
    process.write_stdin(b"after close").unwrap();
    assert_eq!(&process.read_stdout().unwrap()[..], b"child: after close");

    process.write_stdin(b"exit").unwrap();
    assert_eq!(process.wait(), 0);
}

#[test]
fn test_shared_memory_via_config() {
    let json = format!(
        r#"{{
            "program": {CHILD:?},
            "transport": {{ "mode": "shared_memory", "size": 256 }}
        }}"#
    );
    let config = ProcessConfig::from_json(&json).unwrap();
    let mut process = config.spawn().unwrap();

    process.write_stdin(b"configured").unwrap();
    assert_eq!(&process.read_stdout().unwrap()[..], b"child: configured");
    process.write_stdin(b"exit").unwrap();
    assert_eq!(process.wait(), 0);
}

// ============================================================================
// Cross-process semaphore
// ============================================================================

/// Two processes sharing a binary semaphore never overlap in the critical
/// section.
#[test]
fn test_semaphore_mutual_exclusion_across_processes() {
    let name = format!("/ipci{}.mutex", std::process::id());
    let log = std::env::temp_dir().join(format!("ipc_sem_log_{}", std::process::id()));
    let _ = std::fs::remove_file(&log);
    let log_arg = log.display().to_string();

    let sem = CrossProcessSemaphore::create(&name, 1).unwrap();

    let mut workers: Vec<Process> = ["A", "B"]
        .into_iter()
        .map(|tag| {
            let mut worker = Process::new(
                CHILD,
                ["sem-worker", name.as_str(), log_arg.as_str(), "5", tag],
            );
            worker.start().unwrap();
            worker
        })
        .collect();
    for worker in &mut workers {
        assert_eq!(worker.wait(), 0);
    }

    let contents = std::fs::read_to_string(&log).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 20);
    for pair in lines.chunks(2) {
        let tag = pair[0].strip_prefix("enter ").unwrap();
        assert_eq!(pair[1], format!("exit {tag}"));
    }
    assert_eq!(sem.value().unwrap(), 1);

    sem.close();
    let _ = std::fs::remove_file(&log);
}
