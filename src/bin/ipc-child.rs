//! Reference child for the socket and shared-memory transports.
//!
//! Modes, chosen by the first argument:
//!
//! - `unix|ipv4 <in> <out> <err>`: connect back, read stdin to the end,
//!   answer `echo: <input>` on stdout and `done` on stderr
//! - `<shm_in> <shm_out> <sem_in> <sem_out>`: answer every message with
//!   `child: <message>` until the message is `exit`
//! - `sem-worker <sem> <log> <iterations> <tag>`: take the semaphore, log
//!   `enter <tag>` / `exit <tag>` around a short critical section, release
//!
//! Logs go to the inherited stderr; set `RUST_LOG=debug` to see them.

use std::error::Error;
use std::fs::OpenOptions;
use std::io::Write;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use proc_ipc::control::{ChildArgs, SharedMemoryEndpoints, SocketStreams};
use proc_ipc::transport::{ReadChannel, RetryPolicy, WriteChannel};
use proc_ipc::CrossProcessSemaphore;
use tracing_subscriber::EnvFilter;

type BoxResult<T> = std::result::Result<T, Box<dyn Error>>;

const LOOPBACK: &str = "127.0.0.1";

/// Message that ends the shared-memory loop.
const EXIT_MESSAGE: &[u8] = b"exit";

/// Time spent inside the semaphore-protected section.
const CRITICAL_SECTION: Duration = Duration::from_millis(10);

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        Some("sem-worker") => sem_worker(&args[1..]),
        Some(_) => match ChildArgs::parse(args.as_slice()) {
            Ok((endpoints @ ChildArgs::Sockets { .. }, _)) => socket_echo(&endpoints),
            Ok((endpoints @ ChildArgs::SharedMemory { .. }, _)) => shm_echo(&endpoints),
            Err(e) => Err(e.into()),
        },
        None => Err("usage: ipc-child <endpoints...> | sem-worker <sem> <log> <n> <tag>".into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("ipc-child failed: {}", e);
            ExitCode::from(2)
        }
    }
}

fn socket_echo(endpoints: &ChildArgs) -> BoxResult<()> {
    let mut streams = SocketStreams::connect(endpoints, LOOPBACK, &RetryPolicy::default())?;

    let input = streams.stdin.read_all();
    tracing::debug!("Received {} bytes", input.len());

    let mut reply = b"echo: ".to_vec();
    reply.extend_from_slice(&input);
    streams.stdout.write(&reply);
    streams.stderr.write(b"done\n");
    Ok(())
}

fn shm_echo(endpoints: &ChildArgs) -> BoxResult<()> {
    let mut shm = SharedMemoryEndpoints::attach(endpoints)?;

    loop {
        let msg = shm.recv()?;
        if &msg[..] == EXIT_MESSAGE {
            tracing::debug!("Exit requested");
            return Ok(());
        }
        let mut reply = b"child: ".to_vec();
        reply.extend_from_slice(&msg);
        shm.send(&reply)?;
    }
}

fn sem_worker(args: &[String]) -> BoxResult<()> {
    let [name, log_path, iterations, tag] = args else {
        return Err("usage: sem-worker <sem> <log> <iterations> <tag>".into());
    };
    let iterations: u32 = iterations.parse()?;
    let sem = CrossProcessSemaphore::open(name)?;

    let append = |line: String| -> BoxResult<()> {
        let mut log = OpenOptions::new().append(true).create(true).open(log_path)?;
        log.write_all(line.as_bytes())?;
        Ok(())
    };

    for _ in 0..iterations {
        sem.wait()?;
        append(format!("enter {tag}\n"))?;
        thread::sleep(CRITICAL_SECTION);
        append(format!("exit {tag}\n"))?;
        sem.post()?;
    }
    Ok(())
}
