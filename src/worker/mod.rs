//! Worker abstraction.
//!
//! A worker is an isolated unit serving exactly one connection. It can be
//! asked to exit, forcibly terminated, and polled for exit without blocking.
//!
//! Backends:
//! - `process`: one child process per connection (socket inherited on fd 3)
//! - `task`: one tokio task per connection

pub mod process;
pub mod task;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;

pub use process::ProcessSpawner;
pub use task::TaskSpawner;

/// Opaque identifier of a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerId {
    Pid(u32),
    Task(u64),
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerId::Pid(pid) => write!(f, "pid {pid}"),
            WorkerId::Task(id) => write!(f, "task {id}"),
        }
    }
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Exited on its own with this status code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(i32),
    /// Forcibly cancelled by the supervisor.
    Killed,
    /// Crashed (task panicked).
    Panicked,
    /// Exit status could not be inspected.
    Lost,
}

/// Exit code of a worker process that failed before serving its session.
pub const EXIT_FAILED_TO_START: i32 = 127;

impl WorkerExit {
    pub fn is_clean(&self) -> bool {
        matches!(self, WorkerExit::Exited(0))
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Exited(EXIT_FAILED_TO_START) => write!(f, "failed to start"),
            WorkerExit::Exited(code) => write!(f, "exited with status {code}"),
            WorkerExit::Signaled(sig) => write!(f, "terminated by signal {sig}"),
            WorkerExit::Killed => write!(f, "killed"),
            WorkerExit::Panicked => write!(f, "panicked"),
            WorkerExit::Lost => write!(f, "exit status unavailable"),
        }
    }
}

/// A supervisor-side handle to one running worker.
pub trait Worker: Send {
    fn id(&self) -> WorkerId;

    /// Ask the worker to finish its session and exit.
    fn terminate(&mut self) -> io::Result<()>;

    /// Terminate the worker unconditionally.
    fn kill(&mut self) -> io::Result<()>;

    /// Non-blocking exit check. `Some` exactly once the worker is gone.
    fn try_wait(&mut self) -> io::Result<Option<WorkerExit>>;
}

/// An accepted connection waiting for a worker.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub session_id: u64,
}

/// Creates workers from accepted connections.
pub trait Spawner: Send + Sync {
    fn spawn(&self, conn: Connection) -> Result<Box<dyn Worker>, SpawnFailure>;
}

/// Why a connection could not be handed to a worker.
#[derive(Debug)]
pub enum SpawnError {
    /// The registry already holds `limit` workers.
    CapacityExceeded { limit: usize },
    /// The execution primitive could not allocate a new unit.
    ResourceExhausted(io::Error),
    /// Any other spawn failure.
    Failed(io::Error),
}

impl SpawnError {
    /// Classify an OS error from process creation.
    pub fn from_io(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::ENOMEM) => SpawnError::ResourceExhausted(e),
            _ => SpawnError::Failed(e),
        }
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::CapacityExceeded { limit } => {
                write!(f, "worker capacity exceeded ({limit} workers)")
            }
            SpawnError::ResourceExhausted(e) => write!(f, "resources exhausted: {e}"),
            SpawnError::Failed(e) => write!(f, "spawn failed: {e}"),
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::CapacityExceeded { .. } => None,
            SpawnError::ResourceExhausted(e) | SpawnError::Failed(e) => Some(e),
        }
    }
}

/// A failed spawn. The connection is handed back when it is still intact
/// so the caller can reject it.
#[derive(Debug)]
pub struct SpawnFailure {
    pub error: SpawnError,
    pub connection: Option<Connection>,
}

impl SpawnFailure {
    pub fn new(error: SpawnError, connection: Option<Connection>) -> Self {
        Self { error, connection }
    }
}
