//! Process-backed workers: one child process per connection.
//!
//! The supervisor re-executes its own binary with the hidden `worker`
//! subcommand. The client socket is duplicated onto [`WORKER_FD`] in the
//! child; every other descriptor, including the listener, is close-on-exec.
//! Graceful termination is SIGTERM, forced termination SIGKILL.

use std::ffi::OsString;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, error};

use crate::config::WorkerArgs;
use crate::session::{run_session, stop_channel, Session, SessionLimits, SessionReport};
use crate::signals;
use crate::worker::{
    Connection, SpawnError, SpawnFailure, Spawner, Worker, WorkerExit, WorkerId,
    EXIT_FAILED_TO_START,
};

/// Descriptor slot the client socket occupies in a worker process.
pub const WORKER_FD: RawFd = 3;

/// Spawns `<exe> worker ...` for each connection.
pub struct ProcessSpawner {
    exe: PathBuf,
    base_args: Vec<OsString>,
}

impl ProcessSpawner {
    /// Spawner that re-executes the running binary.
    pub fn current_exe(
        limits: &SessionLimits,
        log_level: &str,
        log_file: Option<&PathBuf>,
    ) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, limits, log_level, log_file))
    }

    pub fn new(
        exe: PathBuf,
        limits: &SessionLimits,
        log_level: &str,
        log_file: Option<&PathBuf>,
    ) -> Self {
        let mut base_args: Vec<OsString> = vec![
            "worker".into(),
            "--fd".into(),
            WORKER_FD.to_string().into(),
            "--io-target".into(),
            limits.io_target.to_string().into(),
            "--poll-timeout-ms".into(),
            (limits.poll_timeout.as_millis() as u64).to_string().into(),
            "--idle-timeout-ms".into(),
            (limits.idle_timeout.as_millis() as u64).to_string().into(),
            "--buffer-size".into(),
            limits.buffer_size.to_string().into(),
            "--log-level".into(),
            log_level.into(),
        ];
        if let Some(path) = log_file {
            base_args.push("--log-file".into());
            base_args.push(path.into());
        }

        Self { exe, base_args }
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, conn: Connection) -> Result<Box<dyn Worker>, SpawnFailure> {
        let Connection {
            stream,
            peer,
            session_id,
        } = conn;

        let std_stream = match stream.into_std() {
            Ok(s) => s,
            Err(e) => return Err(SpawnFailure::new(SpawnError::Failed(e), None)),
        };
        let fd = std_stream.as_raw_fd();

        let mut cmd = Command::new(&self.exe);
        cmd.args(&self.base_args)
            .arg("--session-id")
            .arg(session_id.to_string())
            .arg("--peer")
            .arg(peer.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // SAFETY: the closure only calls async-signal-safe functions.
        unsafe {
            cmd.pre_exec(move || inherit_fd(fd));
        }

        match cmd.spawn() {
            Ok(child) => {
                // The child holds its own copy now.
                drop(std_stream);
                let pid = child.id().unwrap_or_default();
                debug!(pid, session = session_id, "Spawned worker process");
                Ok(Box::new(ProcessWorker { pid, child }))
            }
            Err(e) => {
                let connection = TcpStream::from_std(std_stream)
                    .ok()
                    .map(|stream| Connection {
                        stream,
                        peer,
                        session_id,
                    });
                Err(SpawnFailure::new(SpawnError::from_io(e), connection))
            }
        }
    }
}

/// Place `fd` on the fixed worker slot without close-on-exec.
fn inherit_fd(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain descriptor syscalls on a descriptor we own.
    unsafe {
        if fd == WORKER_FD {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error());
            }
        } else if libc::dup2(fd, WORKER_FD) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Supervisor-side handle to a worker process.
pub struct ProcessWorker {
    pid: u32,
    child: Child,
}

impl Worker for ProcessWorker {
    fn id(&self) -> WorkerId {
        WorkerId::Pid(self.pid)
    }

    fn terminate(&mut self) -> io::Result<()> {
        // SAFETY: kill(2) has no memory-safety preconditions. The child is
        // not waited for until try_wait reports it, so the pid cannot have
        // been recycled yet.
        let rc = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGTERM) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn try_wait(&mut self) -> io::Result<Option<WorkerExit>> {
        Ok(self.child.try_wait()?.map(exit_from_status))
    }
}

fn exit_from_status(status: ExitStatus) -> WorkerExit {
    match (status.code(), status.signal()) {
        (Some(code), _) => WorkerExit::Exited(code),
        (None, Some(sig)) => WorkerExit::Signaled(sig),
        (None, None) => WorkerExit::Lost,
    }
}

/// Entry point of the `worker` subcommand. Returns the process exit code.
pub fn run_child(args: &WorkerArgs) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to build worker runtime");
            return EXIT_FAILED_TO_START;
        }
    };

    match runtime.block_on(serve_inherited(args)) {
        Ok(_report) => 0,
        Err(e) => {
            error!(session = args.session_id, fd = args.fd, error = %e, "Worker failed to start");
            EXIT_FAILED_TO_START
        }
    }
}

async fn serve_inherited(args: &WorkerArgs) -> io::Result<SessionReport> {
    let stream = adopt_socket(args.fd)?;
    let peer = match args.peer {
        Some(peer) => peer,
        None => stream.peer_addr()?,
    };

    let (stop_handle, stop) = stop_channel();
    signals::forward_termination(stop_handle)?;

    let session = Session::new(args.session_id, peer);
    Ok(run_session(stream, session, &args.limits(), stop).await)
}

/// Take ownership of an inherited socket descriptor.
fn adopt_socket(fd: RawFd) -> io::Result<TcpStream> {
    // SAFETY: fstat only writes into the provided struct.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } < 0 {
        return Err(io::Error::last_os_error());
    }
    if stat.st_mode & libc::S_IFMT != libc::S_IFSOCK {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("descriptor {fd} is not a socket"),
        ));
    }

    // SAFETY: fd is an open socket handed to this process exclusively.
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
    std_stream.set_nonblocking(true)?;
    TcpStream::from_std(std_stream)
}
