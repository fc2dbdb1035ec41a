//! Session I/O engine.
//!
//! Runs one connection's read/echo/write cycle. Every read and write is
//! preceded by a readiness wait bounded by `poll_timeout`; a readiness
//! timeout is not a failure, it only gives the engine a chance to check the
//! idle ceiling (`now - last_activity >= idle_timeout`) and the stop flag.
//!
//! ## Wire behavior
//!
//! No framing: each read returns up to `buffer_size` bytes and exactly those
//! bytes are written back. After `io_target` echoes the connection is closed.

use bytes::BytesMut;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Bounds applied to a single session.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// Number of read-then-echo cycles before the session completes.
    pub io_target: usize,
    /// Readiness wait applied before each read or write.
    pub poll_timeout: Duration,
    /// Inactivity ceiling.
    pub idle_timeout: Duration,
    /// Maximum bytes consumed by one read.
    pub buffer_size: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            io_target: 10,
            poll_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            buffer_size: 1024,
        }
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Closing,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `io_target` echoes were served.
    Completed,
    /// The peer closed its write side (EOF).
    PeerClosed,
    /// Connection reset or broken pipe.
    PeerReset,
    /// No traffic for longer than the idle ceiling.
    IdleTimeout,
    /// The worker was asked to stop.
    Stopped,
    /// Unrecoverable I/O error.
    Failed(io::ErrorKind),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Completed => write!(f, "completed"),
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::PeerReset => write!(f, "peer reset"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::Stopped => write!(f, "stopped"),
            CloseReason::Failed(kind) => write!(f, "i/o error: {kind}"),
        }
    }
}

/// One accepted connection's state, owned by its worker.
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub peer: SocketAddr,
    state: SessionState,
    completed_io: usize,
    created_at: Instant,
    last_activity: Instant,
}

impl Session {
    pub fn new(id: u64, peer: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            peer,
            state: SessionState::Idle,
            completed_io: 0,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn completed_io(&self) -> usize {
        self.completed_io
    }

    /// Time since the last successful read or full write.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    fn activate(&mut self) {
        self.state = SessionState::Active;
        self.last_activity = Instant::now();
    }

    fn touch(&mut self) {
        // Instant is monotonic, so last_activity never moves backwards.
        self.last_activity = Instant::now();
    }

    fn record_echo(&mut self) {
        self.completed_io += 1;
        self.touch();
    }

    fn close(&mut self, reason: CloseReason) -> SessionReport {
        self.state = SessionState::Closing;
        let report = SessionReport {
            session_id: self.id,
            peer: self.peer,
            completed_io: self.completed_io,
            elapsed: self.created_at.elapsed(),
            reason,
        };
        self.state = SessionState::Closed;
        report
    }
}

/// Final accounting for a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: u64,
    pub peer: SocketAddr,
    pub completed_io: usize,
    pub elapsed: Duration,
    pub reason: CloseReason,
}

/// Creates a linked stop handle / stop signal pair.
pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle(tx), StopSignal(rx))
}

/// Requests a cooperative stop of a session.
#[derive(Debug)]
pub struct StopHandle(watch::Sender<bool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

/// Observed by the engine before each I/O attempt.
#[derive(Debug, Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // A closed channel with `false` never resolves `stopped()`.
        drop(tx);
        StopSignal(rx)
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once a stop was requested. Pending forever if the handle
    /// was dropped without requesting one.
    pub async fn stopped(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Run one session to completion and release the connection.
///
/// Never fails: every exit path is folded into the report's `CloseReason`.
pub async fn run_session(
    stream: TcpStream,
    mut session: Session,
    limits: &SessionLimits,
    mut stop: StopSignal,
) -> SessionReport {
    let mut buffer = BytesMut::with_capacity(limits.buffer_size);
    session.activate();
    debug!(session = session.id, peer = %session.peer, "Session started");

    let reason = loop {
        if session.completed_io >= limits.io_target {
            break CloseReason::Completed;
        }

        buffer.clear();
        match read_some(&stream, &mut buffer, &mut session, limits, &mut stop).await {
            Ok(0) => break CloseReason::PeerClosed,
            Ok(n) => trace!(session = session.id, bytes = n, "Read"),
            Err(reason) => break reason,
        }

        if let Err(reason) = write_all(&stream, &buffer, &mut session, limits, &mut stop).await {
            break reason;
        }
        session.record_echo();
    };

    // The connection is released exactly once, here.
    drop(stream);
    let report = session.close(reason);

    match report.reason {
        CloseReason::PeerReset | CloseReason::Failed(_) => warn!(
            session = report.session_id,
            peer = %report.peer,
            completed_io = report.completed_io,
            elapsed_ms = report.elapsed.as_millis() as u64,
            reason = %report.reason,
            "Session closed"
        ),
        _ => info!(
            session = report.session_id,
            peer = %report.peer,
            completed_io = report.completed_io,
            elapsed_ms = report.elapsed.as_millis() as u64,
            reason = %report.reason,
            "Session closed"
        ),
    }

    report
}

/// Read whatever is available, up to the buffer's capacity.
async fn read_some(
    stream: &TcpStream,
    buffer: &mut BytesMut,
    session: &mut Session,
    limits: &SessionLimits,
    stop: &mut StopSignal,
) -> Result<usize, CloseReason> {
    loop {
        wait_ready(stream, Interest::READABLE, session, limits, stop).await?;

        match stream.try_read_buf(buffer) {
            Ok(0) => return Ok(0),
            Ok(n) => {
                session.touch();
                return Ok(n);
            }
            Err(ref e) if is_transient(e) => continue,
            Err(e) => return Err(classify(session, e)),
        }
    }
}

/// Write the whole buffer, retrying partial writes.
async fn write_all(
    stream: &TcpStream,
    data: &[u8],
    session: &mut Session,
    limits: &SessionLimits,
    stop: &mut StopSignal,
) -> Result<(), CloseReason> {
    let mut written = 0;

    while written < data.len() {
        wait_ready(stream, Interest::WRITABLE, session, limits, stop).await?;

        match stream.try_write(&data[written..]) {
            Ok(0) => return Err(CloseReason::PeerClosed),
            Ok(n) => written += n,
            Err(ref e) if is_transient(e) => continue,
            Err(e) => return Err(classify(session, e)),
        }
    }

    session.touch();
    Ok(())
}

/// Wait until the socket is ready for `interest`.
///
/// Readiness timeouts are retried until the session has been idle for
/// longer than the idle ceiling.
async fn wait_ready(
    stream: &TcpStream,
    interest: Interest,
    session: &Session,
    limits: &SessionLimits,
    stop: &mut StopSignal,
) -> Result<(), CloseReason> {
    loop {
        if stop.is_stopped() {
            return Err(CloseReason::Stopped);
        }

        tokio::select! {
            biased;
            _ = stop.stopped() => return Err(CloseReason::Stopped),
            ready = tokio::time::timeout(limits.poll_timeout, stream.ready(interest)) => {
                match ready {
                    Ok(Ok(_)) => return Ok(()),
                    Ok(Err(ref e)) if is_transient(e) => continue,
                    Ok(Err(e)) => return Err(classify(session, e)),
                    Err(_elapsed) => {
                        if session.idle_for() >= limits.idle_timeout {
                            return Err(CloseReason::IdleTimeout);
                        }
                        trace!(session = session.id, "Readiness wait timed out, retrying");
                    }
                }
            }
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn classify(session: &Session, e: io::Error) -> CloseReason {
    match e.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => {
            debug!(session = session.id, error = %e, "Peer reset connection");
            CloseReason::PeerReset
        }
        kind => {
            debug!(session = session.id, error = %e, "Session I/O error");
            CloseReason::Failed(kind)
        }
    }
}
