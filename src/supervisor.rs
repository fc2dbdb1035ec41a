//! Supervisor accept loop.
//!
//! Multiplexes the listening socket and the signal event channel with a
//! bounded wake-up interval. Phase is `Accepting` until the first shutdown
//! event, then `Draining` for good: the listener is closed (pending backlog
//! connections are reset) and the shutdown coordinator takes over.

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::{Config, WorkerMode};
use crate::registry::{RegistryStats, WorkerRegistry};
use crate::shutdown::{ShutdownCoordinator, ShutdownPolicy, ShutdownReport};
use crate::signals::{self, EventReceiver, EventSender, SignalEvent};
use crate::worker::{Connection, ProcessSpawner, SpawnError, Spawner, TaskSpawner};

/// Default deadline for writing the capacity message to a rejected connection.
pub const REJECT_WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// An opportunistic reap is done before spawning if the last one is older.
const REAP_STALENESS: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Accepting,
    Draining,
}

/// Accept loop tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Wake-up interval of the accept loop.
    pub accept_poll: Duration,
    /// Written to connections rejected at capacity.
    pub capacity_message: Option<Vec<u8>>,
    /// Deadline for each of the message write and the close.
    pub reject_timeout: Duration,
    pub shutdown: ShutdownPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            accept_poll: Duration::from_secs(1),
            capacity_message: Some(b"service at capacity\r\n".to_vec()),
            reject_timeout: REJECT_WRITE_TIMEOUT,
            shutdown: ShutdownPolicy::default(),
        }
    }
}

impl From<&Config> for SupervisorConfig {
    fn from(config: &Config) -> Self {
        Self {
            accept_poll: config.accept_poll,
            capacity_message: config.capacity_message.as_ref().map(|m| m.as_bytes().to_vec()),
            reject_timeout: REJECT_WRITE_TIMEOUT,
            shutdown: ShutdownPolicy {
                grace_period: config.grace_period,
                poll_interval: config.shutdown_poll,
                kill_settle: config.kill_settle,
            },
        }
    }
}

/// Final accounting of a supervisor run.
#[derive(Debug, Clone)]
pub struct SupervisorReport {
    pub stats: RegistryStats,
    pub shutdown: ShutdownReport,
    pub accept_errors: u64,
}

enum Wake {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Event(Option<SignalEvent>),
    Tick,
}

pub struct Supervisor {
    listener: Option<TcpListener>,
    registry: Arc<WorkerRegistry>,
    events: EventReceiver,
    config: SupervisorConfig,
    phase: Phase,
    next_session: u64,
    last_reap: Instant,
    accept_errors: u64,
}

impl Supervisor {
    pub fn new(
        listener: TcpListener,
        registry: Arc<WorkerRegistry>,
        events: EventReceiver,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            listener: Some(listener),
            registry,
            events,
            config,
            phase: Phase::Accepting,
            next_session: 1,
            last_reap: Instant::now(),
            accept_errors: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run until a shutdown event, then drain all workers.
    pub async fn run(mut self) -> SupervisorReport {
        if let Some(addr) = self.listener.as_ref().and_then(|l| l.local_addr().ok()) {
            info!(
                address = %addr,
                max_workers = self.registry.capacity(),
                "Supervisor accepting connections"
            );
        }

        while self.phase == Phase::Accepting {
            self.poll_once().await;
        }

        // Closing the listener resets anything still in the backlog.
        self.listener = None;

        let mut coordinator = ShutdownCoordinator::new(self.config.shutdown.clone());
        let shutdown = coordinator.drain(&self.registry).await;
        let stats = self.registry.snapshot();
        info!(
            spawned = stats.total_spawned,
            reaped = stats.total_reaped,
            spawn_failures = stats.spawn_failures,
            capacity_rejections = stats.capacity_rejections,
            accept_errors = self.accept_errors,
            "Supervisor stopped"
        );

        SupervisorReport {
            stats,
            shutdown,
            accept_errors: self.accept_errors,
        }
    }

    /// One bounded wait on the listener and the event channel.
    async fn poll_once(&mut self) {
        let wake = {
            let Some(listener) = self.listener.as_ref() else {
                self.phase = Phase::Draining;
                return;
            };
            tokio::select! {
                accepted = listener.accept() => Wake::Accepted(accepted),
                event = self.events.recv() => Wake::Event(event),
                _ = tokio::time::sleep(self.config.accept_poll) => Wake::Tick,
            }
        };

        match wake {
            Wake::Accepted(Ok((stream, peer))) => self.dispatch(stream, peer),
            Wake::Accepted(Err(e)) => {
                self.accept_errors += 1;
                error!(error = %e, "Failed to accept connection");
            }
            Wake::Event(event) => self.handle_event(event),
            // Covers coalesced or missed exit notifications.
            Wake::Tick => self.reap(),
        }
    }

    fn handle_event(&mut self, event: Option<SignalEvent>) {
        match event {
            Some(SignalEvent::ChildExited) => self.reap(),
            Some(event @ (SignalEvent::Interrupt | SignalEvent::Terminate)) => {
                info!(?event, workers = self.registry.len(), "Shutdown requested");
                self.phase = Phase::Draining;
            }
            None => {
                warn!("Signal bridge closed, shutting down");
                self.phase = Phase::Draining;
            }
        }
    }

    fn reap(&mut self) {
        self.registry.reap();
        self.last_reap = Instant::now();
    }

    /// Hand an accepted connection to a new worker or reject it.
    fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr) {
        let session_id = self.next_session;
        self.next_session += 1;

        if self.registry.len() >= self.registry.capacity()
            || self.last_reap.elapsed() >= REAP_STALENESS
        {
            self.reap();
        }

        let conn = Connection {
            stream,
            peer,
            session_id,
        };

        match self.registry.spawn(conn) {
            Ok(handle) => {
                debug!(worker = %handle.id, session = session_id, peer = %peer, "Connection dispatched");
            }
            Err(failure) => match failure.error {
                SpawnError::CapacityExceeded { limit } => {
                    warn!(session = session_id, peer = %peer, limit, "At capacity, rejecting connection");
                    if let Some(conn) = failure.connection {
                        // Rejection runs beside the loop so a slow peer cannot stall accepts.
                        tokio::spawn(reject(
                            conn.stream,
                            self.config.capacity_message.clone(),
                            self.config.reject_timeout,
                        ));
                    }
                }
                error => {
                    // The connection, if handed back, is dropped (closed) here.
                    error!(session = session_id, peer = %peer, error = %error, "Failed to spawn worker");
                }
            },
        }
    }
}

/// Write the optional rejection message, then close the connection.
pub async fn reject<W>(mut stream: W, message: Option<Vec<u8>>, deadline: Duration)
where
    W: AsyncWrite + Unpin,
{
    if let Some(message) = message {
        match tokio::time::timeout(deadline, stream.write_all(&message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Failed to write capacity message"),
            Err(_) => debug!("Timed out writing capacity message"),
        }
    }
    let _ = tokio::time::timeout(deadline, stream.shutdown()).await;
}

/// Bind a listening socket with SO_REUSEADDR.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(SockProtocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

/// Build the spawner selected by `config`.
pub fn spawner_for(config: &Config, events: &EventSender) -> io::Result<Box<dyn Spawner>> {
    Ok(match config.worker_mode {
        WorkerMode::Task => Box::new(TaskSpawner::new(config.session.clone(), events.clone())),
        WorkerMode::Process => Box::new(ProcessSpawner::current_exe(
            &config.session,
            &config.log_level,
            config.log_file.as_ref(),
        )?),
    })
}

/// Run the supervisor with OS signal handling until shutdown completes.
///
/// Binding and signal installation failures are returned before the accept
/// loop starts.
pub async fn serve(config: Config) -> io::Result<SupervisorReport> {
    let (events_tx, events_rx) = signals::channel();
    signals::install(events_tx.clone())?;

    let listener = bind_listener(config.listen, config.backlog)?;
    let spawner = spawner_for(&config, &events_tx)?;
    let registry = Arc::new(WorkerRegistry::new(spawner, config.max_workers));

    info!(
        worker_mode = ?config.worker_mode,
        io_target = config.session.io_target,
        idle_timeout_secs = config.session.idle_timeout.as_secs(),
        "Starting supervisor"
    );

    let supervisor = Supervisor::new(listener, registry, events_rx, SupervisorConfig::from(&config));
    Ok(supervisor.run().await)
}
