//! Task-backed workers: one tokio task per connection.
//!
//! Graceful termination sets the session's stop flag; forced termination
//! aborts the task. Exit is observed through a oneshot carrying the session
//! report: a dropped sender without a report means the task was aborted or
//! panicked.

use std::io;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{info_span, Instrument};

use crate::session::{run_session, stop_channel, Session, SessionLimits, SessionReport, StopHandle};
use crate::signals::{EventSender, SignalEvent};
use crate::worker::{Connection, SpawnError, SpawnFailure, Spawner, Worker, WorkerExit, WorkerId};

/// Spawns each session onto the current tokio runtime.
pub struct TaskSpawner {
    limits: SessionLimits,
    events: EventSender,
}

impl TaskSpawner {
    pub fn new(limits: SessionLimits, events: EventSender) -> Self {
        Self { limits, events }
    }
}

impl Spawner for TaskSpawner {
    fn spawn(&self, conn: Connection) -> Result<Box<dyn Worker>, SpawnFailure> {
        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                let err = io::Error::new(io::ErrorKind::Other, e);
                return Err(SpawnFailure::new(SpawnError::Failed(err), Some(conn)));
            }
        };

        let (stop_handle, stop) = stop_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let exit_notice = ExitNotice(self.events.clone());
        let limits = self.limits.clone();
        let session_id = conn.session_id;
        let span = info_span!("worker", session = session_id);

        let join = runtime.spawn(
            async move {
                // Posts ChildExited on completion, panic, and abort alike.
                let _exit_notice = exit_notice;
                let session = Session::new(conn.session_id, conn.peer);
                let report = run_session(conn.stream, session, &limits, stop).await;
                let _ = exit_tx.send(report);
            }
            .instrument(span),
        );

        Ok(Box::new(TaskWorker {
            id: WorkerId::Task(session_id),
            join,
            stop: stop_handle,
            exit: exit_rx,
            killed: false,
        }))
    }
}

struct ExitNotice(EventSender);

impl Drop for ExitNotice {
    fn drop(&mut self) {
        self.0.notify(SignalEvent::ChildExited);
    }
}

/// Supervisor-side handle to a session task.
pub struct TaskWorker {
    id: WorkerId,
    join: JoinHandle<()>,
    stop: StopHandle,
    exit: oneshot::Receiver<SessionReport>,
    killed: bool,
}

impl Worker for TaskWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.stop.stop();
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.killed = true;
        self.join.abort();
        Ok(())
    }

    fn try_wait(&mut self) -> io::Result<Option<WorkerExit>> {
        match self.exit.try_recv() {
            Ok(_report) => Ok(Some(WorkerExit::Exited(0))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Closed) if self.killed => Ok(Some(WorkerExit::Killed)),
            Err(TryRecvError::Closed) => Ok(Some(WorkerExit::Panicked)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn connection(session_id: u64) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        (
            Connection {
                stream,
                peer,
                session_id,
            },
            client,
        )
    }

    async fn wait_exit(worker: &mut Box<dyn Worker>) -> WorkerExit {
        for _ in 0..200 {
            if let Some(exit) = worker.try_wait().unwrap() {
                return exit;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("worker did not exit");
    }

    #[tokio::test]
    async fn test_task_worker_serves_session() {
        let (events, mut rx) = signals::channel();
        let limits = SessionLimits {
            io_target: 1,
            ..SessionLimits::default()
        };
        let spawner = TaskSpawner::new(limits, events);
        let (conn, mut client) = connection(1).await;

        let mut worker = spawner.spawn(conn).unwrap();
        assert_eq!(worker.id(), WorkerId::Task(1));

        client.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        assert_eq!(wait_exit(&mut worker).await, WorkerExit::Exited(0));
        assert_eq!(rx.recv().await, Some(SignalEvent::ChildExited));
    }

    #[tokio::test]
    async fn test_terminate_is_graceful() {
        let (events, _rx) = signals::channel();
        let spawner = TaskSpawner::new(SessionLimits::default(), events);
        let (conn, _client) = connection(2).await;

        let mut worker = spawner.spawn(conn).unwrap();
        assert_eq!(worker.try_wait().unwrap(), None);

        worker.terminate().unwrap();
        assert_eq!(wait_exit(&mut worker).await, WorkerExit::Exited(0));
    }

    #[tokio::test]
    async fn test_kill_reports_killed() {
        let (events, mut rx) = signals::channel();
        let spawner = TaskSpawner::new(SessionLimits::default(), events);
        let (conn, _client) = connection(3).await;

        let mut worker = spawner.spawn(conn).unwrap();
        worker.kill().unwrap();

        assert_eq!(wait_exit(&mut worker).await, WorkerExit::Killed);
        assert_eq!(rx.recv().await, Some(SignalEvent::ChildExited));
    }
}
