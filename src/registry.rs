//! Worker registry and reaper.
//!
//! Tracks live workers in a slab behind a single mutex. The accept loop
//! inserts through [`WorkerRegistry::spawn`]; the reaper removes through
//! [`WorkerRegistry::reap`]. Both critical sections are O(workers) at worst
//! and never await.
//!
//! Invariant, observed between mutations:
//! `live == total_spawned - total_reaped` and `live <= max_workers`.

use slab::Slab;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::worker::{
    Connection, SpawnError, SpawnFailure, Spawner, Worker, WorkerExit, WorkerId,
    EXIT_FAILED_TO_START,
};

/// Supervisor-side record of a spawned worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub session_id: u64,
    pub peer: SocketAddr,
    pub spawned_at: Instant,
}

/// A worker removed from the registry.
#[derive(Debug, Clone)]
pub struct ReapedWorker {
    pub handle: WorkerHandle,
    pub exit: WorkerExit,
    pub lifetime: Duration,
}

/// Read-only registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub live: usize,
    pub max_workers: usize,
    pub total_spawned: u64,
    pub total_reaped: u64,
    pub spawn_failures: u64,
    pub capacity_rejections: u64,
}

struct Entry {
    handle: WorkerHandle,
    worker: Box<dyn Worker>,
}

#[derive(Default)]
struct Inner {
    workers: Slab<Entry>,
    /// Spawns in progress outside the lock; they count against capacity.
    reserved: usize,
    total_spawned: u64,
    total_reaped: u64,
    spawn_failures: u64,
    capacity_rejections: u64,
}

/// Registry of live workers with a concurrency ceiling.
pub struct WorkerRegistry {
    inner: Mutex<Inner>,
    spawner: Box<dyn Spawner>,
    max_workers: usize,
}

impl WorkerRegistry {
    pub fn new(spawner: Box<dyn Spawner>, max_workers: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                workers: Slab::with_capacity(max_workers),
                ..Inner::default()
            }),
            spawner,
            max_workers,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves the counters consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand `conn` to a new worker.
    ///
    /// Fails with `CapacityExceeded` when `max_workers` are live; there is no
    /// backlog queue. Other failures are counted and returned with the
    /// connection when it survived.
    pub fn spawn(&self, conn: Connection) -> Result<WorkerHandle, SpawnFailure> {
        {
            let mut inner = self.lock();
            if inner.workers.len() + inner.reserved >= self.max_workers {
                inner.capacity_rejections += 1;
                return Err(SpawnFailure::new(
                    SpawnError::CapacityExceeded {
                        limit: self.max_workers,
                    },
                    Some(conn),
                ));
            }
            inner.reserved += 1;
        }

        let session_id = conn.session_id;
        let peer = conn.peer;
        let result = self.spawner.spawn(conn);

        let mut inner = self.lock();
        inner.reserved -= 1;
        match result {
            Ok(worker) => {
                let handle = WorkerHandle {
                    id: worker.id(),
                    session_id,
                    peer,
                    spawned_at: Instant::now(),
                };
                inner.workers.insert(Entry {
                    handle: handle.clone(),
                    worker,
                });
                inner.total_spawned += 1;
                Ok(handle)
            }
            Err(failure) => {
                inner.spawn_failures += 1;
                Err(failure)
            }
        }
    }

    /// Remove and return every worker that has exited. Never blocks.
    pub fn reap(&self) -> Vec<ReapedWorker> {
        let reaped = {
            let mut inner = self.lock();
            let mut exited = Vec::new();
            for (key, entry) in inner.workers.iter_mut() {
                match entry.worker.try_wait() {
                    Ok(Some(exit)) => exited.push((key, exit)),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(worker = %entry.handle.id, error = %e, "Exit status check failed");
                        exited.push((key, WorkerExit::Lost));
                    }
                }
            }

            let mut reaped = Vec::with_capacity(exited.len());
            for (key, exit) in exited {
                let entry = inner.workers.remove(key);
                inner.total_reaped += 1;
                reaped.push(ReapedWorker {
                    lifetime: entry.handle.spawned_at.elapsed(),
                    handle: entry.handle,
                    exit,
                });
            }
            reaped
        };

        for worker in &reaped {
            log_reaped(worker);
        }
        reaped
    }

    /// Ask every live worker to exit. Returns how many were signalled.
    pub fn terminate_all(&self) -> usize {
        self.for_each_worker(|worker| worker.terminate(), "Graceful stop request failed")
    }

    /// Forcibly terminate every live worker. Returns how many were signalled.
    pub fn kill_all(&self) -> usize {
        self.for_each_worker(|worker| worker.kill(), "Forced kill failed")
    }

    /// Forcibly terminate one worker. Returns `false` if it is not live.
    pub fn kill(&self, id: WorkerId) -> bool {
        let mut inner = self.lock();
        match inner
            .workers
            .iter_mut()
            .find(|(_, entry)| entry.handle.id == id)
        {
            Some((_, entry)) => {
                if let Err(e) = entry.worker.kill() {
                    warn!(worker = %id, error = %e, "Forced kill failed");
                }
                true
            }
            None => false,
        }
    }

    fn for_each_worker<F>(&self, mut op: F, failure: &str) -> usize
    where
        F: FnMut(&mut dyn Worker) -> std::io::Result<()>,
    {
        let mut inner = self.lock();
        let mut count = 0;
        for (_, entry) in inner.workers.iter_mut() {
            match op(entry.worker.as_mut()) {
                Ok(()) => count += 1,
                Err(e) => warn!(worker = %entry.handle.id, error = %e, "{}", failure),
            }
        }
        count
    }

    /// Handles of the workers currently live.
    pub fn handles(&self) -> Vec<WorkerHandle> {
        self.lock()
            .workers
            .iter()
            .map(|(_, entry)| entry.handle.clone())
            .collect()
    }

    /// Number of live workers.
    pub fn len(&self) -> usize {
        self.lock().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().workers.is_empty()
    }

    /// Maximum number of workers allowed.
    pub fn capacity(&self) -> usize {
        self.max_workers
    }

    pub fn snapshot(&self) -> RegistryStats {
        let inner = self.lock();
        RegistryStats {
            live: inner.workers.len(),
            max_workers: self.max_workers,
            total_spawned: inner.total_spawned,
            total_reaped: inner.total_reaped,
            spawn_failures: inner.spawn_failures,
            capacity_rejections: inner.capacity_rejections,
        }
    }
}

fn log_reaped(worker: &ReapedWorker) {
    let id = &worker.handle.id;
    let session = worker.handle.session_id;
    let lifetime_ms = worker.lifetime.as_millis() as u64;
    match worker.exit {
        WorkerExit::Exited(0) => {
            debug!(worker = %id, session, lifetime_ms, "Worker exited")
        }
        WorkerExit::Exited(EXIT_FAILED_TO_START) => {
            error!(worker = %id, session, "Worker failed to start")
        }
        exit => warn!(worker = %id, session, lifetime_ms, exit = %exit, "Worker exited abnormally"),
    }
}
