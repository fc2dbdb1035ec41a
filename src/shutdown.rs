//! Two-phase shutdown coordinator.
//!
//! `Running -> Draining -> Terminated`, entered once. Draining broadcasts a
//! graceful stop, then polls the registry until it is empty or the grace
//! window closes. Survivors are force-killed, given a short settle window,
//! and drained one last time. The coordinator always returns within
//! `grace_period + kill_settle` plus scheduling noise.

use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::registry::WorkerRegistry;

/// Timing of the shutdown sequence.
#[derive(Debug, Clone)]
pub struct ShutdownPolicy {
    /// Time workers get to exit after the graceful request.
    pub grace_period: Duration,
    /// Registry poll interval while waiting.
    pub poll_interval: Duration,
    /// Time the runtime gets to reclaim force-killed workers.
    pub kill_settle: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            kill_settle: Duration::from_millis(150),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining { deadline: Instant },
    Terminated,
}

/// What the shutdown sequence did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers sent the graceful request.
    pub signalled: usize,
    /// Workers reaped before the grace window closed.
    pub exited_gracefully: usize,
    /// Workers sent the forced kill.
    pub force_killed: usize,
    /// Workers still registered when the coordinator gave up.
    pub unconfirmed: usize,
    pub elapsed: Duration,
}

pub struct ShutdownCoordinator {
    state: ShutdownState,
    policy: ShutdownPolicy,
}

impl ShutdownCoordinator {
    pub fn new(policy: ShutdownPolicy) -> Self {
        Self {
            state: ShutdownState::Running,
            policy,
        }
    }

    pub fn state(&self) -> ShutdownState {
        self.state
    }

    /// `Running -> Draining`. Returns `false` if shutdown already began.
    pub fn begin(&mut self) -> bool {
        match self.state {
            ShutdownState::Running => {
                self.state = ShutdownState::Draining {
                    deadline: Instant::now() + self.policy.grace_period,
                };
                true
            }
            _ => false,
        }
    }

    /// Run the whole sequence and block until the registry is empty or the
    /// forced phase is over. Calling it again after termination is a no-op.
    pub async fn drain(&mut self, registry: &WorkerRegistry) -> ShutdownReport {
        let started = Instant::now();
        self.begin();
        let deadline = match self.state {
            ShutdownState::Draining { deadline } => deadline,
            _ => return ShutdownReport::default(),
        };

        let mut report = ShutdownReport {
            signalled: registry.terminate_all(),
            ..ShutdownReport::default()
        };
        info!(
            workers = report.signalled,
            grace_ms = self.policy.grace_period.as_millis() as u64,
            "Draining workers"
        );

        report.exited_gracefully = poll_until_empty(registry, deadline, self.policy.poll_interval).await;

        if !registry.is_empty() {
            report.force_killed = registry.kill_all();
            warn!(
                workers = report.force_killed,
                "Grace period elapsed, killing remaining workers"
            );

            let settle_deadline = Instant::now() + self.policy.kill_settle;
            poll_until_empty(registry, settle_deadline, self.policy.poll_interval).await;
            registry.reap();
        }

        report.unconfirmed = registry.len();
        if report.unconfirmed > 0 {
            warn!(
                workers = report.unconfirmed,
                "Workers could not be confirmed reclaimed"
            );
        }

        report.elapsed = started.elapsed();
        self.state = ShutdownState::Terminated;
        info!(
            elapsed_ms = report.elapsed.as_millis() as u64,
            graceful = report.exited_gracefully,
            killed = report.force_killed,
            "Shutdown complete"
        );
        report
    }
}

/// Reap every `interval` until the registry is empty or `deadline` passes.
/// Returns the number of workers reaped.
async fn poll_until_empty(registry: &WorkerRegistry, deadline: Instant, interval: Duration) -> usize {
    let mut reaped = 0;
    loop {
        reaped += registry.reap().len();
        if registry.is_empty() {
            return reaped;
        }
        let now = Instant::now();
        if now >= deadline {
            return reaped;
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{connection, FakeSpawner};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn policy(grace_ms: u64) -> ShutdownPolicy {
        ShutdownPolicy {
            grace_period: Duration::from_millis(grace_ms),
            poll_interval: Duration::from_millis(10),
            kill_settle: Duration::from_millis(100),
        }
    }

    async fn registry_with(spawner: &Arc<FakeSpawner>, workers: u64) -> (WorkerRegistry, Vec<tokio::net::TcpStream>) {
        let registry = WorkerRegistry::new(Box::new(Arc::clone(spawner)), 16);
        let mut clients = Vec::new();
        for id in 0..workers {
            let (conn, client) = connection(id).await;
            clients.push(client);
            registry.spawn(conn).unwrap();
        }
        (registry, clients)
    }

    #[test]
    fn test_state_transitions_are_monotonic() {
        let mut coordinator = ShutdownCoordinator::new(policy(100));
        assert_eq!(coordinator.state(), ShutdownState::Running);
        assert!(coordinator.begin());
        assert!(matches!(coordinator.state(), ShutdownState::Draining { .. }));
        assert!(!coordinator.begin());
    }

    #[tokio::test]
    async fn test_graceful_exit_returns_early() {
        let spawner = Arc::new(FakeSpawner::obedient());
        let (registry, _clients) = registry_with(&spawner, 5).await;

        let mut coordinator = ShutdownCoordinator::new(policy(5000));
        let report = coordinator.drain(&registry).await;

        assert_eq!(report.signalled, 5);
        assert_eq!(report.exited_gracefully, 5);
        assert_eq!(report.force_killed, 0);
        assert_eq!(report.unconfirmed, 0);
        assert!(report.elapsed < Duration::from_secs(1));
        assert!(registry.is_empty());
        assert_eq!(coordinator.state(), ShutdownState::Terminated);
    }

    #[tokio::test]
    async fn test_stragglers_are_killed_within_bound() {
        let spawner = Arc::new(FakeSpawner::obedient());
        let (registry, _clients) = registry_with(&spawner, 5).await;
        // Two workers ignore the graceful request
        for i in [1, 3] {
            spawner.state(i).obey_terminate.store(false, Ordering::SeqCst);
        }

        let grace = Duration::from_millis(200);
        let mut coordinator = ShutdownCoordinator::new(policy(200));
        let report = coordinator.drain(&registry).await;

        assert_eq!(report.signalled, 5);
        assert_eq!(report.exited_gracefully, 3);
        assert_eq!(report.force_killed, 2);
        assert_eq!(report.unconfirmed, 0);
        assert!(report.elapsed >= grace);
        assert!(report.elapsed < grace + Duration::from_millis(500));
        assert!(spawner.state(1).killed.load(Ordering::SeqCst));
        assert!(!spawner.state(0).killed.load(Ordering::SeqCst));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unkillable_workers_reported() {
        let spawner = Arc::new(FakeSpawner::default());
        let (registry, _clients) = registry_with(&spawner, 2).await;

        let mut coordinator = ShutdownCoordinator::new(policy(50));
        let report = coordinator.drain(&registry).await;

        assert_eq!(report.force_killed, 2);
        assert_eq!(report.unconfirmed, 2);
        assert_eq!(registry.len(), 2);
        assert!(report.elapsed < Duration::from_millis(50 + 100 + 500));
    }

    #[tokio::test]
    async fn test_empty_registry_drains_immediately() {
        let spawner = Arc::new(FakeSpawner::obedient());
        let (registry, _clients) = registry_with(&spawner, 0).await;

        let mut coordinator = ShutdownCoordinator::new(policy(5000));
        let report = coordinator.drain(&registry).await;
        assert_eq!(report, ShutdownReport {
            elapsed: report.elapsed,
            ..ShutdownReport::default()
        });
        assert!(report.elapsed < Duration::from_millis(100));

        // Second call is a no-op
        assert_eq!(coordinator.drain(&registry).await, ShutdownReport::default());
    }
}
