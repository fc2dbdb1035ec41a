//! Signal-to-event bridge.
//!
//! OS signals are caught by tokio's self-pipe driver; a forwarder task turns
//! each delivery into a one-byte [`SignalEvent`] on a bounded channel. All
//! real handling (reaping, phase changes, logging) happens in the consumer.
//!
//! ## Coalescing
//!
//! Each event kind has a pending flag. A notification whose kind is already
//! queued is dropped, so the channel never holds more than one event per
//! kind and can never fill up. The receiver clears the flag before handing
//! the event out; consumers must treat `ChildExited` as "re-scan everything".

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::session::StopHandle;

/// Facts recorded by the asynchronous side of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SignalEvent {
    /// A worker exited (SIGCHLD, or a task worker finishing).
    ChildExited = b'C',
    /// SIGINT
    Interrupt = b'I',
    /// SIGTERM
    Terminate = b'T',
}

impl SignalEvent {
    fn slot(self) -> usize {
        match self {
            SignalEvent::ChildExited => 0,
            SignalEvent::Interrupt => 1,
            SignalEvent::Terminate => 2,
        }
    }

    /// Whether this event asks the supervisor to shut down.
    pub fn is_shutdown(self) -> bool {
        matches!(self, SignalEvent::Interrupt | SignalEvent::Terminate)
    }
}

const KINDS: usize = 3;

type Pending = Arc<[AtomicBool; KINDS]>;

/// Create a connected sender/receiver pair.
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(KINDS);
    let pending: Pending = Arc::new([
        AtomicBool::new(false),
        AtomicBool::new(false),
        AtomicBool::new(false),
    ]);
    (
        EventSender {
            tx,
            pending: Arc::clone(&pending),
        },
        EventReceiver { rx, pending },
    )
}

/// Producer side. Cheap to clone; never blocks.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<SignalEvent>,
    pending: Pending,
}

impl EventSender {
    /// Record `event`. Returns `false` if it was coalesced with an already
    /// queued event of the same kind or the receiver is gone.
    pub fn notify(&self, event: SignalEvent) -> bool {
        let flag = &self.pending[event.slot()];
        if flag.swap(true, Ordering::AcqRel) {
            trace!(?event, "Coalesced signal event");
            return false;
        }
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                flag.store(false, Ordering::Release);
                false
            }
        }
    }
}

/// Consumer side, owned by the accept loop.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<SignalEvent>,
    pending: Pending,
}

impl EventReceiver {
    /// Wait for the next event. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<SignalEvent> {
        let event = self.rx.recv().await?;
        self.pending[event.slot()].store(false, Ordering::Release);
        Some(event)
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<SignalEvent> {
        let event = self.rx.try_recv().ok()?;
        self.pending[event.slot()].store(false, Ordering::Release);
        Some(event)
    }
}

/// Install SIGCHLD/SIGINT/SIGTERM listeners feeding `sender`.
///
/// Fails if any handler cannot be registered; callers treat that as a fatal
/// startup fault.
pub fn install(sender: EventSender) -> io::Result<JoinHandle<()>> {
    let mut sigchld = signal(SignalKind::child())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(()) = sigchld.recv() => SignalEvent::ChildExited,
                Some(()) = sigint.recv() => SignalEvent::Interrupt,
                Some(()) = sigterm.recv() => SignalEvent::Terminate,
                else => break,
            };
            if event.is_shutdown() {
                info!(?event, "Received shutdown signal");
            }
            sender.notify(event);
            if sender.tx.is_closed() {
                debug!("Signal event receiver dropped, forwarder exiting");
                break;
            }
        }
    }))
}

/// Turn SIGTERM/SIGINT into a cooperative stop request.
///
/// Used by worker processes: the session notices the stop before its next
/// I/O attempt.
pub fn forward_termination(stop: StopHandle) -> io::Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => debug!("SIGTERM received, stopping session"),
            _ = sigint.recv() => debug!("SIGINT received, stopping session"),
        }
        stop.stop();
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (tx, mut rx) = channel();
        assert!(tx.notify(SignalEvent::ChildExited));
        assert!(tx.notify(SignalEvent::Terminate));

        assert_eq!(rx.recv().await, Some(SignalEvent::ChildExited));
        assert_eq!(rx.recv().await, Some(SignalEvent::Terminate));
        assert_eq!(rx.try_recv(), None);
    }

    #[tokio::test]
    async fn test_duplicate_kind_coalesced_until_consumed() {
        let (tx, mut rx) = channel();
        assert!(tx.notify(SignalEvent::ChildExited));
        assert!(!tx.notify(SignalEvent::ChildExited));
        assert!(!tx.notify(SignalEvent::ChildExited));

        // Other kinds still get through
        assert!(tx.notify(SignalEvent::Interrupt));

        assert_eq!(rx.recv().await, Some(SignalEvent::ChildExited));
        assert_eq!(rx.recv().await, Some(SignalEvent::Interrupt));
        assert_eq!(rx.try_recv(), None);

        // Consumed, so the next one is queued again
        assert!(tx.notify(SignalEvent::ChildExited));
        assert_eq!(rx.try_recv(), Some(SignalEvent::ChildExited));
    }

    #[tokio::test]
    async fn test_channel_never_overflows() {
        let (tx, mut rx) = channel();
        for _ in 0..100 {
            tx.notify(SignalEvent::ChildExited);
            tx.notify(SignalEvent::Interrupt);
            tx.notify(SignalEvent::Terminate);
        }

        let mut seen = Vec::new();
        while let Some(ev) = rx.try_recv() {
            seen.push(ev);
        }
        assert_eq!(
            seen,
            vec![
                SignalEvent::ChildExited,
                SignalEvent::Interrupt,
                SignalEvent::Terminate
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_receiver() {
        let (tx, rx) = channel();
        drop(rx);
        assert!(!tx.notify(SignalEvent::Terminate));
    }

    #[test]
    fn test_event_tags() {
        assert_eq!(SignalEvent::ChildExited as u8, b'C');
        assert!(SignalEvent::Terminate.is_shutdown());
        assert!(SignalEvent::Interrupt.is_shutdown());
        assert!(!SignalEvent::ChildExited.is_shutdown());
    }
}
