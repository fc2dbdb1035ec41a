//! echo-supervisor: a supervised multi-worker TCP echo server
//!
//! A long-lived supervisor accepts connections and hands each one to an
//! isolated worker (a child process or a tokio task), while enforcing:
//! - a ceiling on concurrently live workers
//! - timeout-bounded I/O per session
//! - a two-phase shutdown (graceful stop, then forced kill) that always
//!   converges to zero outstanding workers or reports the stragglers
//!
//! Data flow: accept loop -> worker spawn -> session engine -> worker exit
//! -> signal bridge `ChildExited` -> registry reap. A termination signal
//! hands control from the accept loop to the shutdown coordinator.

pub mod client;
pub mod config;
pub mod logging;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod signals;
pub mod supervisor;
pub mod worker;
