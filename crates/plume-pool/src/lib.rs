//! AI worker pool: fans inference requests out to a fixed set of isolated
//! execution contexts (OS threads), correlates responses back to callers,
//! enforces per-request timeouts, replaces failed contexts transparently and
//! applies privacy-mode provider routing before dispatch.
//!
//! The supervisor task exclusively owns all mutable state (pending-request
//! registry, round-robin cursor, worker slots); everything else talks to it
//! over channels, so registry mutations are serialized by construction.

pub mod error;
pub mod pool;
pub mod privacy;
pub mod protocol;
pub mod worker;

pub use error::PoolError;
pub use pool::{PoolSnapshot, ProgressEvent, WorkerPool, WorkerSnapshot};
pub use privacy::{CountingPrivacyRouter, PrivacyRouter};
pub use protocol::{WorkerInbound, WorkerOutbound};
pub use worker::{Executor, Reporter, WorkerStatus};
