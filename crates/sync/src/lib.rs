//! `marketgrid-sync`
//!
//! **Responsibility:** pull a consolidated snapshot for a principal and
//! publish it to every consumer, once per refresh cycle.
//!
//! - [`RequestLock`] keeps at most one holder per operation key.
//! - [`StatusMachine`] exposes the `syncing` / `nominal` / `stalled` signal.
//! - [`SyncSession`] runs one refresh: lock, fetch, normalize, swap.

pub mod lock;
pub mod session;
pub mod source;
pub mod status;

pub use lock::{FULL_SYNC, RequestGuard, RequestLock};
pub use session::{RefreshMode, SkipReason, SyncOutcome, SyncSession, SyncStats};
pub use source::{FetchError, InMemorySnapshotSource, SnapshotSource};
pub use status::{StatusMachine, SyncStatus};
