//! User-visible notices and the pub/sub plumbing that carries them.
//!
//! Notices are transient: one per occurrence (a stalled sync, an armed
//! cooldown, a refused call), never one per retry attempt.

pub mod bus;
pub mod in_memory_bus;
pub mod notice;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use notice::{Notice, NoticeBus, Notifier, NullNotifier};
