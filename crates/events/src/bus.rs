//! Publish/subscribe abstraction (mechanics only).
//!
//! The bus is a **distribution** mechanism: it fans each published message
//! out to every live subscriber and keeps nothing. A subscriber that joins
//! late misses earlier messages, which is fine for transient notices.
//!
//! ## Delivery
//!
//! - Broadcast: each subscription receives its own copy.
//! - Best-effort: dropped subscriptions are pruned on the next publish.
//! - Per-publisher ordering only.

use std::sync::Arc;
use std::sync::mpsc::Receiver;

/// A subscription to a message stream.
///
/// ```ignore
/// let notices = provider.subscribe_notices();
/// while let Ok(notice) = notices.try_recv() {
///     show_toast(notice.message());
/// }
/// ```
///
/// Subscriptions are meant for a single consumer.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Everything published so far that has not been received yet.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Transport-agnostic pub/sub contract.
///
/// `publish` may fail (e.g. internal lock poisoning); callers decide whether
/// a lost notice matters. Implementations must be shareable across tasks.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
