//! Repeating notification feeds.
//!
//! A handler runs under its subscriber's lock, and cancellation takes the
//! same lock before clearing the handler. Once [`Subscription::unsubscribe`]
//! returns, the handler has finished any invocation in progress and will not
//! be called again.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError, Weak,
};

use tracing::{debug, trace};

use crate::{
    error::{Error, Result},
    list::{BlockList, List},
    objects::Block,
};

/// A change of the main chain above `fork_height`.
///
/// A plain extension is a reorganization with one incoming block and nothing
/// replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reorganization {
    fork_height: u32,
    incoming: BlockList,
    replaced: BlockList,
}

impl Reorganization {
    pub(crate) fn new(fork_height: u32, incoming: Vec<Block>, replaced: Vec<Block>) -> Self {
        let attach = |blocks: Vec<Block>| {
            List::from_engine(
                blocks
                    .into_iter()
                    .zip(fork_height.saturating_add(1)..)
                    .map(|(block, height)| block.at_height(height))
                    .collect(),
            )
        };
        Self {
            fork_height,
            incoming: attach(incoming),
            replaced: attach(replaced),
        }
    }

    /// Height of the last block both branches share.
    pub fn fork_height(&self) -> u32 {
        self.fork_height
    }

    /// Blocks now on the main chain, ascending from `fork_height + 1`.
    pub fn incoming(&self) -> &BlockList {
        &self.incoming
    }

    /// Blocks no longer on the main chain, ascending from `fork_height + 1`.
    pub fn replaced(&self) -> &BlockList {
        &self.replaced
    }
}

pub(crate) type Callback<E> = Box<dyn FnMut(Result<Arc<E>>) -> bool + Send + 'static>;

struct Subscriber<E> {
    id: u64,
    slot: Mutex<Option<Callback<E>>>,
}

impl<E> Subscriber<E> {
    /// Invoke the handler if still subscribed. Returns whether it stays
    /// subscribed.
    fn deliver(&self, event: Result<Arc<E>>) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handler) = slot.as_mut() else {
            return false;
        };
        let keep = handler(event);
        if !keep {
            *slot = None;
        }
        keep
    }

    fn clear(&self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Fan-out of one event type to its subscribers, in subscription order.
pub(crate) struct Feed<E> {
    name: &'static str,
    next: AtomicU64,
    subscribers: Mutex<Vec<Arc<Subscriber<E>>>>,
}

impl<E: Send + Sync + 'static> Feed<E> {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            next: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn list(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Subscriber<E>>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe(self: &Arc<Self>, handler: Callback<E>) -> Subscription {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            id,
            slot: Mutex::new(Some(handler)),
        });
        self.list().push(Arc::clone(&subscriber));
        debug!(feed = self.name, subscriber = id, "subscribed");
        Subscription {
            cancel: Some(Box::new(Registration {
                feed: Arc::downgrade(self),
                subscriber,
            })),
        }
    }

    /// Deliver `event` to every live subscriber.
    pub(crate) fn publish(&self, event: Arc<E>) {
        let snapshot: Vec<_> = self.list().clone();
        trace!(feed = self.name, subscribers = snapshot.len(), "publishing");
        let mut ended = Vec::new();
        for subscriber in snapshot {
            if !subscriber.deliver(Ok(Arc::clone(&event))) {
                ended.push(subscriber.id);
            }
        }
        if !ended.is_empty() {
            self.list().retain(|s| !ended.contains(&s.id));
        }
    }

    /// Deliver a terminal `err` to every subscriber and release them all.
    pub(crate) fn close(&self, err: Error) {
        let drained: Vec<_> = self.list().drain(..).collect();
        if !drained.is_empty() {
            debug!(feed = self.name, subscribers = drained.len(), "closing feed");
        }
        for subscriber in drained {
            subscriber.deliver(Err(err.clone()));
            subscriber.clear();
        }
    }

    /// Live subscribers.
    pub(crate) fn len(&self) -> usize {
        self.list().len()
    }

    fn remove(&self, id: u64) {
        self.list().retain(|s| s.id != id);
    }
}

trait Cancel: Send {
    fn cancel(&self);
    fn is_active(&self) -> bool;
}

struct Registration<E> {
    feed: Weak<Feed<E>>,
    subscriber: Arc<Subscriber<E>>,
}

impl<E: Send + Sync + 'static> Cancel for Registration<E> {
    fn cancel(&self) {
        self.subscriber.clear();
        if let Some(feed) = self.feed.upgrade() {
            feed.remove(self.subscriber.id);
            debug!(feed = feed.name, subscriber = self.subscriber.id, "unsubscribed");
        }
    }

    fn is_active(&self) -> bool {
        self.subscriber
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Guard of a live subscription; dropping it unsubscribes.
///
/// Do not unsubscribe from inside the handler itself; return `false` from
/// the handler instead.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn Cancel>>,
}

impl Subscription {
    /// A guard that was never subscribed.
    pub(crate) fn inert() -> Self {
        Self { cancel: None }
    }

    /// Whether the handler can still be invoked.
    pub fn is_active(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_active())
    }

    /// Stop the subscription. Waits for an invocation in progress to finish;
    /// after this returns the handler is never invoked again.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter(hits: &Arc<AtomicUsize>, keep: bool) -> Callback<u32> {
        let hits = Arc::clone(hits);
        Box::new(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            keep
        })
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let feed = Arc::new(Feed::new("test"));
        let hits = Arc::new(AtomicUsize::new(0));
        let sub = feed.subscribe(counter(&hits, true));
        feed.publish(Arc::new(1));
        assert!(sub.is_active());
        sub.unsubscribe();
        for n in 0..10 {
            feed.publish(Arc::new(n));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(feed.len(), 0);
    }

    #[test]
    fn returning_false_ends_the_subscription() {
        let feed = Arc::new(Feed::new("test"));
        let hits = Arc::new(AtomicUsize::new(0));
        let sub = feed.subscribe(counter(&hits, false));
        feed.publish(Arc::new(1));
        feed.publish(Arc::new(2));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!sub.is_active());
    }

    #[test]
    fn close_sends_one_terminal_error() {
        let feed = Arc::new(Feed::<u32>::new("test"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = feed.subscribe(Box::new(move |event| {
            sink.lock().unwrap().push(event.map(|v| *v));
            true
        }));
        feed.publish(Arc::new(4));
        feed.close(Error::EngineNotRunning);
        feed.publish(Arc::new(5));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Ok(4), Err(Error::EngineNotRunning)]
        );
        assert!(!sub.is_active());
    }

    #[test]
    fn reorganization_attaches_heights() {
        let genesis: Block = bitcoin::constants::genesis_block(bitcoin::Network::Regtest).into();
        let reorg = Reorganization::new(9, vec![genesis.clone(), genesis], vec![]);
        let heights: Vec<_> = reorg.incoming().iter().map(Block::height).collect();
        assert_eq!(heights, vec![Some(10), Some(11)]);
        assert!(reorg.incoming().is_read_only());
        assert_eq!(reorg.replaced().count(), 0);
    }
}
