//! One-shot completion of asynchronous requests.
//!
//! Every request gets a [`RequestId`] and parks its handler in an in-flight
//! registry. The task serving it holds a [`Completer`]; whichever of the
//! task or a shutdown drain claims the handler first delivers the result,
//! and the other side finds the slot empty. A completer that is dropped
//! unfired delivers [`Error::EngineNotRunning`], so every handler runs
//! exactly once.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    task::{Context, Poll, Wake, Waker},
    thread::{self, Thread},
    time::{Duration, Instant},
};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};

/// Token identifying one asynchronous request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    /// Numeric value of the token.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Handler<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;
type Slot<T> = Arc<Mutex<Option<Handler<T>>>>;

trait Abort: Send {
    fn abort(&self, err: Error);
}

impl<T: Send + 'static> Abort for Slot<T> {
    fn abort(&self, err: Error) {
        let handler = self.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handler) = handler {
            handler(Err(err));
        }
    }
}

/// Registry of parked handlers keyed by request token.
#[derive(Clone, Default)]
pub(crate) struct Inflight {
    next: Arc<AtomicU64>,
    entries: Arc<Mutex<HashMap<RequestId, Box<dyn Abort>>>>,
}

impl Inflight {
    /// Park `handler` under a fresh token.
    pub(crate) fn register<T, F>(&self, handler: F) -> Completer<T>
    where
        T: Send + 'static,
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let id = RequestId(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        let slot: Slot<T> = Arc::new(Mutex::new(Some(Box::new(handler))));
        self.lock().insert(id, Box::new(Arc::clone(&slot)));
        Completer {
            id,
            slot,
            inflight: self.clone(),
        }
    }

    /// Requests still waiting for a result.
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Complete every parked request with `err`. Returns how many were
    /// still parked.
    pub(crate) fn abort_all(&self, err: Error) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            debug!(request = %id, "aborting in-flight request");
            entry.abort(err.clone());
        }
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, Box<dyn Abort>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The serving side of one request.
pub(crate) struct Completer<T: Send + 'static> {
    id: RequestId,
    slot: Slot<T>,
    inflight: Inflight,
}

impl<T: Send + 'static> Completer<T> {
    /// Token of the request.
    pub(crate) fn id(&self) -> RequestId {
        self.id
    }

    /// Deliver `result`, unless a shutdown drain got there first.
    pub(crate) fn complete(self, result: Result<T>) {
        self.fire(result);
    }

    fn fire(&self, result: Result<T>) {
        self.inflight.lock().remove(&self.id);
        let handler = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handler) = handler {
            handler(result);
        }
    }
}

impl<T: Send + 'static> Drop for Completer<T> {
    fn drop(&mut self) {
        self.fire(Err(Error::EngineNotRunning));
    }
}

/// Receiving end of [`channel`].
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
}

/// A completion handler paired with the [`Pending`] result it fills.
///
/// ```rust,ignore
/// let (handler, pending) = completion::channel();
/// chain.fetch_last_height(handler);
/// let height = pending.wait()?;
/// ```
pub fn channel<T: Send + 'static>() -> (impl FnOnce(Result<T>) + Send + 'static, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    let handler = move |result: Result<T>| {
        let _ = tx.send(result);
    };
    (handler, Pending { rx })
}

impl<T> Pending<T> {
    /// Block until the result arrives.
    ///
    /// Panics when called from inside an async runtime; `.await` the
    /// `Pending` there instead.
    pub fn wait(self) -> Result<T> {
        self.rx.blocking_recv().unwrap_or(Err(Error::EngineNotRunning))
    }

    /// Block for at most `timeout`; `None` if the result has not arrived,
    /// in which case the `Pending` can be waited on again.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let waker = Waker::from(Arc::new(Unpark(thread::current())));
        let mut cx = Context::from_waker(&waker);
        loop {
            if let Poll::Ready(result) = Pin::new(&mut self.rx).poll(&mut cx) {
                return Some(result.unwrap_or(Err(Error::EngineNotRunning)));
            }
            let left = deadline.checked_duration_since(Instant::now())?;
            if left.is_zero() {
                return None;
            }
            thread::park_timeout(left);
        }
    }
}

struct Unpark(Thread);

impl Wake for Unpark {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(Error::EngineNotRunning)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(hits: &Arc<AtomicUsize>) -> impl FnOnce(Result<u32>) + Send + 'static {
        let hits = Arc::clone(hits);
        move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn tokens_are_unique() {
        let inflight = Inflight::default();
        let a = inflight.register(|_: Result<u32>| {});
        let b = inflight.register(|_: Result<u32>| {});
        assert_ne!(a.id(), b.id());
        assert_eq!(inflight.len(), 2);
    }

    #[test]
    fn complete_then_drain_delivers_once() {
        let inflight = Inflight::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let completer = inflight.register(counting(&hits));
        completer.complete(Ok(7));
        assert_eq!(inflight.abort_all(Error::EngineNotRunning), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_then_complete_delivers_once() {
        let inflight = Inflight::default();
        let (handler, pending) = channel::<u32>();
        let completer = inflight.register(handler);
        assert_eq!(inflight.abort_all(Error::EngineNotRunning), 1);
        completer.complete(Ok(7));
        assert_eq!(pending.wait(), Err(Error::EngineNotRunning));
    }

    #[test]
    fn dropped_completer_reports_engine_not_running() {
        let inflight = Inflight::default();
        let (handler, pending) = channel::<u32>();
        drop(inflight.register(handler));
        assert_eq!(inflight.len(), 0);
        assert_eq!(pending.wait(), Err(Error::EngineNotRunning));
    }

    #[test]
    fn wait_timeout_without_result() {
        let (_handler, mut pending) = channel::<u32>();
        assert!(pending.wait_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn wait_timeout_wakes_on_a_late_result() {
        let (handler, mut pending) = channel::<u32>();
        assert!(pending.wait_timeout(Duration::from_millis(5)).is_none());
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handler(Ok(9));
        });
        assert_eq!(pending.wait_timeout(Duration::from_secs(10)), Some(Ok(9)));
        sender.join().unwrap();
    }
}
