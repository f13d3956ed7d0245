//! Resolver abstraction for turning handles into items.
//!
//! This module defines the `Resolver` trait the loader calls once per handle,
//! enabling testability with mock implementations.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

/// Trait for resolving one handle into a decoded or parsed item.
///
/// A resolver reports exactly one outcome per call. `None` means the item could
/// not be produced (not decodable, malformed record, source error); it is not an
/// error for the batch, the slot is simply left out of the output.
///
/// Implementations may be backed by network I/O, disk I/O or in-memory decode;
/// the loader does not distinguish.
///
/// # Example
/// ```ignore
/// let resolver = FnResolver::new(|path: RecordPath| async move {
///     source.observe_single(&path).await.ok().flatten()
/// });
/// let item = resolver.resolve(RecordPath::user("u1")).await;
/// ```
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    /// Opaque reference to one fetchable item.
    type Handle: Send + 'static;
    /// Result of a successful resolution.
    type Item: Send + 'static;

    /// Resolve a single handle.
    ///
    /// Must eventually return; a resolver that never completes keeps its batch
    /// from ever completing.
    async fn resolve(&self, handle: Self::Handle) -> Option<Self::Item>;
}

#[async_trait]
impl<R: Resolver> Resolver for Arc<R> {
    type Handle = R::Handle;
    type Item = R::Item;

    async fn resolve(&self, handle: Self::Handle) -> Option<Self::Item> {
        self.as_ref().resolve(handle).await
    }
}

// ============================================================================
// Closure-backed Implementation
// ============================================================================

type ResolveFn<H, T> = Arc<dyn Fn(H) -> BoxFuture<'static, Option<T>> + Send + Sync>;

/// Resolver backed by an async closure.
pub struct FnResolver<H, T> {
    resolve: ResolveFn<H, T>,
}

impl<H, T> Clone for FnResolver<H, T> {
    fn clone(&self) -> Self {
        Self {
            resolve: self.resolve.clone(),
        }
    }
}

impl<H: Send + 'static, T: Send + 'static> FnResolver<H, T> {
    pub fn new<F, Fut>(resolve: F) -> Self
    where
        F: Fn(H) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<T>> + Send + 'static,
    {
        Self {
            resolve: Arc::new(move |handle| resolve(handle).boxed()),
        }
    }
}

#[async_trait]
impl<H: Send + 'static, T: Send + 'static> Resolver for FnResolver<H, T> {
    type Handle = H;
    type Item = T;

    async fn resolve(&self, handle: H) -> Option<T> {
        (self.resolve)(handle).await
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

/// Mock resolver for testing.
///
/// Outcomes are configured per handle and consumed in FIFO order. Triggered
/// outcomes let a test decide exactly when (and so in which order) each
/// resolution completes.
///
/// # Example
/// ```ignore
/// let mock = MockResolver::new();
/// mock.add_outcome("a", Some("decoded a"));
/// let trigger = mock.add_outcome_with_trigger("b", Some("decoded b"));
/// // ... resolution of "b" is now blocked ...
/// trigger.send(()).unwrap();
/// ```
pub struct MockResolver<H, T> {
    outcomes: Arc<Mutex<HashMap<H, VecDeque<MockOutcome<T>>>>>,
    calls: Arc<Mutex<Vec<H>>>,
    in_flight: Arc<AtomicUsize>,
}

/// A scripted outcome, optionally held back until a trigger or a delay.
enum MockOutcome<T> {
    Immediate(Option<T>),
    Triggered {
        outcome: Option<T>,
        trigger: oneshot::Receiver<()>,
    },
    Delayed {
        outcome: Option<T>,
        delay: Duration,
    },
}

impl<H, T> Clone for MockResolver<H, T> {
    fn clone(&self) -> Self {
        Self {
            outcomes: self.outcomes.clone(),
            calls: self.calls.clone(),
            in_flight: self.in_flight.clone(),
        }
    }
}

impl<H, T> MockResolver<H, T>
where
    H: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn push(&self, handle: H, outcome: MockOutcome<T>) {
        self.outcomes
            .lock()
            .entry(handle)
            .or_default()
            .push_back(outcome);
    }

    /// Configure an outcome returned as soon as the handle is resolved.
    pub fn add_outcome(&self, handle: H, outcome: Option<T>) {
        self.push(handle, MockOutcome::Immediate(outcome));
    }

    /// Configure an outcome that waits for a manual trigger.
    ///
    /// Returns a sender that when triggered (by sending `()` or dropping) lets
    /// the resolution complete with the given outcome.
    pub fn add_outcome_with_trigger(&self, handle: H, outcome: Option<T>) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.push(
            handle,
            MockOutcome::Triggered {
                outcome,
                trigger: rx,
            },
        );
        tx
    }

    /// Configure an outcome returned after sleeping for `delay`.
    pub fn add_outcome_with_delay(&self, handle: H, outcome: Option<T>, delay: Duration) {
        self.push(handle, MockOutcome::Delayed { outcome, delay });
    }

    /// All handles resolved so far, in call order.
    pub fn get_calls(&self) -> Vec<H> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// How many times `handle` has been resolved.
    pub fn calls_for(&self, handle: &H) -> usize {
        self.calls.lock().iter().filter(|h| *h == handle).count()
    }

    /// Number of resolutions currently waiting on a trigger or delay.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl<H, T> Default for MockResolver<H, T>
where
    H: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<H, T> Resolver for MockResolver<H, T>
where
    H: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + 'static,
{
    type Handle = H;
    type Item = T;

    async fn resolve(&self, handle: H) -> Option<T> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        self.calls.lock().push(handle.clone());

        let scripted = self
            .outcomes
            .lock()
            .get_mut(&handle)
            .and_then(VecDeque::pop_front);

        match scripted {
            Some(MockOutcome::Immediate(outcome)) => outcome,
            Some(MockOutcome::Triggered { outcome, trigger }) => {
                // A dropped sender releases the outcome too
                let _ = trigger.await;
                outcome
            }
            Some(MockOutcome::Delayed { outcome, delay }) => {
                tokio::time::sleep(delay).await;
                outcome
            }
            // Unscripted handles resolve absent
            None => None,
        }
    }
}
