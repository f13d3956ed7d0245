//! Batch loader for resolving ordered handle lists with a single completion.
//!
//! Each call to [`BatchLoader::load_batch`] owns its own batch state. Every
//! handle is resolved on its own Tokio task; outcomes land in slots indexed by
//! input position, and the completion callback runs once, on whichever task
//! reports the final outcome.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchId, BatchSummary};
use crate::error::{MediaBatchError, Result};
use crate::resolver::Resolver;

pub mod state;

use state::{BatchControl, BatchState, Progress};

/// Configuration for a batch loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Label used in logs and metrics (e.g. "photos", "posts")
    pub name: String,

    /// Largest batch accepted by `load_batch`; larger batches are rejected
    /// before any resolution starts
    pub max_batch_size: usize,

    /// Maximum number of resolver calls running at once across all batches
    /// of this loader
    pub max_concurrent_resolves: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_batch_size: 100,
            max_concurrent_resolves: 10,
        }
    }
}

impl LoaderConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(MediaBatchError::InvalidConfig(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_resolves == 0 {
            return Err(MediaBatchError::InvalidConfig(
                "max_concurrent_resolves must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cumulative statistics for a loader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoaderStats {
    pub batches_started: u64,
    pub batches_completed: u64,
    pub batches_cancelled: u64,
    /// Items delivered to completion callbacks
    pub items_resolved: u64,
    /// Items that resolved absent in completed batches
    pub items_dropped: u64,
    pub resolves_in_flight: usize,
}

#[derive(Default)]
struct Counters {
    batches_started: AtomicU64,
    batches_completed: AtomicU64,
    batches_cancelled: AtomicU64,
    items_resolved: AtomicU64,
    items_dropped: AtomicU64,
    resolves_in_flight: AtomicUsize,
}

/// Handle to a running batch, used to identify or cancel it.
#[derive(Debug, Clone)]
pub struct BatchHandle {
    id: BatchId,
    len: usize,
    control: Arc<BatchControl>,
}

impl BatchHandle {
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Number of handles submitted with the batch.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stop the batch from completing.
    ///
    /// The completion callback will not run. Resolutions already in flight
    /// finish and their results are discarded; queued ones are skipped. Has no
    /// effect once the final outcome has been recorded.
    ///
    /// Returns true if this call cancelled the batch.
    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }
}

/// Loader that resolves batches of handles into ordered item lists.
///
/// The resolver is shared by every batch. Batches share nothing else apart
/// from the concurrency limit, so concurrent batches never interfere with each
/// other's ordering or completion.
pub struct BatchLoader<R: Resolver> {
    resolver: Arc<R>,
    config: LoaderConfig,
    name: Arc<str>,
    semaphore: Arc<Semaphore>,
    /// Map of batch_id -> cancellation control for batches still in flight
    active_batches: Arc<DashMap<BatchId, Arc<BatchControl>>>,
    counters: Arc<Counters>,
    shutdown_token: CancellationToken,
    #[cfg(feature = "metrics")]
    metrics: Option<crate::metrics::LoaderMetrics>,
}

impl<R: Resolver> Clone for BatchLoader<R> {
    fn clone(&self) -> Self {
        Self {
            resolver: self.resolver.clone(),
            config: self.config.clone(),
            name: self.name.clone(),
            semaphore: self.semaphore.clone(),
            active_batches: self.active_batches.clone(),
            counters: self.counters.clone(),
            shutdown_token: self.shutdown_token.clone(),
            #[cfg(feature = "metrics")]
            metrics: self.metrics.clone(),
        }
    }
}

impl<R: Resolver> BatchLoader<R> {
    /// Create a new loader around `resolver`.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the configuration has a zero limit.
    pub fn new(resolver: Arc<R>, config: LoaderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            resolver,
            name: Arc::from(config.name.as_str()),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_resolves)),
            config,
            active_batches: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
            shutdown_token: CancellationToken::new(),
            #[cfg(feature = "metrics")]
            metrics: None,
        })
    }

    /// Tie this loader to an external shutdown token.
    ///
    /// Cancelling the token has the same effect as [`BatchLoader::shutdown`].
    pub fn with_shutdown_token(mut self, shutdown_token: CancellationToken) -> Self {
        self.shutdown_token = shutdown_token;
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: crate::metrics::LoaderMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<R> {
        &self.resolver
    }

    /// Start resolving `handles` and call `on_complete` once every handle has
    /// reported an outcome.
    ///
    /// `on_complete` receives the resolved items in input order; handles that
    /// resolved absent are left out. An empty batch calls `on_complete` with an
    /// empty list synchronously, before this function returns, without touching
    /// the resolver.
    ///
    /// A resolver that never returns for some handle keeps the batch from ever
    /// completing; callers that need a deadline must impose their own.
    ///
    /// # Errors
    /// - `InvalidBatchSize` if `handles` exceeds `max_batch_size`
    /// - `Shutdown` if the loader has been shut down
    /// - `Other` if called outside a Tokio runtime
    ///
    /// No resolution has started when an error is returned.
    pub fn load_batch<F>(&self, handles: Vec<R::Handle>, on_complete: F) -> Result<BatchHandle>
    where
        F: FnOnce(Vec<R::Item>) + Send + 'static,
    {
        let total = handles.len();
        if total > self.config.max_batch_size {
            tracing::warn!(
                loader = %self.name,
                size = total,
                limit = self.config.max_batch_size,
                "Rejecting oversized batch"
            );
            return Err(MediaBatchError::InvalidBatchSize {
                size: total,
                limit: self.config.max_batch_size,
            });
        }
        if self.shutdown_token.is_cancelled() {
            return Err(MediaBatchError::Shutdown);
        }

        let batch_id = BatchId::new();
        let token = self.shutdown_token.child_token();

        if total == 0 {
            self.counters.batches_started.fetch_add(1, Ordering::Relaxed);
            self.counters
                .batches_completed
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(loader = %self.name, batch_id = %batch_id, "Empty batch, completing immediately");
            on_complete(Vec::new());
            return Ok(BatchHandle {
                id: batch_id,
                len: 0,
                control: Arc::new(BatchControl::fired(token)),
            });
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow::anyhow!("Batch loading requires a Tokio runtime: {}", e))?;

        let control = Arc::new(BatchControl::new(token));
        let batch = BatchHandle {
            id: batch_id,
            len: total,
            control: control.clone(),
        };

        let task = BatchTask {
            batch_id,
            name: self.name.clone(),
            resolver: self.resolver.clone(),
            semaphore: self.semaphore.clone(),
            control: control.clone(),
            state: Arc::new(BatchState::new(total, on_complete, control.clone())),
            active_batches: self.active_batches.clone(),
            counters: self.counters.clone(),
            started_at: Utc::now(),
            #[cfg(feature = "metrics")]
            metrics: self.metrics.clone(),
        };

        self.active_batches.insert(batch_id, control);
        self.counters.batches_started.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(loader = %self.name, batch_id = %batch_id, total, "Starting batch");

        for (index, handle) in handles.into_iter().enumerate() {
            runtime.spawn(task.clone().run(index, handle));
        }

        Ok(batch)
    }

    /// Resolve `handles` and wait for the ordered result.
    ///
    /// Dropping the returned future cancels the batch.
    ///
    /// # Errors
    /// Same as [`BatchLoader::load_batch`], plus `BatchCancelled` if the batch is
    /// cancelled and `Shutdown` if the loader shuts down before it completes.
    #[tracing::instrument(skip_all, fields(loader = %self.name, batch_size = handles.len()))]
    pub async fn load(&self, handles: Vec<R::Handle>) -> Result<Vec<R::Item>> {
        let (tx, rx) = oneshot::channel();
        let batch = self.load_batch(handles, move |items| {
            // Receiver may be gone if the caller stopped waiting
            let _ = tx.send(items);
        })?;

        let cancel_on_drop = batch.control.token().clone().drop_guard();
        let result = rx.await;
        let _ = cancel_on_drop.disarm();

        match result {
            Ok(items) => Ok(items),
            Err(_) if self.shutdown_token.is_cancelled() => Err(MediaBatchError::Shutdown),
            Err(_) => Err(MediaBatchError::BatchCancelled(batch.id())),
        }
    }

    /// Resolve any number of handles, splitting them into batches no larger
    /// than `max_batch_size`.
    ///
    /// The batches run concurrently and their results are concatenated in
    /// input order. If any batch fails the remaining ones are dropped, which
    /// cancels them.
    ///
    /// # Errors
    /// Same as [`BatchLoader::load`].
    pub async fn load_chunked(&self, mut handles: Vec<R::Handle>) -> Result<Vec<R::Item>> {
        let chunk_size = self.config.max_batch_size;
        if handles.len() <= chunk_size {
            return self.load(handles).await;
        }

        let mut chunks = Vec::with_capacity(handles.len().div_ceil(chunk_size));
        while !handles.is_empty() {
            let rest = handles.split_off(chunk_size.min(handles.len()));
            chunks.push(std::mem::replace(&mut handles, rest));
        }
        tracing::debug!(loader = %self.name, chunks = chunks.len(), "Splitting oversized load");

        let results = try_join_all(chunks.into_iter().map(|chunk| self.load(chunk))).await?;
        Ok(results.into_iter().flatten().collect())
    }

    /// Cancel a running batch by id.
    ///
    /// Returns false if no such batch is active or its final outcome has
    /// already been recorded.
    pub fn cancel(&self, batch_id: BatchId) -> bool {
        let Some((_, control)) = self.active_batches.remove(&batch_id) else {
            return false;
        };
        if !control.cancel() {
            return false;
        }
        tracing::info!(loader = %self.name, batch_id = %batch_id, "Batch cancelled");
        true
    }

    /// Cancel every active batch and reject new ones.
    pub fn shutdown(&self) {
        tracing::info!(
            loader = %self.name,
            active_batches = self.active_batches(),
            "Shutting down batch loader"
        );
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Number of batches that have not yet completed or been cancelled.
    pub fn active_batches(&self) -> usize {
        self.active_batches
            .iter()
            .filter(|entry| entry.value().is_running())
            .count()
    }

    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            batches_started: self.counters.batches_started.load(Ordering::Relaxed),
            batches_completed: self.counters.batches_completed.load(Ordering::Relaxed),
            batches_cancelled: self.counters.batches_cancelled.load(Ordering::Relaxed),
            items_resolved: self.counters.items_resolved.load(Ordering::Relaxed),
            items_dropped: self.counters.items_dropped.load(Ordering::Relaxed),
            resolves_in_flight: self.counters.resolves_in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Everything one resolution task needs, cloned once per handle.
struct BatchTask<R: Resolver, F> {
    batch_id: BatchId,
    name: Arc<str>,
    resolver: Arc<R>,
    semaphore: Arc<Semaphore>,
    control: Arc<BatchControl>,
    state: Arc<BatchState<R::Item, F>>,
    active_batches: Arc<DashMap<BatchId, Arc<BatchControl>>>,
    counters: Arc<Counters>,
    started_at: DateTime<Utc>,
    #[cfg(feature = "metrics")]
    metrics: Option<crate::metrics::LoaderMetrics>,
}

impl<R: Resolver, F> Clone for BatchTask<R, F> {
    fn clone(&self) -> Self {
        Self {
            batch_id: self.batch_id,
            name: self.name.clone(),
            resolver: self.resolver.clone(),
            semaphore: self.semaphore.clone(),
            control: self.control.clone(),
            state: self.state.clone(),
            active_batches: self.active_batches.clone(),
            counters: self.counters.clone(),
            started_at: self.started_at,
            #[cfg(feature = "metrics")]
            metrics: self.metrics.clone(),
        }
    }
}

impl<R, F> BatchTask<R, F>
where
    R: Resolver,
    F: FnOnce(Vec<R::Item>) + Send + 'static,
{
    async fn run(self, index: usize, handle: R::Handle) {
        let permit = tokio::select! {
            biased;
            _ = self.control.token().cancelled() => None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
        };

        let outcome = match permit {
            Some(_permit) => self.resolve_in_flight(handle).await,
            None => {
                tracing::trace!(batch_id = %self.batch_id, index, "Skipping resolve for cancelled batch");
                None
            }
        };

        self.report(index, outcome);
    }

    async fn resolve_in_flight(&self, handle: R::Handle) -> Option<R::Item> {
        let in_flight = self.counters.resolves_in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.record_in_flight(in_flight);

        let counters = self.counters.clone();
        #[cfg(feature = "metrics")]
        let metrics = self.metrics.clone();
        #[cfg(feature = "metrics")]
        let name = self.name.clone();
        let _guard = scopeguard::guard((), move |_| {
            let _in_flight = counters.resolves_in_flight.fetch_sub(1, Ordering::Relaxed) - 1;
            #[cfg(feature = "metrics")]
            if let Some(metrics) = &metrics {
                metrics.set_resolves_in_flight(&name, _in_flight);
            }
        });

        self.resolver.resolve(handle).await
    }

    #[cfg(feature = "metrics")]
    fn record_in_flight(&self, count: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_resolves_in_flight(&self.name, count);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_in_flight(&self, _count: usize) {}

    fn report(&self, index: usize, outcome: Option<R::Item>) {
        let present = outcome.is_some();
        let (completion, fires) = match self.state.record(index, outcome) {
            Progress::Pending { completed, total } => {
                tracing::trace!(
                    batch_id = %self.batch_id,
                    index,
                    present,
                    completed,
                    total,
                    "Recorded outcome"
                );
                return;
            }
            Progress::Ignored => {
                tracing::warn!(batch_id = %self.batch_id, index, "Ignoring duplicate outcome");
                return;
            }
            Progress::Complete(completion) => (completion, true),
            Progress::Discarded(completion) => (completion, false),
        };

        self.active_batches.remove(&self.batch_id);

        let summary = BatchSummary {
            id: self.batch_id,
            total: self.state.total(),
            resolved: completion.resolved,
            dropped: completion.dropped,
            started_at: self.started_at,
            completed_at: Utc::now(),
        };

        if !fires {
            self.counters
                .batches_cancelled
                .fetch_add(1, Ordering::Relaxed);
            #[cfg(feature = "metrics")]
            if let Some(metrics) = &self.metrics {
                metrics.record_batch_cancelled(&self.name);
            }
            tracing::info!(
                loader = %self.name,
                batch_id = %self.batch_id,
                discarded = summary.resolved,
                "Batch cancelled, discarding results"
            );
            // The callback is dropped unfired
            drop(completion);
            return;
        }

        self.counters
            .batches_completed
            .fetch_add(1, Ordering::Relaxed);
        self.counters
            .items_resolved
            .fetch_add(summary.resolved as u64, Ordering::Relaxed);
        self.counters
            .items_dropped
            .fetch_add(summary.dropped as u64, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_batch_completed(&self.name, &summary);
        }

        tracing::debug!(
            loader = %self.name,
            batch_id = %self.batch_id,
            total = summary.total,
            resolved = summary.resolved,
            dropped = summary.dropped,
            duration_ms = summary.duration().num_milliseconds(),
            "Batch completed"
        );

        completion.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{FnResolver, MockResolver};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn loader<R: Resolver>(resolver: R) -> BatchLoader<R> {
        BatchLoader::new(Arc::new(resolver), LoaderConfig::named("test")).unwrap()
    }

    /// Start a batch whose completions are forwarded to a channel.
    fn start<R: Resolver>(
        loader: &BatchLoader<R>,
        handles: Vec<R::Handle>,
    ) -> (BatchHandle, mpsc::UnboundedReceiver<Vec<R::Item>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let batch = loader
            .load_batch(handles, move |items| {
                tx.send(items).unwrap();
            })
            .unwrap();
        (batch, rx)
    }

    /// Spawn `loader.load(handles)` from a generic context, which sidesteps a
    /// rustc higher-ranked lifetime limitation with borrowed handle types.
    fn spawn_load<R: Resolver>(
        loader: BatchLoader<R>,
        handles: Vec<R::Handle>,
    ) -> tokio::task::JoinHandle<Result<Vec<R::Item>>> {
        tokio::spawn(async move { loader.load(handles).await })
    }

    async fn next_completion<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("batch did not complete in time")
            .expect("completion callback dropped without firing")
    }

    #[test_log::test(tokio::test)]
    async fn test_output_follows_input_order_not_completion_order() {
        let mock = MockResolver::new();
        let trigger_a = mock.add_outcome_with_trigger("A", Some("a"));
        let trigger_b = mock.add_outcome_with_trigger("B", Some("b"));
        let trigger_c = mock.add_outcome_with_trigger("C", Some("c"));
        let loader = loader(mock.clone());

        let (_batch, mut rx) = start(&loader, vec!["A", "B", "C"]);

        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger_c.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger_a.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err(), "completion fired before last outcome");
        trigger_b.send(()).unwrap();

        assert_eq!(next_completion(&mut rx).await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_every_completion_order_yields_input_order() {
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for order in orders {
            let mock = MockResolver::new();
            let mut triggers: Vec<_> = [1u32, 2, 3]
                .into_iter()
                .map(|h| Some(mock.add_outcome_with_trigger(h, Some(h * 100))))
                .collect();
            let loader = loader(mock);

            let (_batch, mut rx) = start(&loader, vec![1, 2, 3]);
            tokio::time::sleep(Duration::from_millis(5)).await;
            for position in order {
                triggers[position].take().unwrap().send(()).unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }

            assert_eq!(
                next_completion(&mut rx).await,
                vec![100, 200, 300],
                "completion order {order:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_absent_outcome_is_omitted_but_counted() {
        let mock = MockResolver::new();
        mock.add_outcome("A", Some("a"));
        let trigger_b = mock.add_outcome_with_trigger("B", None);
        mock.add_outcome("C", Some("c"));
        let loader = loader(mock);

        let (_batch, mut rx) = start(&loader, vec!["A", "B", "C"]);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err(), "fired while B was still outstanding");
        trigger_b.send(()).unwrap();

        let items = next_completion(&mut rx).await;
        assert_eq!(items, vec!["a", "c"]);
        assert_eq!(items.len(), 2);

        let stats = loader.stats();
        assert_eq!(stats.items_resolved, 2);
        assert_eq!(stats.items_dropped, 1);
    }

    #[tokio::test]
    async fn test_all_absent_completes_with_empty_list() {
        let mock: MockResolver<&str, &str> = MockResolver::new();
        let loader = loader(mock);

        let (_batch, mut rx) = start(&loader, vec!["x", "y"]);
        assert!(next_completion(&mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_completes_synchronously() {
        let mock: MockResolver<&str, &str> = MockResolver::new();
        let loader = loader(mock.clone());

        let (tx, rx) = std::sync::mpsc::channel();
        let batch = loader
            .load_batch(Vec::new(), move |items| tx.send(items).unwrap())
            .unwrap();

        // Already delivered before load_batch returned
        assert_eq!(rx.try_recv().unwrap(), Vec::<&str>::new());
        assert!(batch.is_empty());
        assert_eq!(mock.call_count(), 0);
        assert_eq!(loader.stats().batches_completed, 1);
    }

    #[test]
    fn test_empty_batch_needs_no_runtime() {
        let mock: MockResolver<&str, &str> = MockResolver::new();
        let loader = loader(mock);

        let (tx, rx) = std::sync::mpsc::channel();
        loader
            .load_batch(Vec::new(), move |items| tx.send(items.len()).unwrap())
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), 0);
    }

    #[test]
    fn test_non_empty_batch_outside_runtime_is_rejected() {
        let mock: MockResolver<&str, &str> = MockResolver::new();
        let loader = loader(mock.clone());

        let result = loader.load_batch(vec!["a"], |_| panic!("must not complete"));
        assert!(matches!(result, Err(MediaBatchError::Other(_))));
        assert_eq!(mock.call_count(), 0);
        assert_eq!(loader.active_batches(), 0);
    }

    #[tokio::test]
    async fn test_resolver_called_exactly_once_per_handle() {
        let mock = MockResolver::new();
        for h in 0..25u32 {
            mock.add_outcome_with_delay(h, Some(h), Duration::from_millis(u64::from(h % 5)));
        }
        let loader = loader(mock.clone());

        let items = loader.load((0..25).collect()).await.unwrap();

        assert_eq!(items, (0..25).collect::<Vec<_>>());
        assert_eq!(mock.call_count(), 25);
        for h in 0..25u32 {
            assert_eq!(mock.calls_for(&h), 1, "handle {h}");
        }
    }

    #[tokio::test]
    async fn test_oversized_batch_is_rejected_before_resolving() {
        let mock: MockResolver<u32, u32> = MockResolver::new();
        let loader = BatchLoader::new(
            Arc::new(mock.clone()),
            LoaderConfig {
                max_batch_size: 3,
                ..LoaderConfig::named("small")
            },
        )
        .unwrap();

        let result = loader.load_batch(vec![1, 2, 3, 4], |_| panic!("must not complete"));

        assert!(matches!(
            result,
            Err(MediaBatchError::InvalidBatchSize { size: 4, limit: 3 })
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mock.call_count(), 0);
        assert_eq!(loader.stats().batches_started, 0);
    }

    #[test]
    fn test_zero_limits_are_invalid_config() {
        let mock: MockResolver<u32, u32> = MockResolver::new();
        let result = BatchLoader::new(
            Arc::new(mock),
            LoaderConfig {
                max_concurrent_resolves: 0,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(MediaBatchError::InvalidConfig(_))));

        assert!(
            LoaderConfig {
                max_batch_size: 0,
                ..Default::default()
            }
            .validate()
            .is_err()
        );
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let mock = MockResolver::new();
        let mut triggers = Vec::new();
        for h in 0..6u32 {
            triggers.push(mock.add_outcome_with_trigger(h, Some(h)));
        }
        let loader = BatchLoader::new(
            Arc::new(mock.clone()),
            LoaderConfig {
                max_concurrent_resolves: 2,
                ..LoaderConfig::named("narrow")
            },
        )
        .unwrap();

        let (_batch, mut rx) = start(&loader, (0..6).collect());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mock.in_flight_count(), 2);
        assert_eq!(loader.stats().resolves_in_flight, 2);

        drop(triggers);
        assert_eq!(next_completion(&mut rx).await, (0..6).collect::<Vec<_>>());
        assert_eq!(mock.call_count(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_simultaneous_completions_fire_once() {
        for _ in 0..20 {
            let mock = MockResolver::new();
            let triggers: Vec<_> = (0..32u32)
                .map(|h| mock.add_outcome_with_trigger(h, (h % 3 != 0).then_some(h)))
                .collect();
            let loader = BatchLoader::new(
                Arc::new(mock.clone()),
                LoaderConfig {
                    max_concurrent_resolves: 32,
                    ..LoaderConfig::named("race")
                },
            )
            .unwrap();

            let fired = Arc::new(AtomicUsize::new(0));
            let (tx, mut rx) = mpsc::unbounded_channel();
            let fired_clone = fired.clone();
            loader
                .load_batch((0..32).collect(), move |items| {
                    fired_clone.fetch_add(1, Ordering::SeqCst);
                    tx.send(items).unwrap();
                })
                .unwrap();

            while mock.in_flight_count() < 32 {
                tokio::task::yield_now().await;
            }
            // Release every resolution at once
            drop(triggers);

            let items = next_completion(&mut rx).await;
            let expected: Vec<u32> = (0..32).filter(|h| h % 3 != 0).collect();
            assert_eq!(items, expected);

            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert_eq!(mock.call_count(), 32);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_batches_do_not_interfere() {
        let resolver = FnResolver::new(|(batch, index): (u64, u64)| async move {
            tokio::time::sleep(Duration::from_millis((batch * 7 + index * 13) % 11)).await;
            Some(batch * 1000 + index)
        });
        let loader = BatchLoader::new(
            Arc::new(resolver),
            LoaderConfig {
                max_concurrent_resolves: 16,
                ..LoaderConfig::named("many")
            },
        )
        .unwrap();

        let mut tasks = Vec::new();
        for batch in 0..10u64 {
            let loader = loader.clone();
            tasks.push(tokio::spawn(async move {
                let handles = (0..20u64).map(|index| (batch, index)).collect();
                (batch, loader.load(handles).await.unwrap())
            }));
        }

        for task in tasks {
            let (batch, items) = task.await.unwrap();
            let expected: Vec<u64> = (0..20).map(|index| batch * 1000 + index).collect();
            assert_eq!(items, expected);
        }

        let stats = loader.stats();
        assert_eq!(stats.batches_started, 10);
        assert_eq!(stats.batches_completed, 10);
        assert_eq!(stats.items_resolved, 200);
        assert_eq!(stats.resolves_in_flight, 0);
        assert_eq!(loader.active_batches(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_batch_never_fires() {
        let mock = MockResolver::new();
        let trigger_a = mock.add_outcome_with_trigger("A", Some("a"));
        mock.add_outcome("B", Some("b"));
        let loader = loader(mock.clone());

        let (batch, mut rx) = start(&loader, vec!["A", "B"]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(loader.active_batches(), 1);

        batch.cancel();
        assert!(batch.is_cancelled());
        assert_eq!(loader.active_batches(), 0);
        trigger_a.send(()).unwrap();

        // The callback is dropped without being called
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(received.is_none());
        assert_eq!(loader.stats().batches_cancelled, 1);
        assert_eq!(loader.stats().batches_completed, 0);
    }

    #[tokio::test]
    async fn test_cancel_skips_queued_resolutions() {
        let mock = MockResolver::new();
        let trigger = mock.add_outcome_with_trigger(0u32, Some(0u32));
        for h in 1..5u32 {
            mock.add_outcome(h, Some(h));
        }
        let loader = BatchLoader::new(
            Arc::new(mock.clone()),
            LoaderConfig {
                max_concurrent_resolves: 1,
                ..LoaderConfig::named("serial")
            },
        )
        .unwrap();

        let (batch, mut rx) = start(&loader, (0..5).collect());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(loader.cancel(batch.id()));
        assert!(!loader.cancel(batch.id()));
        trigger.send(()).unwrap();

        assert!(rx.recv().await.is_none());
        assert_eq!(mock.get_calls(), vec![0]);
    }

    #[tokio::test]
    async fn test_load_reports_cancellation() {
        let mock = MockResolver::new();
        let trigger = mock.add_outcome_with_trigger("A", Some("a"));
        let loader = loader(mock);

        let loader_clone = loader.clone();
        let waiting = spawn_load(loader_clone, vec!["A"]);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let batch_id = *loader.active_batches.iter().next().unwrap().key();
        loader.cancel(batch_id);
        trigger.send(()).unwrap();

        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(MediaBatchError::BatchCancelled(id)) if id == batch_id));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_batches_and_cancels_running_ones() {
        let mock = MockResolver::new();
        let trigger = mock.add_outcome_with_trigger("A", Some("a"));
        let loader = loader(mock);

        let loader_clone = loader.clone();
        let waiting = spawn_load(loader_clone, vec!["A"]);
        tokio::time::sleep(Duration::from_millis(10)).await;

        loader.shutdown();
        assert!(loader.is_shutdown());
        trigger.send(()).unwrap();

        assert!(matches!(
            waiting.await.unwrap(),
            Err(MediaBatchError::Shutdown)
        ));
        assert!(matches!(
            loader.load_batch(vec!["B"], |_| {}),
            Err(MediaBatchError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_dropping_load_future_cancels_batch() {
        let mock = MockResolver::new();
        let trigger = mock.add_outcome_with_trigger(0u32, Some(0u32));
        mock.add_outcome(1, Some(1));
        let loader = BatchLoader::new(
            Arc::new(mock.clone()),
            LoaderConfig {
                max_concurrent_resolves: 1,
                ..LoaderConfig::named("dropped")
            },
        )
        .unwrap();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), loader.load(vec![0, 1])).await;
        assert!(timed_out.is_err());
        trigger.send(()).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mock.get_calls(), vec![0]);
        assert_eq!(loader.stats().batches_cancelled, 1);
    }

    #[tokio::test]
    async fn test_cancel_after_completion_has_no_effect() {
        let mock = MockResolver::new();
        mock.add_outcome("A", Some("a"));
        let loader = loader(mock);

        let (batch, mut rx) = start(&loader, vec!["A"]);
        assert_eq!(next_completion(&mut rx).await, vec!["a"]);

        assert!(!batch.cancel());
        assert!(!loader.cancel(batch.id()));
        loader.shutdown();
        assert!(!batch.is_cancelled());

        let stats = loader.stats();
        assert_eq!(stats.batches_completed, 1);
        assert_eq!(stats.batches_cancelled, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_racing_final_outcome_is_decided_once() {
        let loader = loader(FnResolver::new(|n: u32| async move { Some(n) }));

        for round in 0..200 {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let batch = loader
                .load_batch(vec![1, 2], move |items| {
                    tx.send(items).unwrap();
                })
                .unwrap();
            let cancelled = loader.cancel(batch.id());

            // None means the callback was dropped unfired
            let delivered = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("batch never settled");
            assert_eq!(delivered.is_some(), !cancelled, "round {round}");
            assert_eq!(batch.is_cancelled(), cancelled, "round {round}");
        }

        let stats = loader.stats();
        assert_eq!(stats.batches_completed + stats.batches_cancelled, 200);
        assert_eq!(loader.active_batches(), 0);
    }

    #[cfg(feature = "metrics")]
    fn counter_value(registry: &prometheus::Registry, name: &str, label: &str, value: &str) -> f64 {
        registry
            .gather()
            .iter()
            .find(|f| f.get_name() == name)
            .and_then(|family| {
                family.get_metric().iter().find(|m| {
                    m.get_label()
                        .iter()
                        .any(|l| l.get_name() == label && l.get_value() == value)
                })
            })
            .map(|m| m.get_counter().get_value())
            .unwrap_or_default()
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn test_loader_reports_to_metrics() {
        let registry = prometheus::Registry::new();
        let metrics = crate::metrics::LoaderMetrics::new(registry.clone()).unwrap();

        let mock = MockResolver::new();
        mock.add_outcome("A", Some("a"));
        // "B" is unscripted and resolves absent
        let trigger = mock.add_outcome_with_trigger("C", Some("c"));
        let loader = loader(mock.clone()).with_metrics(metrics);

        assert_eq!(loader.load(vec!["A", "B"]).await.unwrap(), vec!["a"]);

        let (batch, mut rx) = start(&loader, vec!["C"]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mock.in_flight_count(), 1);
        assert!(batch.cancel());
        trigger.send(()).unwrap();
        assert!(rx.recv().await.is_none());

        assert_eq!(counter_value(&registry, "mediabatch_batches_total", "status", "completed"), 1.0);
        assert_eq!(counter_value(&registry, "mediabatch_batches_total", "status", "cancelled"), 1.0);
        assert_eq!(counter_value(&registry, "mediabatch_items_total", "outcome", "resolved"), 1.0);
        assert_eq!(counter_value(&registry, "mediabatch_items_total", "outcome", "dropped"), 1.0);

        let in_flight = registry
            .gather()
            .into_iter()
            .find(|f| f.get_name() == "mediabatch_resolves_in_flight")
            .expect("resolves_in_flight metric not found");
        assert_eq!(in_flight.get_metric()[0].get_gauge().get_value(), 0.0);
    }

    #[tokio::test]
    async fn test_load_chunked_splits_oversized_input() {
        let loader = BatchLoader::new(
            Arc::new(FnResolver::new(|n: u32| async move { (n % 7 != 0).then_some(n) })),
            LoaderConfig {
                max_batch_size: 10,
                ..LoaderConfig::named("chunked")
            },
        )
        .unwrap();

        let items = loader.load_chunked((1..=35).collect()).await.unwrap();
        let expected: Vec<u32> = (1..=35).filter(|n| n % 7 != 0).collect();
        assert_eq!(items, expected);
        assert_eq!(loader.stats().batches_completed, 4);

        assert!(loader.load_chunked(Vec::new()).await.unwrap().is_empty());
    }
}
