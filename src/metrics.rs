//! Prometheus metrics for batch loader monitoring.
//!
//! Metrics are organized into three categories:
//! - **Gauges**: Point-in-time state (resolves in flight)
//! - **Counters**: Cumulative totals (batches by status, items by outcome)
//! - **Histograms**: Distributions (batch duration)
//!
//! Every metric carries a `loader` label taken from `LoaderConfig::name`.

#[cfg(feature = "metrics")]
use prometheus::{CounterVec, GaugeVec, HistogramVec, Opts, Registry};

#[cfg(feature = "metrics")]
use crate::batch::BatchSummary;
#[cfg(feature = "metrics")]
use crate::error::Result;

/// Prometheus metrics registry for batch loaders.
///
/// One instance can be shared by several loaders; they are told apart by the
/// `loader` label.
#[cfg(feature = "metrics")]
#[derive(Clone)]
pub struct LoaderMetrics {
    registry: Registry,

    // Gauges (point-in-time state)
    resolves_in_flight: GaugeVec,

    // Counters (cumulative totals)
    batches_total: CounterVec,
    items_total: CounterVec,

    // Histograms (distributions)
    batch_duration_seconds: HistogramVec,
}

#[cfg(feature = "metrics")]
impl LoaderMetrics {
    /// Create a new LoaderMetrics instance with the given registry.
    ///
    /// # Errors
    ///
    /// Returns an error if metrics fail to register (e.g., duplicate registration).
    pub fn new(registry: Registry) -> Result<Self> {
        let resolves_in_flight = GaugeVec::new(
            Opts::new(
                "mediabatch_resolves_in_flight",
                "Number of resolver calls currently running",
            ),
            &["loader"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create resolves_in_flight gauge: {}", e))?;

        let batches_total = CounterVec::new(
            Opts::new(
                "mediabatch_batches_total",
                "Total number of batches finished by status",
            ),
            &["loader", "status"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create batches_total counter: {}", e))?;

        let items_total = CounterVec::new(
            Opts::new(
                "mediabatch_items_total",
                "Total number of items in completed batches by outcome",
            ),
            &["loader", "outcome"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create items_total counter: {}", e))?;

        let batch_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "mediabatch_batch_duration_seconds",
                "Time from batch start to its final outcome in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["loader"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create batch_duration_seconds histogram: {}", e))?;

        registry
            .register(Box::new(resolves_in_flight.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register resolves_in_flight: {}", e))?;
        registry
            .register(Box::new(batches_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register batches_total: {}", e))?;
        registry
            .register(Box::new(items_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register items_total: {}", e))?;
        registry
            .register(Box::new(batch_duration_seconds.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register batch_duration_seconds: {}", e))?;

        Ok(Self {
            registry,
            resolves_in_flight,
            batches_total,
            items_total,
            batch_duration_seconds,
        })
    }

    /// Get the underlying Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn set_resolves_in_flight(&self, loader: &str, count: usize) {
        self.resolves_in_flight
            .with_label_values(&[loader])
            .set(count as f64);
    }

    /// Record a batch that delivered its items.
    ///
    /// Updates the batch counter, the per-outcome item counters and the duration histogram.
    pub fn record_batch_completed(&self, loader: &str, summary: &BatchSummary) {
        self.batches_total
            .with_label_values(&[loader, "completed"])
            .inc();
        self.items_total
            .with_label_values(&[loader, "resolved"])
            .inc_by(summary.resolved as f64);
        self.items_total
            .with_label_values(&[loader, "dropped"])
            .inc_by(summary.dropped as f64);

        let seconds = summary
            .duration()
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        self.batch_duration_seconds
            .with_label_values(&[loader])
            .observe(seconds);
    }

    pub fn record_batch_cancelled(&self, loader: &str) {
        self.batches_total
            .with_label_values(&[loader, "cancelled"])
            .inc();
    }
}
