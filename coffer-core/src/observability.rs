/*!
Observability for the Coffer snapshot repository.

- Structured logging through `tracing`, installed with [`init_observability`]
- Prometheus metrics for object store calls and retention (feature `metrics`)
*/

#[cfg(feature = "metrics")]
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Instant;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{CofferError, Result};

/// Log filter applied on top of `RUST_LOG` when none is given
pub const DEFAULT_LOG_FILTER: &str = "coffer=info";

#[cfg(feature = "metrics")]
static METRICS: OnceLock<CofferMetrics> = OnceLock::new();

/// Metrics for object store traffic and retention
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct CofferMetrics {
    pub s3_requests_total: CounterVec,
    pub s3_errors_total: CounterVec,
    pub s3_latency_seconds: HistogramVec,
    pub snapshots_pruned_total: IntCounter,
    registry: Registry,
}

#[cfg(feature = "metrics")]
impl CofferMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();
        let metric_error =
            |name: &str, e: prometheus::Error| CofferError::storage(format!("Failed to set up {name} metric: {e}"));

        let s3_requests_total = CounterVec::new(
            Opts::new("coffer_s3_requests_total", "Total object store requests made by Coffer"),
            &["operation"],
        )
        .map_err(|e| metric_error("s3_requests_total", e))?;

        let s3_errors_total = CounterVec::new(
            Opts::new("coffer_s3_errors_total", "Total failed object store requests"),
            &["operation"],
        )
        .map_err(|e| metric_error("s3_errors_total", e))?;

        let s3_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "coffer_s3_latency_seconds",
                "Duration of object store operations in seconds",
            ),
            &["operation"],
        )
        .map_err(|e| metric_error("s3_latency_seconds", e))?;

        let snapshots_pruned_total = IntCounter::new(
            "coffer_snapshots_pruned_total",
            "Snapshots removed by the retention policy",
        )
        .map_err(|e| metric_error("snapshots_pruned_total", e))?;

        registry
            .register(Box::new(s3_requests_total.clone()))
            .map_err(|e| metric_error("s3_requests_total", e))?;
        registry
            .register(Box::new(s3_errors_total.clone()))
            .map_err(|e| metric_error("s3_errors_total", e))?;
        registry
            .register(Box::new(s3_latency_seconds.clone()))
            .map_err(|e| metric_error("s3_latency_seconds", e))?;
        registry
            .register(Box::new(snapshots_pruned_total.clone()))
            .map_err(|e| metric_error("snapshots_pruned_total", e))?;

        Ok(Self {
            s3_requests_total,
            s3_errors_total,
            s3_latency_seconds,
            snapshots_pruned_total,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> &'static CofferMetrics {
        METRICS.get_or_init(|| Self::new().expect("Failed to initialize Coffer metrics"))
    }

    pub fn record_request(&self, operation: &str) {
        self.s3_requests_total.with_label_values(&[operation]).inc();
    }

    pub fn record_error(&self, operation: &str) {
        self.s3_errors_total.with_label_values(&[operation]).inc();
    }

    pub fn record_latency(&self, operation: &str, duration: std::time::Duration) {
        self.s3_latency_seconds
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    pub fn record_pruned(&self) {
        self.snapshots_pruned_total.inc();
    }

    /// Gather metrics in the Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| CofferError::storage(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| CofferError::storage(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Measures one object store operation
#[cfg(feature = "metrics")]
pub struct MetricsTimer {
    start: Instant,
    operation: &'static str,
}

#[cfg(feature = "metrics")]
impl MetricsTimer {
    /// Count a request and start timing it
    pub fn start(operation: &'static str) -> Self {
        CofferMetrics::global().record_request(operation);
        Self {
            start: Instant::now(),
            operation,
        }
    }

    pub fn finish(self) {
        CofferMetrics::global().record_latency(self.operation, self.start.elapsed());
    }

    pub fn finish_with_error(self) {
        let metrics = CofferMetrics::global();
        metrics.record_latency(self.operation, self.start.elapsed());
        metrics.record_error(self.operation);
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` is honored; `default_filter` (or [`DEFAULT_LOG_FILTER`]) is
/// added on top of it. With `json` set, events are emitted as one JSON
/// object per line.
pub fn init_observability(json: bool, default_filter: Option<&str>) -> Result<()> {
    #[cfg(feature = "metrics")]
    CofferMetrics::global();

    let directive = default_filter.unwrap_or(DEFAULT_LOG_FILTER);
    let filter = EnvFilter::from_default_env().add_directive(
        directive
            .parse()
            .map_err(|e| CofferError::configuration(format!("Invalid log filter '{directive}': {e}")))?,
    );
    let registry = TracingRegistry::default().with(filter);

    let installed = if json {
        set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .with_current_span(false),
            ),
        )
    } else {
        set_global_default(registry.with(tracing_subscriber::fmt::layer().with_target(false)))
    };
    installed.map_err(|e| {
        CofferError::configuration(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("Coffer observability initialized");
    Ok(())
}

/// Initialize observability with human-readable logs at the default level
pub fn init_default_observability() -> Result<()> {
    init_observability(false, None)
}
