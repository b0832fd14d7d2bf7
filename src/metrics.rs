use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for admission decisions
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    decisions: CounterVec,
    store_errors: CounterVec,
    fail_open: CounterVec,
    decision_duration: HistogramVec,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let decisions = CounterVec::new(
            Opts::new(
                "ratelimit_decisions_total",
                "Admission decisions by algorithm and outcome",
            ),
            &["algorithm", "outcome"],
        )?;

        let store_errors = CounterVec::new(
            Opts::new(
                "ratelimit_store_errors_total",
                "Decisions that failed because of the shared store",
            ),
            &["algorithm"],
        )?;

        let fail_open = CounterVec::new(
            Opts::new(
                "ratelimit_fail_open_total",
                "Requests admitted without a decision after an error",
            ),
            &["algorithm"],
        )?;

        let decision_duration = HistogramVec::new(
            HistogramOpts::new(
                "ratelimit_decision_duration_seconds",
                "Duration of admission decisions in seconds",
            ),
            &["algorithm"],
        )?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;
        registry.register(Box::new(fail_open.clone()))?;
        registry.register(Box::new(decision_duration.clone()))?;

        Ok(Self {
            registry,
            decisions,
            store_errors,
            fail_open,
            decision_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_decision(&self, algorithm: &str, allowed: bool) {
        let outcome = if allowed { "allowed" } else { "rejected" };
        self.decisions.with_label_values(&[algorithm, outcome]).inc();
    }

    pub fn record_store_error(&self, algorithm: &str) {
        self.store_errors.with_label_values(&[algorithm]).inc();
    }

    pub fn record_fail_open(&self, algorithm: &str) {
        self.fail_open.with_label_values(&[algorithm]).inc();
    }

    /// Timer observing decision latency when dropped
    pub fn start_decision_timer(&self, algorithm: &str) -> prometheus::HistogramTimer {
        self.decision_duration
            .with_label_values(&[algorithm])
            .start_timer()
    }

    /// Render all metrics in the text exposition format
    pub fn render(&self) -> prometheus::Result<String> {
        prometheus::TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
