use anyhow::Result;
use prometheus::{
    Counter, CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
};

/// Process-wide statistics sink shared by every metric producer.
///
/// All metrics use the "aggregoor" namespace and register against one
/// custom registry so an embedding process can expose them however it
/// likes. Producers receive the sink by `Arc` at construction; there is no
/// process singleton.
pub struct EngineStats {
    registry: Registry,

    /// Pull latency by pull tag.
    pub pull_delay: HistogramVec,
    /// Pulls whose latency exceeded the metric's max delay, by pull tag.
    pub pull_exceed_max_delay: CounterVec,
    /// Pulls that failed outright, by pull tag.
    pub pull_failures: CounterVec,
    /// Distinct dimension count observed above the soft limit, by metric.
    pub dimension_size: GaugeVec,
    /// Hard dimension guardrail rejections, by metric.
    pub hard_dimension_limit: CounterVec,
    /// Buckets closed, by metric.
    pub bucket_count: CounterVec,
    /// Explicit data drops, by metric.
    pub buckets_dropped: CounterVec,
    /// Events discarded because they predate the current bucket.
    pub late_events: Counter,
}

impl EngineStats {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let pull_delay = HistogramVec::new(
            HistogramOpts::new("pull_delay_seconds", "Pull latency by pull tag.")
                .namespace("aggregoor")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["tag"],
        )?;
        let pull_exceed_max_delay = CounterVec::new(
            Opts::new(
                "pull_exceed_max_delay_total",
                "Pulls discarded for exceeding the metric's max delay.",
            )
            .namespace("aggregoor"),
            &["tag"],
        )?;
        let pull_failures = CounterVec::new(
            Opts::new("pull_failures_total", "Pulls that failed outright.").namespace("aggregoor"),
            &["tag"],
        )?;
        let dimension_size = GaugeVec::new(
            Opts::new(
                "dimension_size",
                "Distinct dimension count observed above the soft limit.",
            )
            .namespace("aggregoor"),
            &["metric"],
        )?;
        let hard_dimension_limit = CounterVec::new(
            Opts::new(
                "hard_dimension_limit_total",
                "Dimension inserts rejected by the hard guardrail.",
            )
            .namespace("aggregoor"),
            &["metric"],
        )?;
        let bucket_count = CounterVec::new(
            Opts::new("bucket_count_total", "Buckets closed by flush.").namespace("aggregoor"),
            &["metric"],
        )?;
        let buckets_dropped = CounterVec::new(
            Opts::new("buckets_dropped_total", "Explicit past-bucket drops.")
                .namespace("aggregoor"),
            &["metric"],
        )?;
        let late_events = Counter::with_opts(
            Opts::new(
                "late_events_total",
                "Events discarded for predating the current bucket.",
            )
            .namespace("aggregoor"),
        )?;

        registry.register(Box::new(pull_delay.clone()))?;
        registry.register(Box::new(pull_exceed_max_delay.clone()))?;
        registry.register(Box::new(pull_failures.clone()))?;
        registry.register(Box::new(dimension_size.clone()))?;
        registry.register(Box::new(hard_dimension_limit.clone()))?;
        registry.register(Box::new(bucket_count.clone()))?;
        registry.register(Box::new(buckets_dropped.clone()))?;
        registry.register(Box::new(late_events.clone()))?;

        Ok(Self {
            registry,
            pull_delay,
            pull_exceed_max_delay,
            pull_failures,
            dimension_size,
            hard_dimension_limit,
            bucket_count,
            buckets_dropped,
            late_events,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn note_pull_delay(&self, tag_id: i32, delay_ns: i64) {
        self.pull_delay
            .with_label_values(&[&tag_id.to_string()])
            .observe(delay_ns.max(0) as f64 / 1e9);
    }

    pub fn note_pull_exceed_max_delay(&self, tag_id: i32) {
        self.pull_exceed_max_delay
            .with_label_values(&[&tag_id.to_string()])
            .inc();
    }

    pub fn note_pull_failed(&self, tag_id: i32) {
        self.pull_failures
            .with_label_values(&[&tag_id.to_string()])
            .inc();
    }

    pub fn note_metric_dimension_size(&self, metric_id: i64, size: usize) {
        self.dimension_size
            .with_label_values(&[&metric_id.to_string()])
            .set(size as f64);
    }

    pub fn note_hard_dimension_limit_reached(&self, metric_id: i64) {
        self.hard_dimension_limit
            .with_label_values(&[&metric_id.to_string()])
            .inc();
    }

    pub fn note_bucket_count(&self, metric_id: i64) {
        self.bucket_count
            .with_label_values(&[&metric_id.to_string()])
            .inc();
    }

    pub fn note_bucket_dropped(&self, metric_id: i64) {
        self.buckets_dropped
            .with_label_values(&[&metric_id.to_string()])
            .inc();
    }

    pub fn note_late_event(&self) {
        self.late_events.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = EngineStats::new().expect("build stats");
        stats.note_pull_exceed_max_delay(1001);
        stats.note_pull_exceed_max_delay(1001);
        stats.note_hard_dimension_limit_reached(42);

        assert_eq!(
            stats
                .pull_exceed_max_delay
                .with_label_values(&["1001"])
                .get(),
            2.0
        );
        assert_eq!(
            stats.hard_dimension_limit.with_label_values(&["42"]).get(),
            1.0
        );
        assert_eq!(stats.pull_failures.with_label_values(&["1001"]).get(), 0.0);
    }

    #[test]
    fn test_dimension_size_gauge_tracks_latest() {
        let stats = EngineStats::new().expect("build stats");
        stats.note_metric_dimension_size(7, 501);
        stats.note_metric_dimension_size(7, 502);
        assert_eq!(stats.dimension_size.with_label_values(&["7"]).get(), 502.0);
    }

    #[test]
    fn test_registry_gathers_all_families() {
        let stats = EngineStats::new().expect("build stats");
        stats.note_late_event();
        let families = stats.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "aggregoor_late_events_total"));
    }
}
