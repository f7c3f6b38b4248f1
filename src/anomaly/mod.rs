use std::collections::HashMap;

use crate::dimension::MetricDimensionKey;

/// External anomaly detector fed by metric producers.
///
/// Producers push two signals: a per-append detection probe when the
/// projected atom has exactly one numeric field, and a per-bucket
/// `dimension -> value` projection once a full bucket boundary is crossed.
pub trait AnomalyTracker: Send + Sync {
    fn detect_and_declare_anomaly(
        &self,
        event_time_ns: i64,
        bucket_num: i64,
        metric_id: i64,
        key: &MetricDimensionKey,
        value: i64,
    );

    fn add_past_bucket(&self, bucket: &HashMap<MetricDimensionKey, i64>, bucket_num: i64);
}
