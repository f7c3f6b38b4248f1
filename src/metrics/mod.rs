pub mod gauge;

use std::collections::HashMap;

use tracing::debug;

use crate::condition::ConditionState;
use crate::config::{ActivationConfig, ActivationType};
use crate::event::LogEvent;
use crate::report::proto::ProtoWriter;

/// Maximum drop events recorded per skipped bucket.
pub const MAX_DROP_EVENTS: usize = 10;

/// The metric kinds sharing this lifecycle skeleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Event,
    Count,
    Duration,
    Gauge,
    Value,
    Kll,
}

/// Why a closed bucket was skipped instead of emitted. Codes are wire
/// values and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum BucketDropReason {
    ConditionUnknown = 1,
    PullFailed = 2,
    PullDelayed = 3,
    DimensionGuardrailReached = 4,
    MultipleBucketsSkipped = 5,
    BucketTooSmall = 6,
    NoData = 7,
    EventInWrongBucket = 8,
    ConfigUpdated = 9,
}

impl BucketDropReason {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// One event that invalidated (part of) a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropEvent {
    pub reason: BucketDropReason,
    pub drop_time_ns: i64,
}

/// A closed bucket that did not qualify for emission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkippedBucket {
    pub bucket_start_ns: i64,
    pub bucket_end_ns: i64,
    pub drop_events: Vec<DropEvent>,
}

impl SkippedBucket {
    pub fn reset(&mut self) {
        self.bucket_start_ns = 0;
        self.bucket_end_ns = 0;
        self.drop_events.clear();
    }
}

/// Lifecycle of one activation source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    NotActive,
    Active,
    ActiveOnBoot,
}

/// A TTL-bounded activation. The producer is active while any activation
/// is, so activations are ORed.
#[derive(Debug, Clone)]
pub struct Activation {
    ttl_ns: i64,
    start_ns: i64,
    state: ActivationState,
    activation_type: ActivationType,
}

impl Activation {
    pub fn state(&self) -> ActivationState {
        self.state
    }
}

/// State and behavior shared by every metric producer variant: identity,
/// bucket position arithmetic, condition state, the activation table, and
/// skipped-bucket bookkeeping. Producer variants embed this under their own
/// lock and layer their aggregation state on top.
#[derive(Debug)]
pub struct MetricCore {
    pub metric_id: i64,
    pub time_base_ns: i64,
    pub bucket_size_ns: i64,
    pub current_bucket_start_ns: i64,
    pub current_bucket_num: i64,
    pub condition: ConditionState,
    pub is_active: bool,
    activations: Vec<Activation>,
    activation_map: HashMap<usize, usize>,
    deactivation_map: HashMap<usize, Vec<usize>>,
    pub current_skipped_bucket: SkippedBucket,
    pub skipped_buckets: Vec<SkippedBucket>,
}

impl MetricCore {
    pub fn new(
        metric_id: i64,
        time_base_ns: i64,
        bucket_size_ns: i64,
        initial_condition: ConditionState,
        activation_configs: &[ActivationConfig],
    ) -> Self {
        let mut activations = Vec::with_capacity(activation_configs.len());
        let mut activation_map = HashMap::new();
        let mut deactivation_map: HashMap<usize, Vec<usize>> = HashMap::new();
        for cfg in activation_configs {
            let idx = activations.len();
            activations.push(Activation {
                ttl_ns: cfg.ttl.as_nanos() as i64,
                start_ns: 0,
                state: ActivationState::NotActive,
                activation_type: cfg.activation_type,
            });
            activation_map.insert(cfg.activation_tracker_index, idx);
            for deactivation in &cfg.deactivation_tracker_indices {
                deactivation_map.entry(*deactivation).or_default().push(idx);
            }
        }

        // A metric with no activation requirement is active from creation.
        let is_active = activations.is_empty();

        Self {
            metric_id,
            time_base_ns,
            bucket_size_ns,
            current_bucket_start_ns: time_base_ns,
            current_bucket_num: 0,
            condition: initial_condition,
            is_active,
            activations,
            activation_map,
            deactivation_map,
            current_skipped_bucket: SkippedBucket::default(),
            skipped_buckets: Vec::new(),
        }
    }

    /// End of the current bucket, always aligned to the time base.
    pub fn current_bucket_end_ns(&self) -> i64 {
        self.time_base_ns + (self.current_bucket_num + 1) * self.bucket_size_ns
    }

    /// Absolute bucket index for a full bucket's end time. Only valid when
    /// the end is an exact bucket multiple above the time base; partial
    /// buckets take the explicit start/end path instead.
    pub fn bucket_num_from_end_time_ns(&self, end_ns: i64) -> i64 {
        (end_ns - self.time_base_ns) / self.bucket_size_ns - 1
    }

    pub fn activation_state(&self, activation_tracker_index: usize) -> Option<ActivationState> {
        self.activation_map
            .get(&activation_tracker_index)
            .map(|idx| self.activations[*idx].state)
    }

    /// Fires an activation. Returns the new overall active state when it
    /// flipped. Boot-deferred activations arm without changing the overall
    /// state; a second fire while armed promotes them.
    pub fn activate(&mut self, activation_tracker_index: usize, event_time_ns: i64) -> Option<bool> {
        let idx = match self.activation_map.get(&activation_tracker_index) {
            Some(idx) => *idx,
            None => return None,
        };
        let activation = &mut self.activations[idx];
        if activation.activation_type == ActivationType::ActivateOnBoot {
            if activation.state == ActivationState::ActiveOnBoot {
                activation.start_ns = event_time_ns;
                activation.state = ActivationState::Active;
            } else {
                activation.state = ActivationState::ActiveOnBoot;
            }
            return None;
        }
        activation.start_ns = event_time_ns;
        activation.state = ActivationState::Active;
        if !self.is_active {
            self.is_active = true;
            debug!(metric_id = self.metric_id, "metric activated");
            return Some(true);
        }
        None
    }

    /// Demotes every activation the deactivation tracker references.
    /// Returns the new overall active state when it flipped.
    pub fn cancel_event_activation(&mut self, deactivation_tracker_index: usize) -> Option<bool> {
        let indices = match self.deactivation_map.get(&deactivation_tracker_index) {
            Some(indices) => indices.clone(),
            None => return None,
        };
        for idx in indices {
            self.activations[idx].state = ActivationState::NotActive;
        }
        let was_active = self.is_active;
        self.is_active = self.compute_active_state();
        if was_active != self.is_active {
            debug!(metric_id = self.metric_id, "metric deactivated");
            Some(self.is_active)
        } else {
            None
        }
    }

    fn compute_active_state(&self) -> bool {
        self.activations.is_empty()
            || self
                .activations
                .iter()
                .any(|a| a.state == ActivationState::Active)
    }

    /// Demotes expired activations. Returns the new overall active state
    /// when it flipped.
    pub fn flush_if_expire(&mut self, event_time_ns: i64) -> Option<bool> {
        if !self.is_active {
            return None;
        }
        for activation in &mut self.activations {
            if activation.state == ActivationState::Active
                && event_time_ns - activation.start_ns >= activation.ttl_ns
            {
                activation.state = ActivationState::NotActive;
            }
        }
        let still_active = self.compute_active_state();
        if !still_active {
            self.is_active = false;
            debug!(metric_id = self.metric_id, "metric activation expired");
            return Some(false);
        }
        None
    }

    /// Promotes boot-deferred activations at boot complete. Returns the new
    /// overall active state when it flipped.
    pub fn on_boot_completed(&mut self, event_time_ns: i64) -> Option<bool> {
        for activation in &mut self.activations {
            if activation.state == ActivationState::ActiveOnBoot {
                activation.start_ns = event_time_ns;
                activation.state = ActivationState::Active;
            }
        }
        let was_active = self.is_active;
        self.is_active = self.compute_active_state();
        if was_active != self.is_active {
            Some(self.is_active)
        } else {
            None
        }
    }

    pub fn max_drop_events_reached(&self) -> bool {
        self.current_skipped_bucket.drop_events.len() >= MAX_DROP_EVENTS
    }

    /// Appends a drop event to the in-flight skipped bucket unless capped.
    pub fn record_drop(&mut self, reason: BucketDropReason, drop_time_ns: i64) {
        if !self.max_drop_events_reached() {
            self.current_skipped_bucket.drop_events.push(DropEvent {
                reason,
                drop_time_ns,
            });
        }
    }
}

/// The capability surface a registry fans events out to. Every entry point
/// takes `&self` and serializes internally on the producer's own lock.
pub trait MetricProducer: Send + Sync {
    fn metric_type(&self) -> MetricType;
    fn metric_id(&self) -> i64;
    fn is_active(&self) -> bool;

    /// Consume an event that already matched the metric's "what" matcher.
    fn on_matched_log_event(&self, matcher_index: usize, event: &LogEvent);

    fn on_condition_changed(&self, condition: bool, event_time_ns: i64);
    fn on_sliced_condition_may_change(&self, overall_condition: bool, event_time_ns: i64);

    /// Serialize accumulated buckets. `include_current_partial_bucket`
    /// closes the in-flight bucket as a partial; `erase_data` clears past
    /// and skipped buckets afterwards.
    fn on_dump_report(
        &self,
        dump_time_ns: i64,
        include_current_partial_bucket: bool,
        erase_data: bool,
        out: &mut ProtoWriter,
    );

    fn clear_past_buckets(&self, dump_time_ns: i64);
    fn drop_data(&self, drop_time_ns: i64);
    fn prepare_first_bucket(&self);
    fn notify_app_upgrade(&self, event_time_ns: i64);
    fn on_boot_completed(&self, event_time_ns: i64);
    fn activate(&self, activation_tracker_index: usize, event_time_ns: i64);
    fn cancel_event_activation(&self, deactivation_tracker_index: usize);
    fn flush_if_expire(&self, event_time_ns: i64);
    fn byte_size(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn activation(tracker: usize, ttl_secs: u64, deactivations: &[usize]) -> ActivationConfig {
        ActivationConfig {
            activation_tracker_index: tracker,
            ttl: Duration::from_secs(ttl_secs),
            activation_type: ActivationType::ActivateImmediately,
            deactivation_tracker_indices: deactivations.to_vec(),
        }
    }

    fn core_with(activations: &[ActivationConfig]) -> MetricCore {
        MetricCore::new(1, 0, 10_000_000_000, ConditionState::True, activations)
    }

    #[test]
    fn test_no_activations_means_active() {
        let core = core_with(&[]);
        assert!(core.is_active);
    }

    #[test]
    fn test_bucket_arithmetic() {
        let mut core = core_with(&[]);
        assert_eq!(core.current_bucket_end_ns(), 10_000_000_000);
        core.current_bucket_num = 3;
        assert_eq!(core.current_bucket_end_ns(), 40_000_000_000);
        assert_eq!(core.bucket_num_from_end_time_ns(40_000_000_000), 3);
    }

    #[test]
    fn test_activate_and_expire() {
        let mut core = core_with(&[activation(5, 10, &[])]);
        assert!(!core.is_active);

        assert_eq!(core.activate(5, 1_000_000_000), Some(true));
        assert!(core.is_active);

        // Re-activation while active resets the TTL without a transition.
        assert_eq!(core.activate(5, 2_000_000_000), None);

        // Not yet expired.
        assert_eq!(core.flush_if_expire(11_000_000_000), None);
        assert!(core.is_active);

        // TTL reached exactly: demoted.
        assert_eq!(core.flush_if_expire(12_000_000_000), Some(false));
        assert!(!core.is_active);
    }

    #[test]
    fn test_activations_are_ored() {
        let mut core = core_with(&[activation(1, 10, &[]), activation(2, 100, &[])]);
        core.activate(1, 0);
        core.activate(2, 0);

        // First expires, second keeps the metric active.
        assert_eq!(core.flush_if_expire(50_000_000_000), None);
        assert!(core.is_active);

        assert_eq!(core.flush_if_expire(100_000_000_000), Some(false));
    }

    #[test]
    fn test_deactivation_demotes_referenced_activations() {
        let mut core = core_with(&[activation(1, 1000, &[9]), activation(2, 1000, &[9])]);
        core.activate(1, 0);
        core.activate(2, 0);
        assert!(core.is_active);

        assert_eq!(core.cancel_event_activation(9), Some(false));
        assert!(!core.is_active);
        assert_eq!(core.activation_state(1), Some(ActivationState::NotActive));
        assert_eq!(core.activation_state(2), Some(ActivationState::NotActive));

        // Unknown deactivation index is a no-op.
        assert_eq!(core.cancel_event_activation(42), None);
    }

    #[test]
    fn test_boot_deferred_activation() {
        let cfg = ActivationConfig {
            activation_tracker_index: 3,
            ttl: Duration::from_secs(60),
            activation_type: ActivationType::ActivateOnBoot,
            deactivation_tracker_indices: Vec::new(),
        };
        let mut core = core_with(&[cfg]);

        // Arming does not change the overall state.
        assert_eq!(core.activate(3, 100), None);
        assert!(!core.is_active);
        assert_eq!(core.activation_state(3), Some(ActivationState::ActiveOnBoot));

        assert_eq!(core.on_boot_completed(500), Some(true));
        assert!(core.is_active);
        assert_eq!(core.activation_state(3), Some(ActivationState::Active));
    }

    #[test]
    fn test_drop_events_capped() {
        let mut core = core_with(&[]);
        for i in 0..(MAX_DROP_EVENTS as i64 + 5) {
            core.record_drop(BucketDropReason::BucketTooSmall, i);
        }
        assert_eq!(
            core.current_skipped_bucket.drop_events.len(),
            MAX_DROP_EVENTS
        );
        assert!(core.max_drop_events_reached());
    }

    #[test]
    fn test_drop_reason_wire_codes() {
        assert_eq!(BucketDropReason::ConditionUnknown.code(), 1);
        assert_eq!(BucketDropReason::BucketTooSmall.code(), 6);
        assert_eq!(BucketDropReason::EventInWrongBucket.code(), 8);
        assert_eq!(BucketDropReason::ConfigUpdated.code(), 9);
    }
}
