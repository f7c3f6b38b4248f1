use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};
use xxhash_rust::xxh64::xxh64;

use crate::anomaly::AnomalyTracker;
use crate::clock::ElapsedClock;
use crate::condition::{
    dimension_for_condition, CompiledConditionLink, ConditionKey, ConditionState, ConditionWizard,
};
use crate::config::{GaugeMetricConfig, GaugeSamplingType, InvalidConfigReason, NO_TAG};
use crate::dimension::{AtomDimensionKey, HashableDimensionKey, MetricDimensionKey};
use crate::event::{FieldValue, LogEvent};
use crate::matcher::{
    filter_gauge_values, filter_values, should_use_nested_dimensions, translate_field_selector,
    FieldSelector, MatchResult, Matcher, MatcherWizard,
};
use crate::metrics::{BucketDropReason, MetricCore, MetricProducer, MetricType};
use crate::puller::{PullDataReceiver, PullerManager, PullResult};
use crate::report::proto::ProtoWriter;
use crate::report::{
    nanos_to_millis, write_dimension, write_dimension_leaf_nodes, write_dimension_path,
    write_field_value_tree, FIELD_ID_AGGREGATED_ATOM, FIELD_ID_ATOM_TIMESTAMPS,
    FIELD_ID_ATOM_VALUE, FIELD_ID_BUCKET_DROP_REASON, FIELD_ID_BUCKET_INFO, FIELD_ID_BUCKET_NUM,
    FIELD_ID_BUCKET_SIZE, FIELD_ID_DATA, FIELD_ID_DIMENSION_GUARDRAIL_HIT,
    FIELD_ID_DIMENSION_IN_WHAT, FIELD_ID_DIMENSION_LEAF_IN_WHAT, FIELD_ID_DIMENSION_PATH_IN_WHAT,
    FIELD_ID_DROP_TIME, FIELD_ID_END_BUCKET_ELAPSED_MILLIS, FIELD_ID_GAUGE_METRICS, FIELD_ID_ID,
    FIELD_ID_IS_ACTIVE, FIELD_ID_SKIPPED, FIELD_ID_SKIPPED_DROP_EVENT,
    FIELD_ID_SKIPPED_END_MILLIS, FIELD_ID_SKIPPED_START_MILLIS,
    FIELD_ID_START_BUCKET_ELAPSED_MILLIS, FIELD_ID_TIME_BASE,
};
use crate::stats::EngineStats;

/// Shared collaborators handed to producers at construction.
#[derive(Clone)]
pub struct ProducerContext {
    pub matcher_wizard: Arc<dyn MatcherWizard>,
    pub condition_wizard: Arc<dyn ConditionWizard>,
    pub puller: Arc<dyn PullerManager>,
    pub stats: Arc<EngineStats>,
    pub clock: Arc<dyn ElapsedClock>,
}

/// One sampled atom snapshot: the projected fields plus the (possibly
/// truncated) observation timestamp.
#[derive(Debug, Clone)]
pub struct GaugeAtom {
    pub fields: Vec<FieldValue>,
    pub elapsed_timestamp_ns: i64,
}

/// A closed bucket for one dimension. Identical atom snapshots are folded
/// into one entry holding the observation timestamps, first appearance
/// first.
#[derive(Debug, Clone)]
pub struct GaugeBucket {
    pub bucket_start_ns: i64,
    pub bucket_end_ns: i64,
    pub aggregated_atoms: Vec<(AtomDimensionKey, Vec<i64>)>,
}

struct GaugeState {
    core: MetricCore,
    what_matcher_index: usize,
    condition_tracker_index: Option<usize>,
    matcher_wizard: Arc<dyn MatcherWizard>,
    condition_wizard: Arc<dyn ConditionWizard>,
    current_sliced_bucket: HashMap<MetricDimensionKey, Vec<GaugeAtom>>,
    current_bucket_for_anomaly: HashMap<MetricDimensionKey, i64>,
    past_buckets: HashMap<MetricDimensionKey, Vec<GaugeBucket>>,
    dimension_guardrail_hit: bool,
    // Log-once latch per bucket.
    has_hit_guardrail: bool,
    anomaly_trackers: Vec<Arc<dyn AnomalyTracker>>,
}

/// Re-indexing payload for a config update. The producer and its
/// activations are preserved across the update; only the tracker indices
/// and wizards change.
pub struct GaugeConfigUpdate {
    pub what_matcher_index: usize,
    pub condition_tracker_index: Option<usize>,
    pub matcher_wizard: Arc<dyn MatcherWizard>,
    pub condition_wizard: Arc<dyn ConditionWizard>,
}

/// Gauge metric producer: collects sampled atom snapshots per dimension per
/// bucket, combining push-triggered and pull-triggered acquisition under
/// per-dimension caps and dimension-count guardrails.
pub struct GaugeMetricProducer {
    metric_id: i64,
    atom_id: i32,
    pull_tag_id: i32,
    trigger_atom_id: i32,
    is_pulled: bool,
    sampling_type: GaugeSamplingType,
    sampling_percentage: u32,
    max_pull_delay_ns: i64,
    min_bucket_size_ns: i64,
    dimension_soft_limit: usize,
    dimension_hard_limit: usize,
    atoms_per_dimension_limit: usize,
    split_bucket_for_app_upgrade: bool,
    truncate_timestamps: bool,
    field_matchers: Vec<Matcher>,
    dimensions_in_what: Vec<Matcher>,
    dimensions_selector: Option<FieldSelector>,
    nested_dimensions: bool,
    links: Vec<CompiledConditionLink>,
    condition_sliced: bool,
    puller: Arc<dyn PullerManager>,
    stats: Arc<EngineStats>,
    clock: Arc<dyn ElapsedClock>,
    state: Mutex<GaugeState>,
}

impl GaugeMetricProducer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &GaugeMetricConfig,
        ctx: ProducerContext,
        what_matcher_index: usize,
        condition_tracker_index: Option<usize>,
        initial_condition: ConditionState,
        time_base_ns: i64,
        start_time_ns: i64,
    ) -> Result<Arc<Self>, InvalidConfigReason> {
        config.validate()?;

        let bucket_size_ns = config.bucket_size_millis_guardrailed() * 1_000_000;
        let field_matchers = config
            .gauge_fields
            .as_ref()
            .map(translate_field_selector)
            .unwrap_or_default();
        let dimensions_in_what = config
            .dimensions_in_what
            .as_ref()
            .map(translate_field_selector)
            .unwrap_or_default();
        let nested_dimensions = config
            .dimensions_in_what
            .as_ref()
            .map(should_use_nested_dimensions)
            .unwrap_or(false);
        let links: Vec<CompiledConditionLink> = config
            .links
            .iter()
            .map(CompiledConditionLink::compile)
            .collect();
        let condition_sliced = !links.is_empty();

        let core = MetricCore::new(
            config.id,
            time_base_ns,
            bucket_size_ns,
            initial_condition,
            &config.activations,
        );

        let producer = Arc::new(Self {
            metric_id: config.id,
            atom_id: config.atom_id,
            pull_tag_id: config.pull_tag_id,
            trigger_atom_id: config.trigger_atom_id,
            is_pulled: config.is_pulled(),
            sampling_type: config.sampling_type,
            sampling_percentage: config.sampling_percentage,
            max_pull_delay_ns: config.max_pull_delay.as_nanos() as i64,
            min_bucket_size_ns: config.min_bucket_size.as_nanos() as i64,
            dimension_soft_limit: config.dimension_soft_limit,
            dimension_hard_limit: config.dimension_hard_limit,
            atoms_per_dimension_limit: config.max_gauge_atoms_per_dimension,
            split_bucket_for_app_upgrade: config.split_bucket_for_app_upgrade,
            truncate_timestamps: config.truncate_timestamps,
            field_matchers,
            dimensions_in_what,
            dimensions_selector: config.dimensions_in_what.clone(),
            nested_dimensions,
            links,
            condition_sliced,
            puller: ctx.puller,
            stats: ctx.stats,
            clock: ctx.clock,
            state: Mutex::new(GaugeState {
                core,
                what_matcher_index,
                condition_tracker_index,
                matcher_wizard: ctx.matcher_wizard,
                condition_wizard: ctx.condition_wizard,
                current_sliced_bucket: HashMap::new(),
                current_bucket_for_anomaly: HashMap::new(),
                past_buckets: HashMap::new(),
                dimension_guardrail_hit: false,
                has_hit_guardrail: false,
                anomaly_trackers: Vec::new(),
            }),
        });

        // Advance to the window containing the start time, then begin a
        // partial first bucket exactly at the start time.
        let next_pull_ns = {
            let mut state = producer.state.lock();
            producer.flush_if_needed_locked(&mut state, start_time_ns);
            let next_pull_ns = state.core.current_bucket_end_ns();
            state.core.current_bucket_start_ns = start_time_ns;
            next_pull_ns
        };

        if producer.is_pulled && producer.is_random_n_samples() {
            let receiver: Arc<dyn PullDataReceiver> = producer.clone();
            producer.puller.register_receiver(
                producer.pull_tag_id,
                Arc::downgrade(&receiver),
                next_pull_ns,
                bucket_size_ns,
            );
        }

        debug!(
            metric_id = producer.metric_id,
            bucket_size_ns,
            time_base_ns,
            sliced = producer.condition_sliced,
            "gauge metric created"
        );

        Ok(producer)
    }

    /// Scheduled pulls apply to random-one sampling and to untriggered
    /// first-N sampling.
    fn is_random_n_samples(&self) -> bool {
        (self.trigger_atom_id == NO_TAG && self.sampling_type == GaugeSamplingType::FirstNSamples)
            || self.sampling_type == GaugeSamplingType::RandomOneSample
    }

    /// Re-indexes into new tracker tables after a config update. The caller
    /// has already forced a partial bucket; pull metrics refill it.
    pub fn on_config_updated(
        &self,
        config: &GaugeMetricConfig,
        update: GaugeConfigUpdate,
    ) -> Result<(), InvalidConfigReason> {
        config.validate()?;
        let mut state = self.state.lock();
        state.what_matcher_index = update.what_matcher_index;
        state.condition_tracker_index = update.condition_tracker_index;
        state.matcher_wizard = update.matcher_wizard;
        state.condition_wizard = update.condition_wizard;

        if state.core.condition.is_true()
            && state.core.is_active
            && self.is_pulled
            && self.is_random_n_samples()
        {
            let bucket_start_ns = state.core.current_bucket_start_ns;
            self.pull_and_match_events_locked(&mut state, bucket_start_ns);
        }
        Ok(())
    }

    pub fn add_anomaly_tracker(&self, tracker: Arc<dyn AnomalyTracker>) {
        self.state.lock().anomaly_trackers.push(tracker);
    }

    /// Test and telemetry hook: the current bucket's dimension count.
    pub fn current_dimension_count(&self) -> usize {
        self.state.lock().current_sliced_bucket.len()
    }

    pub fn current_bucket_num(&self) -> i64 {
        self.state.lock().core.current_bucket_num
    }

    pub fn current_bucket_start_ns(&self) -> i64 {
        self.state.lock().core.current_bucket_start_ns
    }

    // --- Locked internals ---

    fn flush_locked(&self, state: &mut GaugeState, event_time_ns: i64) {
        self.flush_if_needed_locked(state, event_time_ns);
        self.flush_current_bucket_locked(state, event_time_ns, event_time_ns);
    }

    fn flush_if_needed_locked(&self, state: &mut GaugeState, event_time_ns: i64) {
        let current_bucket_end_ns = state.core.current_bucket_end_ns();
        if event_time_ns < current_bucket_end_ns {
            return;
        }

        // The last crossed boundary becomes the next bucket's start.
        let num_buckets_forward =
            1 + (event_time_ns - current_bucket_end_ns) / state.core.bucket_size_ns;
        let next_bucket_start_ns =
            current_bucket_end_ns + (num_buckets_forward - 1) * state.core.bucket_size_ns;
        self.flush_current_bucket_locked(state, event_time_ns, next_bucket_start_ns);

        state.core.current_bucket_num += num_buckets_forward;
        debug!(
            metric_id = self.metric_id,
            bucket_start = state.core.current_bucket_start_ns,
            "gauge bucket advanced"
        );
    }

    fn flush_current_bucket_locked(
        &self,
        state: &mut GaugeState,
        event_time_ns: i64,
        next_bucket_start_ns: i64,
    ) {
        let full_bucket_end_ns = state.core.current_bucket_end_ns();
        let bucket_end_time = event_time_ns.min(full_bucket_end_ns);
        let bucket_start_ns = state.core.current_bucket_start_ns;

        let sliced = std::mem::take(&mut state.current_sliced_bucket);

        if bucket_end_time - bucket_start_ns >= self.min_bucket_size_ns {
            for (dimension, atoms) in &sliced {
                let mut aggregated: Vec<(AtomDimensionKey, Vec<i64>)> = Vec::new();
                for atom in atoms {
                    let key = AtomDimensionKey::new(
                        self.atom_id,
                        HashableDimensionKey::new(atom.fields.clone()),
                    );
                    match aggregated.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, timestamps)) => timestamps.push(atom.elapsed_timestamp_ns),
                        None => aggregated.push((key, vec![atom.elapsed_timestamp_ns])),
                    }
                }
                state
                    .past_buckets
                    .entry(dimension.clone())
                    .or_default()
                    .push(GaugeBucket {
                        bucket_start_ns,
                        bucket_end_ns: bucket_end_time,
                        aggregated_atoms: aggregated,
                    });
            }
        } else if state.core.is_active {
            state.core.current_skipped_bucket.bucket_start_ns = bucket_start_ns;
            state.core.current_skipped_bucket.bucket_end_ns = bucket_end_time;
            state
                .core
                .record_drop(BucketDropReason::BucketTooSmall, event_time_ns);
            let skipped = state.core.current_skipped_bucket.clone();
            state.core.skipped_buckets.push(skipped);
        }

        if !state.anomaly_trackers.is_empty() {
            for (dimension, atoms) in &sliced {
                let Some(first) = atoms.first() else {
                    continue;
                };
                let value = first
                    .fields
                    .first()
                    .and_then(|f| f.value.as_long())
                    .unwrap_or(0);
                state
                    .current_bucket_for_anomaly
                    .insert(dimension.clone(), value);
            }
            if event_time_ns > full_bucket_end_ns {
                // A full boundary was crossed; ship the projection.
                for tracker in &state.anomaly_trackers {
                    tracker.add_past_bucket(
                        &state.current_bucket_for_anomaly,
                        state.core.current_bucket_num,
                    );
                }
                state.current_bucket_for_anomaly.clear();
            }
        }

        self.stats.note_bucket_count(self.metric_id);
        state.core.current_bucket_start_ns = next_bucket_start_ns;
        state.core.current_skipped_bucket.reset();
        state.has_hit_guardrail = false;
    }

    /// Whether inserting `new_key` into the current bucket would lose data.
    fn hit_guardrail_locked(&self, state: &mut GaugeState, new_key: &MetricDimensionKey) -> bool {
        if state.current_sliced_bucket.contains_key(new_key) {
            return false;
        }
        if state.current_sliced_bucket.len() >= self.dimension_soft_limit {
            let new_tuple_count = state.current_sliced_bucket.len() + 1;
            self.stats
                .note_metric_dimension_size(self.metric_id, new_tuple_count);
            if new_tuple_count > self.dimension_hard_limit {
                if !state.has_hit_guardrail {
                    error!(
                        metric_id = self.metric_id,
                        "gauge metric dropping data for new dimension"
                    );
                    state.has_hit_guardrail = true;
                }
                state.dimension_guardrail_hit = true;
                self.stats.note_hard_dimension_limit_reached(self.metric_id);
                return true;
            }
        }
        false
    }

    /// Deterministic per-event keep decision for push-mode sampling.
    fn should_keep_random_sample(&self, event: &LogEvent) -> bool {
        let mut seed = [0u8; 12];
        seed[..8].copy_from_slice(&event.elapsed_timestamp_ns().to_le_bytes());
        seed[8..].copy_from_slice(&event.atom_id().to_le_bytes());
        xxh64(&seed, 0) % 100 < u64::from(self.sampling_percentage)
    }

    fn truncate_timestamp(&self, state: &GaugeState, event_time_ns: i64) -> i64 {
        if self.truncate_timestamps {
            event_time_ns - event_time_ns % state.core.bucket_size_ns
        } else {
            event_time_ns
        }
    }

    /// Projects the event into the gauge snapshot fields, dropping fields
    /// that already travel on the dimension key.
    fn gauge_fields_for(&self, event: &LogEvent) -> Vec<FieldValue> {
        let mut fields = if self.field_matchers.is_empty() {
            event.values().to_vec()
        } else {
            filter_gauge_values(&self.field_matchers, event.values())
        };
        fields.retain(|fv| !self.dimensions_in_what.iter().any(|m| m.matches(&fv.path)));
        fields
    }

    /// Gated pull: consult the sampling mode, fetch, enforce the max-delay
    /// contract, then run every returned atom through the usual match and
    /// append path stamped with the pull time.
    ///
    /// Callers guarantee condition == true and the metric is active.
    fn pull_and_match_events_locked(&self, state: &mut GaugeState, timestamp_ns: i64) {
        let trigger_puller = match self.sampling_type {
            // One atom per bucket: never re-pull into a non-empty bucket.
            GaugeSamplingType::RandomOneSample => state.current_sliced_bucket.is_empty(),
            GaugeSamplingType::ConditionChangeToTrue | GaugeSamplingType::FirstNSamples => true,
        };
        if !trigger_puller {
            return;
        }

        let all_data = match self.puller.pull(self.pull_tag_id, timestamp_ns) {
            Some(data) => data,
            None => {
                error!(
                    tag = self.pull_tag_id,
                    timestamp_ns, "gauge puller failed"
                );
                self.stats.note_pull_failed(self.pull_tag_id);
                return;
            }
        };

        let pull_delay_ns = self.clock.now_ns() - timestamp_ns;
        self.stats.note_pull_delay(self.pull_tag_id, pull_delay_ns);
        if pull_delay_ns > self.max_pull_delay_ns {
            error!(tag = self.pull_tag_id, "pull finished too late");
            self.stats.note_pull_exceed_max_delay(self.pull_tag_id);
            return;
        }

        let what_matcher_index = state.what_matcher_index;
        let wizard = state.matcher_wizard.clone();
        for data in all_data {
            let verdict = wizard.match_log_event(&data, what_matcher_index);
            if let MatchResult::Matched(transformed) = verdict {
                let mut local = transformed.unwrap_or(data);
                local.set_elapsed_timestamp_ns(timestamp_ns);
                self.on_matched_log_event_locked(state, what_matcher_index, &local);
            }
        }
    }

    /// Shared pre-processing: activity gate, condition resolution (sliced
    /// or overall), and dimension extraction.
    fn on_matched_log_event_locked(
        &self,
        state: &mut GaugeState,
        matcher_index: usize,
        event: &LogEvent,
    ) {
        if !state.core.is_active {
            return;
        }

        let (condition, condition_key) = if self.condition_sliced {
            let mut key = ConditionKey::new();
            for link in &self.links {
                key.insert(
                    link.condition_id,
                    dimension_for_condition(event.values(), link),
                );
            }
            let condition_index = state.condition_tracker_index.unwrap_or_default();
            let condition_state = state.condition_wizard.query(condition_index, &key, true);
            (condition_state.is_true(), key)
        } else {
            (state.core.condition.is_true(), ConditionKey::new())
        };

        let dimension_in_what =
            filter_values(&self.dimensions_in_what, event.values()).unwrap_or_default();
        let event_key = MetricDimensionKey::new(
            HashableDimensionKey::new(dimension_in_what),
            HashableDimensionKey::default(),
        );

        self.on_matched_log_event_internal_locked(
            state,
            matcher_index,
            &event_key,
            &condition_key,
            condition,
            event,
        );
    }

    fn on_matched_log_event_internal_locked(
        &self,
        state: &mut GaugeState,
        _matcher_index: usize,
        event_key: &MetricDimensionKey,
        _condition_key: &ConditionKey,
        condition: bool,
        event: &LogEvent,
    ) {
        if !condition {
            return;
        }

        if self.pull_tag_id == NO_TAG
            && self.sampling_percentage < 100
            && !self.should_keep_random_sample(event)
        {
            return;
        }

        let event_time_ns = event.elapsed_timestamp_ns();
        if event_time_ns < state.core.current_bucket_start_ns {
            debug!(
                event_time_ns,
                bucket_start = state.core.current_bucket_start_ns,
                "gauge skipping late event"
            );
            self.stats.note_late_event();
            return;
        }
        self.flush_if_needed_locked(state, event_time_ns);

        if self.trigger_atom_id == event.atom_id() {
            // The trigger is not itself a sample; active and condition were
            // checked on the way in.
            self.pull_and_match_events_locked(state, event_time_ns);
            return;
        }

        if self.sampling_type == GaugeSamplingType::RandomOneSample
            && state.current_sliced_bucket.contains_key(event_key)
        {
            return;
        }
        if self.hit_guardrail_locked(state, event_key) {
            return;
        }

        let fields = self.gauge_fields_for(event);
        let anomaly_value = if fields.len() == 1 {
            fields[0].value.as_long()
        } else {
            None
        };
        let truncated_ts = self.truncate_timestamp(state, event_time_ns);

        {
            let atoms = state
                .current_sliced_bucket
                .entry(event_key.clone())
                .or_default();
            if atoms.len() >= self.atoms_per_dimension_limit {
                return;
            }
            atoms.push(GaugeAtom {
                fields,
                elapsed_timestamp_ns: truncated_ts,
            });
        }

        // Anomaly detection only works with a single numeric field.
        if let Some(value) = anomaly_value {
            for tracker in &state.anomaly_trackers {
                tracker.detect_and_declare_anomaly(
                    event_time_ns,
                    state.core.current_bucket_num,
                    self.metric_id,
                    event_key,
                    value,
                );
            }
        }
    }

    fn on_active_state_changed_locked(
        &self,
        state: &mut GaugeState,
        event_time_ns: i64,
        is_active: bool,
    ) {
        if !is_active {
            self.flush_locked(state, event_time_ns);
        }

        if !state.core.condition.is_true() {
            return;
        }

        if is_active && self.is_pulled && self.is_random_n_samples() {
            self.pull_and_match_events_locked(state, event_time_ns);
        }
    }

    fn on_dump_report_locked(
        &self,
        state: &mut GaugeState,
        dump_time_ns: i64,
        include_current_partial_bucket: bool,
        erase_data: bool,
        out: &mut ProtoWriter,
    ) {
        if include_current_partial_bucket {
            self.flush_locked(state, dump_time_ns);
        } else {
            self.flush_if_needed_locked(state, dump_time_ns);
        }

        out.write_int64(FIELD_ID_ID, self.metric_id);
        out.write_bool(FIELD_ID_IS_ACTIVE, state.core.is_active);

        if state.past_buckets.is_empty() && state.core.skipped_buckets.is_empty() {
            return;
        }

        if state.dimension_guardrail_hit {
            out.write_bool(FIELD_ID_DIMENSION_GUARDRAIL_HIT, true);
        }

        out.write_int64(FIELD_ID_TIME_BASE, state.core.time_base_ns);
        out.write_int64(FIELD_ID_BUCKET_SIZE, state.core.bucket_size_ns);

        // The shared dimension path applies only when no slice runs over a
        // repeated field or ALL position.
        if !self.nested_dimensions {
            if let Some(selector) = &self.dimensions_selector {
                let token = out.begin_nested(FIELD_ID_DIMENSION_PATH_IN_WHAT);
                write_dimension_path(selector, out);
                out.end_nested(token);
            }
        }

        let wrapper = out.begin_nested(FIELD_ID_GAUGE_METRICS);

        for skipped in &state.core.skipped_buckets {
            let token = out.begin_nested(FIELD_ID_SKIPPED);
            out.write_int64(
                FIELD_ID_SKIPPED_START_MILLIS,
                nanos_to_millis(skipped.bucket_start_ns),
            );
            out.write_int64(
                FIELD_ID_SKIPPED_END_MILLIS,
                nanos_to_millis(skipped.bucket_end_ns),
            );
            for drop_event in &skipped.drop_events {
                let drop_token = out.begin_nested(FIELD_ID_SKIPPED_DROP_EVENT);
                out.write_int32(FIELD_ID_BUCKET_DROP_REASON, drop_event.reason.code());
                out.write_int64(FIELD_ID_DROP_TIME, nanos_to_millis(drop_event.drop_time_ns));
                out.end_nested(drop_token);
            }
            out.end_nested(token);
        }

        for (dimension_key, buckets) in &state.past_buckets {
            let data_token = out.begin_nested(FIELD_ID_DATA);

            if self.nested_dimensions {
                let dim_token = out.begin_nested(FIELD_ID_DIMENSION_IN_WHAT);
                write_dimension(dimension_key.dimension_key_in_what(), out);
                out.end_nested(dim_token);
            } else {
                write_dimension_leaf_nodes(
                    dimension_key.dimension_key_in_what(),
                    FIELD_ID_DIMENSION_LEAF_IN_WHAT,
                    out,
                );
            }

            for bucket in buckets {
                let bucket_token = out.begin_nested(FIELD_ID_BUCKET_INFO);

                if bucket.bucket_end_ns - bucket.bucket_start_ns != state.core.bucket_size_ns {
                    out.write_int64(
                        FIELD_ID_START_BUCKET_ELAPSED_MILLIS,
                        nanos_to_millis(bucket.bucket_start_ns),
                    );
                    out.write_int64(
                        FIELD_ID_END_BUCKET_ELAPSED_MILLIS,
                        nanos_to_millis(bucket.bucket_end_ns),
                    );
                } else {
                    out.write_int64(
                        FIELD_ID_BUCKET_NUM,
                        state.core.bucket_num_from_end_time_ns(bucket.bucket_end_ns),
                    );
                }

                for (atom_key, timestamps) in &bucket.aggregated_atoms {
                    let aggregated_token = out.begin_nested(FIELD_ID_AGGREGATED_ATOM);
                    let atom_token = out.begin_nested(FIELD_ID_ATOM_VALUE);
                    write_field_value_tree(
                        self.atom_id,
                        atom_key.atom_field_values().values(),
                        out,
                    );
                    out.end_nested(atom_token);
                    for ts in timestamps {
                        out.write_int64(FIELD_ID_ATOM_TIMESTAMPS, *ts);
                    }
                    out.end_nested(aggregated_token);
                }

                out.end_nested(bucket_token);
            }

            out.end_nested(data_token);
        }

        out.end_nested(wrapper);

        if erase_data {
            state.past_buckets.clear();
            state.core.skipped_buckets.clear();
            state.dimension_guardrail_hit = false;
        }
    }
}

impl MetricProducer for GaugeMetricProducer {
    fn metric_type(&self) -> MetricType {
        MetricType::Gauge
    }

    fn metric_id(&self) -> i64 {
        self.metric_id
    }

    fn is_active(&self) -> bool {
        self.state.lock().core.is_active
    }

    fn on_matched_log_event(&self, matcher_index: usize, event: &LogEvent) {
        let mut state = self.state.lock();
        self.on_matched_log_event_locked(&mut state, matcher_index, event);
    }

    fn on_condition_changed(&self, condition: bool, event_time_ns: i64) {
        let mut state = self.state.lock();
        state.core.condition = ConditionState::from(condition);
        if !state.core.is_active {
            return;
        }

        self.flush_if_needed_locked(&mut state, event_time_ns);
        if condition
            && self.is_pulled
            && (self.is_random_n_samples()
                || self.sampling_type == GaugeSamplingType::ConditionChangeToTrue)
        {
            self.pull_and_match_events_locked(&mut state, event_time_ns);
        }
        // Push mode needs no proactive pull.
    }

    fn on_sliced_condition_may_change(&self, overall_condition: bool, event_time_ns: i64) {
        let mut state = self.state.lock();
        state.core.condition = ConditionState::from(overall_condition);
        if !state.core.is_active {
            return;
        }

        self.flush_if_needed_locked(&mut state, event_time_ns);
        // A sliced condition is overall-true when any slice is true; pull
        // for every dimension. Trigger metrics pull only on their trigger
        // atom.
        if overall_condition && self.is_pulled && self.trigger_atom_id == NO_TAG {
            self.pull_and_match_events_locked(&mut state, event_time_ns);
        }
    }

    fn on_dump_report(
        &self,
        dump_time_ns: i64,
        include_current_partial_bucket: bool,
        erase_data: bool,
        out: &mut ProtoWriter,
    ) {
        let mut state = self.state.lock();
        self.on_dump_report_locked(
            &mut state,
            dump_time_ns,
            include_current_partial_bucket,
            erase_data,
            out,
        );
    }

    fn clear_past_buckets(&self, dump_time_ns: i64) {
        let mut state = self.state.lock();
        self.flush_if_needed_locked(&mut state, dump_time_ns);
        state.past_buckets.clear();
        state.core.skipped_buckets.clear();
    }

    fn drop_data(&self, drop_time_ns: i64) {
        let mut state = self.state.lock();
        self.flush_if_needed_locked(&mut state, drop_time_ns);
        self.stats.note_bucket_dropped(self.metric_id);
        state.past_buckets.clear();
    }

    fn prepare_first_bucket(&self) {
        let mut state = self.state.lock();
        if state.core.condition.is_true()
            && state.core.is_active
            && self.is_pulled
            && self.is_random_n_samples()
        {
            let bucket_start_ns = state.core.current_bucket_start_ns;
            self.pull_and_match_events_locked(&mut state, bucket_start_ns);
        }
    }

    fn notify_app_upgrade(&self, event_time_ns: i64) {
        if !self.split_bucket_for_app_upgrade {
            return;
        }
        let mut state = self.state.lock();
        self.flush_locked(&mut state, event_time_ns);
    }

    fn on_boot_completed(&self, event_time_ns: i64) {
        let mut state = self.state.lock();
        self.flush_locked(&mut state, event_time_ns);
        if let Some(new_active) = state.core.on_boot_completed(event_time_ns) {
            self.on_active_state_changed_locked(&mut state, event_time_ns, new_active);
        }
    }

    fn activate(&self, activation_tracker_index: usize, event_time_ns: i64) {
        let mut state = self.state.lock();
        if let Some(new_active) = state.core.activate(activation_tracker_index, event_time_ns) {
            self.on_active_state_changed_locked(&mut state, event_time_ns, new_active);
        }
    }

    fn cancel_event_activation(&self, deactivation_tracker_index: usize) {
        let mut state = self.state.lock();
        if let Some(new_active) = state.core.cancel_event_activation(deactivation_tracker_index) {
            let event_time_ns = self.clock.now_ns();
            self.on_active_state_changed_locked(&mut state, event_time_ns, new_active);
        }
    }

    fn flush_if_expire(&self, event_time_ns: i64) {
        let mut state = self.state.lock();
        if let Some(new_active) = state.core.flush_if_expire(event_time_ns) {
            self.on_active_state_changed_locked(&mut state, event_time_ns, new_active);
        }
    }

    fn byte_size(&self) -> usize {
        let state = self.state.lock();
        let mut total = 0;
        for buckets in state.past_buckets.values() {
            for bucket in buckets {
                for (atom_key, timestamps) in &bucket.aggregated_atoms {
                    total += std::mem::size_of::<FieldValue>()
                        * atom_key.atom_field_values().values().len();
                    total += std::mem::size_of::<i64>() * timestamps.len();
                }
            }
        }
        total
    }
}

impl PullDataReceiver for GaugeMetricProducer {
    fn on_data_pulled(&self, data: Vec<LogEvent>, result: PullResult, original_pull_time_ns: i64) {
        let mut state = self.state.lock();
        if result != PullResult::Success || data.is_empty() {
            return;
        }
        let pull_delay_ns = self.clock.now_ns() - original_pull_time_ns;
        self.stats.note_pull_delay(self.pull_tag_id, pull_delay_ns);
        if pull_delay_ns > self.max_pull_delay_ns {
            error!(tag = self.pull_tag_id, "pull delivery too late");
            self.stats.note_pull_exceed_max_delay(self.pull_tag_id);
            return;
        }
        let what_matcher_index = state.what_matcher_index;
        let wizard = state.matcher_wizard.clone();
        for event in data {
            let verdict = wizard.match_log_event(&event, what_matcher_index);
            if let MatchResult::Matched(transformed) = verdict {
                let local = transformed.unwrap_or(event);
                self.on_matched_log_event_locked(&mut state, what_matcher_index, &local);
            }
        }
    }
}

impl Drop for GaugeMetricProducer {
    fn drop(&mut self) {
        if self.is_pulled && self.is_random_n_samples() {
            self.puller.unregister_receiver(self.pull_tag_id);
        }
    }
}

#[cfg(test)]
impl GaugeMetricProducer {
    pub(crate) fn past_buckets_snapshot(&self) -> HashMap<MetricDimensionKey, Vec<GaugeBucket>> {
        self.state.lock().past_buckets.clone()
    }

    pub(crate) fn skipped_buckets_snapshot(&self) -> Vec<crate::metrics::SkippedBucket> {
        self.state.lock().core.skipped_buckets.clone()
    }

    pub(crate) fn current_bucket_snapshot(&self) -> HashMap<MetricDimensionKey, Vec<GaugeAtom>> {
        self.state.lock().current_sliced_bucket.clone()
    }

    pub(crate) fn guardrail_hit(&self) -> bool {
        self.state.lock().dimension_guardrail_hit
    }
}
