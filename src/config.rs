use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

use crate::condition::MetricConditionLink;
use crate::matcher::FieldSelector;

/// Default cap on distinct dimensions before telemetry-only reporting.
pub const DEFAULT_DIMENSION_SOFT_LIMIT: usize = 500;
/// Default cap on distinct dimensions before rejection.
pub const DEFAULT_DIMENSION_HARD_LIMIT: usize = 800;
/// Default cap on gauge atoms kept per dimension per bucket.
pub const DEFAULT_GAUGE_ATOMS_PER_DIMENSION: usize = 10;
/// Bucket floor applied to untrusted sources.
pub const MIN_UNTRUSTED_BUCKET: Duration = Duration::from_secs(5 * 60);

/// Sentinel for "no pull tag" / "no trigger atom".
pub const NO_TAG: i32 = -1;

/// Structured reason a metric configuration was rejected.
///
/// Invalidity is terminal for the producer instance: construction fails,
/// the surrounding config apply is rejected, and the engine keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidConfigReason {
    #[error("metric {metric_id}: atom_id is required")]
    MissingAtomId { metric_id: i64 },
    #[error("metric {metric_id}: sampling_percentage {value} outside [1, 100]")]
    SamplingPercentageOutOfRange { metric_id: i64, value: u32 },
    #[error("metric {metric_id}: sampling_percentage below 100 requires push mode")]
    SamplingPercentageOnPulled { metric_id: i64 },
    #[error("metric {metric_id}: trigger atom requires a pull tag")]
    TriggerWithoutPull { metric_id: i64 },
    #[error("metric {metric_id}: trigger atom requires first_n_samples sampling")]
    TriggerWithoutFirstNSamples { metric_id: i64 },
    #[error("metric {metric_id}: sliced condition cannot be combined with a trigger atom")]
    SlicedConditionWithTrigger { metric_id: i64 },
    #[error("metric {metric_id}: dimension hard limit {hard} below soft limit {soft}")]
    DimensionLimitsInverted {
        metric_id: i64,
        soft: usize,
        hard: usize,
    },
    #[error("metric {metric_id}: max_gauge_atoms_per_dimension must be positive")]
    ZeroAtomsPerDimension { metric_id: i64 },
    #[error("metric {metric_id}: bucket duration must be positive")]
    ZeroBucket { metric_id: i64 },
}

/// Symbolic bucket widths, mapped to milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    OneMinute,
    FiveMinutes,
    TenMinutes,
    ThirtyMinutes,
    OneHour,
    ThreeHours,
    SixHours,
    TwelveHours,
    OneDay,
    OneWeek,
}

impl TimeUnit {
    pub fn to_millis(self) -> i64 {
        const MINUTE: i64 = 60 * 1000;
        match self {
            TimeUnit::OneMinute => MINUTE,
            TimeUnit::FiveMinutes => 5 * MINUTE,
            TimeUnit::TenMinutes => 10 * MINUTE,
            TimeUnit::ThirtyMinutes => 30 * MINUTE,
            TimeUnit::OneHour => 60 * MINUTE,
            TimeUnit::ThreeHours => 3 * 60 * MINUTE,
            TimeUnit::SixHours => 6 * 60 * MINUTE,
            TimeUnit::TwelveHours => 12 * 60 * MINUTE,
            TimeUnit::OneDay => 24 * 60 * MINUTE,
            TimeUnit::OneWeek => 7 * 24 * 60 * MINUTE,
        }
    }
}

/// How a gauge metric samples matched atoms within a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaugeSamplingType {
    /// At most one atom per dimension per bucket.
    #[default]
    RandomOneSample,
    /// Every matched atom up to the per-dimension cap.
    FirstNSamples,
    /// Pull on every false-to-true condition edge.
    ConditionChangeToTrue,
}

/// When an activation fires relative to boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationType {
    #[default]
    ActivateImmediately,
    ActivateOnBoot,
}

/// One TTL-bounded activation source for a metric.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivationConfig {
    /// Index of the event matcher whose firing activates the metric.
    pub activation_tracker_index: usize,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(default)]
    pub activation_type: ActivationType,
    /// Indices of event matchers whose firing deactivates this activation.
    #[serde(default)]
    pub deactivation_tracker_indices: Vec<usize>,
}

/// Declarative configuration for one gauge metric.
#[derive(Debug, Clone, Deserialize)]
pub struct GaugeMetricConfig {
    pub id: i64,
    pub atom_id: i32,

    /// Symbolic bucket width. Default: one_hour.
    #[serde(default = "default_bucket")]
    pub bucket: TimeUnit,

    /// Explicit bucket width overriding `bucket`; same floor applies.
    #[serde(default, with = "humantime_serde")]
    pub bucket_duration: Option<Duration>,

    /// Buckets closing below this width are skipped. Default: 0.
    #[serde(default, with = "humantime_serde")]
    pub min_bucket_size: Duration,

    #[serde(default)]
    pub sampling_type: GaugeSamplingType,

    /// Push-mode probabilistic keep percentage. Default: 100.
    #[serde(default = "default_sampling_percentage")]
    pub sampling_percentage: u32,

    /// Pull source tag; NO_TAG means push mode.
    #[serde(default = "default_no_tag")]
    pub pull_tag_id: i32,

    /// Atom whose arrival triggers a pull; NO_TAG disables.
    #[serde(default = "default_no_tag")]
    pub trigger_atom_id: i32,

    /// Pulls slower than this have their data discarded. Default: 10s.
    #[serde(default = "default_max_pull_delay", with = "humantime_serde")]
    pub max_pull_delay: Duration,

    #[serde(default = "default_dimension_soft_limit")]
    pub dimension_soft_limit: usize,

    #[serde(default = "default_dimension_hard_limit")]
    pub dimension_hard_limit: usize,

    #[serde(default = "default_gauge_atoms_per_dimension")]
    pub max_gauge_atoms_per_dimension: usize,

    /// Fields to keep in gauge snapshots; absent means all fields.
    #[serde(default)]
    pub gauge_fields: Option<FieldSelector>,

    /// Slicing dimensions extracted from the matched atom.
    #[serde(default)]
    pub dimensions_in_what: Option<FieldSelector>,

    /// Links resolving a sliced condition per event.
    #[serde(default)]
    pub links: Vec<MetricConditionLink>,

    #[serde(default)]
    pub activations: Vec<ActivationConfig>,

    /// Split a partial bucket when the observed app upgrades. Default: true.
    #[serde(default = "default_true")]
    pub split_bucket_for_app_upgrade: bool,

    /// Floor appended timestamps to the bucket width. Default: false.
    #[serde(default)]
    pub truncate_timestamps: bool,

    /// Trusted sources may configure buckets below the five-minute floor.
    #[serde(default)]
    pub trusted_source: bool,
}

impl GaugeMetricConfig {
    pub fn is_pulled(&self) -> bool {
        self.pull_tag_id != NO_TAG
    }

    pub fn has_trigger(&self) -> bool {
        self.trigger_atom_id != NO_TAG
    }

    /// The configured bucket width in milliseconds, floored to five minutes
    /// for untrusted sources.
    pub fn bucket_size_millis_guardrailed(&self) -> i64 {
        let millis = match self.bucket_duration {
            Some(d) => d.as_millis() as i64,
            None => self.bucket.to_millis(),
        };
        let floor = MIN_UNTRUSTED_BUCKET.as_millis() as i64;
        if !self.trusted_source && millis < floor {
            floor
        } else {
            millis
        }
    }

    /// Construction-time validation, mirroring the config apply path.
    pub fn validate(&self) -> Result<(), InvalidConfigReason> {
        if self.atom_id <= 0 {
            return Err(InvalidConfigReason::MissingAtomId { metric_id: self.id });
        }
        if self.sampling_percentage == 0 || self.sampling_percentage > 100 {
            return Err(InvalidConfigReason::SamplingPercentageOutOfRange {
                metric_id: self.id,
                value: self.sampling_percentage,
            });
        }
        if self.sampling_percentage < 100 && self.is_pulled() {
            return Err(InvalidConfigReason::SamplingPercentageOnPulled { metric_id: self.id });
        }
        if self.has_trigger() {
            if !self.is_pulled() {
                return Err(InvalidConfigReason::TriggerWithoutPull { metric_id: self.id });
            }
            if self.sampling_type != GaugeSamplingType::FirstNSamples {
                return Err(InvalidConfigReason::TriggerWithoutFirstNSamples {
                    metric_id: self.id,
                });
            }
            if !self.links.is_empty() {
                return Err(InvalidConfigReason::SlicedConditionWithTrigger {
                    metric_id: self.id,
                });
            }
        }
        if self.dimension_hard_limit < self.dimension_soft_limit || self.dimension_soft_limit == 0 {
            return Err(InvalidConfigReason::DimensionLimitsInverted {
                metric_id: self.id,
                soft: self.dimension_soft_limit,
                hard: self.dimension_hard_limit,
            });
        }
        if self.max_gauge_atoms_per_dimension == 0 {
            return Err(InvalidConfigReason::ZeroAtomsPerDimension { metric_id: self.id });
        }
        if self.bucket_size_millis_guardrailed() <= 0 {
            return Err(InvalidConfigReason::ZeroBucket { metric_id: self.id });
        }
        Ok(())
    }
}

/// Top-level engine configuration.
#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub metrics: Vec<GaugeMetricConfig>,
}

impl EngineConfig {
    /// Load configuration from a YAML file and validate every metric.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: EngineConfig = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        for metric in &self.metrics {
            metric
                .validate()
                .with_context(|| format!("metric {}", metric.id))?;
        }
        Ok(())
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bucket() -> TimeUnit {
    TimeUnit::OneHour
}

fn default_sampling_percentage() -> u32 {
    100
}

fn default_no_tag() -> i32 {
    NO_TAG
}

fn default_max_pull_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_dimension_soft_limit() -> usize {
    DEFAULT_DIMENSION_SOFT_LIMIT
}

fn default_dimension_hard_limit() -> usize {
    DEFAULT_DIMENSION_HARD_LIMIT
}

fn default_gauge_atoms_per_dimension() -> usize {
    DEFAULT_GAUGE_ATOMS_PER_DIMENSION
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics: Vec::new(),
        }
    }
}

impl Default for GaugeMetricConfig {
    fn default() -> Self {
        Self {
            id: 0,
            atom_id: 0,
            bucket: default_bucket(),
            bucket_duration: None,
            min_bucket_size: Duration::ZERO,
            sampling_type: GaugeSamplingType::default(),
            sampling_percentage: default_sampling_percentage(),
            pull_tag_id: NO_TAG,
            trigger_atom_id: NO_TAG,
            max_pull_delay: default_max_pull_delay(),
            dimension_soft_limit: default_dimension_soft_limit(),
            dimension_hard_limit: default_dimension_hard_limit(),
            max_gauge_atoms_per_dimension: default_gauge_atoms_per_dimension(),
            gauge_fields: None,
            dimensions_in_what: None,
            links: Vec::new(),
            activations: Vec::new(),
            split_bucket_for_app_upgrade: true,
            truncate_timestamps: false,
            trusted_source: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> GaugeMetricConfig {
        GaugeMetricConfig {
            id: 1,
            atom_id: 42,
            trusted_source: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_missing_atom_id_rejected() {
        let cfg = GaugeMetricConfig {
            atom_id: 0,
            ..base_config()
        };
        assert_eq!(
            cfg.validate().unwrap_err(),
            InvalidConfigReason::MissingAtomId { metric_id: 1 }
        );
    }

    #[test]
    fn test_sampling_percentage_bounds() {
        let cfg = GaugeMetricConfig {
            sampling_percentage: 0,
            ..base_config()
        };
        assert!(cfg.validate().is_err());

        let cfg = GaugeMetricConfig {
            sampling_percentage: 101,
            ..base_config()
        };
        assert!(cfg.validate().is_err());

        let cfg = GaugeMetricConfig {
            sampling_percentage: 50,
            pull_tag_id: 1001,
            ..base_config()
        };
        assert_eq!(
            cfg.validate().unwrap_err(),
            InvalidConfigReason::SamplingPercentageOnPulled { metric_id: 1 }
        );
    }

    #[test]
    fn test_trigger_requires_pull_and_first_n() {
        let cfg = GaugeMetricConfig {
            trigger_atom_id: 77,
            ..base_config()
        };
        assert_eq!(
            cfg.validate().unwrap_err(),
            InvalidConfigReason::TriggerWithoutPull { metric_id: 1 }
        );

        let cfg = GaugeMetricConfig {
            trigger_atom_id: 77,
            pull_tag_id: 1001,
            sampling_type: GaugeSamplingType::RandomOneSample,
            ..base_config()
        };
        assert_eq!(
            cfg.validate().unwrap_err(),
            InvalidConfigReason::TriggerWithoutFirstNSamples { metric_id: 1 }
        );

        let cfg = GaugeMetricConfig {
            trigger_atom_id: 77,
            pull_tag_id: 1001,
            sampling_type: GaugeSamplingType::FirstNSamples,
            ..base_config()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_dimension_limits_must_be_ordered() {
        let cfg = GaugeMetricConfig {
            dimension_soft_limit: 100,
            dimension_hard_limit: 50,
            ..base_config()
        };
        assert!(matches!(
            cfg.validate().unwrap_err(),
            InvalidConfigReason::DimensionLimitsInverted { .. }
        ));
    }

    #[test]
    fn test_explicit_bucket_duration_overrides_unit() {
        let cfg = GaugeMetricConfig {
            bucket: TimeUnit::OneHour,
            bucket_duration: Some(Duration::from_millis(10)),
            ..base_config()
        };
        assert_eq!(cfg.bucket_size_millis_guardrailed(), 10);

        // Untrusted sources still get floored.
        let cfg = GaugeMetricConfig {
            bucket_duration: Some(Duration::from_millis(10)),
            trusted_source: false,
            ..base_config()
        };
        assert_eq!(cfg.bucket_size_millis_guardrailed(), 5 * 60 * 1000);
    }

    #[test]
    fn test_bucket_floor_for_untrusted_sources() {
        let cfg = GaugeMetricConfig {
            bucket: TimeUnit::OneMinute,
            trusted_source: false,
            ..base_config()
        };
        assert_eq!(cfg.bucket_size_millis_guardrailed(), 5 * 60 * 1000);

        let cfg = GaugeMetricConfig {
            bucket: TimeUnit::OneMinute,
            trusted_source: true,
            ..base_config()
        };
        assert_eq!(cfg.bucket_size_millis_guardrailed(), 60 * 1000);
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
log_level: debug
metrics:
  - id: 7
    atom_id: 42
    bucket: five_minutes
    sampling_type: first_n_samples
    max_gauge_atoms_per_dimension: 3
    dimensions_in_what:
      field: 42
      children:
        - field: 1
"#;
        let cfg: EngineConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.metrics.len(), 1);
        let m = &cfg.metrics[0];
        assert_eq!(m.id, 7);
        assert_eq!(m.bucket, TimeUnit::FiveMinutes);
        assert_eq!(m.sampling_type, GaugeSamplingType::FirstNSamples);
        assert_eq!(m.max_gauge_atoms_per_dimension, 3);
        assert_eq!(m.sampling_percentage, 100);
        assert!(!m.is_pulled());
        let dims = m.dimensions_in_what.as_ref().expect("dims");
        assert_eq!(dims.field, 42);
        assert_eq!(dims.children.len(), 1);
        assert!(cfg.validate().is_ok());
    }
}
