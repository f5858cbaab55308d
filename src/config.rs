//! Pipeline configuration.
//!
//! Every field has a default matching the fleet telemetry deployment, so a
//! config file only needs to name what it overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{DetectorError, Result};

/// Largest supported tree height. A tree has `2^(height + 1) - 1` nodes.
pub const MAX_HEIGHT: usize = 16;

/// Upper bound on arena nodes across the whole ensemble.
pub const MAX_ENSEMBLE_NODES: usize = 1 << 22;

/// Telemetry columns scored by default.
pub const DEFAULT_FEATURES: [&str; 11] = [
    "avg_fuel_consumption_rate",
    "idle_fuel_consumption_pct",
    "rpm_variance",
    "coolant_temp_anomalies",
    "productive_time_mins",
    "idle_time_mins",
    "vibration_anomalies",
    "over_speed_events",
    "tire_pressure_deviations",
    "error_code_frequency",
    "battery_low_voltage_events",
];

/// Which direction of the score means "anomalous".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSign {
    /// Score is `1 - mass`; high scores are anomalous.
    #[default]
    HighIsAnomalous,
    /// Score is the normalized mass itself; low scores are anomalous.
    LowIsAnomalous,
}

impl ScoreSign {
    /// Map a normalized mass in `[0, 1]` to a score.
    pub fn apply(self, mass: f64) -> f64 {
        match self {
            ScoreSign::HighIsAnomalous => 1.0 - mass,
            ScoreSign::LowIsAnomalous => mass,
        }
    }
}

/// Half-space tree ensemble parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub n_trees: usize,
    pub height: usize,
    pub window_size: usize,
    pub seed: u64,
    /// Fixed feature schema. `None` infers it from the first observation.
    pub features: Option<Vec<String>>,
    pub sign: ScoreSign,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            n_trees: 25,
            height: 8,
            window_size: 250,
            seed: 42,
            features: None,
            sign: ScoreSign::default(),
        }
    }
}

/// Quantile classifier parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub q: f64,
    pub capacity: usize,
    pub min_samples: usize,
    /// Skip learning on points classified as anomalous.
    pub protect: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        ClassifierConfig {
            q: 0.995,
            capacity: 1000,
            min_samples: 100,
            protect: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub detector: DetectorConfig,
    pub classifier: ClassifierConfig,
}

impl PipelineConfig {
    /// Config with the default telemetry schema pinned.
    pub fn telemetry() -> Self {
        let mut config = PipelineConfig::default();
        config.detector.features = Some(DEFAULT_FEATURES.iter().map(|f| f.to_string()).collect());
        config
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Config from `path`, or the telemetry defaults when no file is given.
    pub fn load_or_telemetry(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_json_file(p),
            None => Ok(Self::telemetry()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.detector;
        let c = &self.classifier;
        if d.n_trees == 0 {
            return Err(DetectorError::invalid("n_trees", "must be at least 1"));
        }
        if d.height == 0 || d.height > MAX_HEIGHT {
            return Err(DetectorError::invalid(
                "height",
                format!("must lie in [1, {}]", MAX_HEIGHT),
            ));
        }
        let nodes = d.n_trees.saturating_mul((1usize << (d.height + 1)) - 1);
        if nodes > MAX_ENSEMBLE_NODES {
            return Err(DetectorError::invalid(
                "n_trees",
                format!(
                    "{} trees of height {} need {} nodes, limit is {}",
                    d.n_trees, d.height, nodes, MAX_ENSEMBLE_NODES
                ),
            ));
        }
        if d.window_size == 0 {
            return Err(DetectorError::invalid("window_size", "must be at least 1"));
        }
        if let Some(features) = &d.features {
            if features.is_empty() {
                return Err(DetectorError::invalid("features", "schema cannot be empty"));
            }
        }
        if !(c.q > 0.0 && c.q < 1.0) {
            return Err(DetectorError::invalid("q", "must lie in (0, 1)"));
        }
        if c.capacity == 0 {
            return Err(DetectorError::invalid("capacity", "must be at least 1"));
        }
        if c.min_samples >= c.capacity {
            return Err(DetectorError::invalid(
                "min_samples",
                "must be smaller than capacity",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(PipelineConfig::default().validate().is_ok());
        assert!(PipelineConfig::telemetry().validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            PipelineConfig::from_json(r#"{"detector": {"n_trees": 3}, "classifier": {"protect": true}}"#)
                .unwrap();
        assert_eq!(config.detector.n_trees, 3);
        assert_eq!(config.detector.height, 8);
        assert_eq!(config.detector.window_size, 250);
        assert!(config.classifier.protect);
        assert_eq!(config.classifier.capacity, 1000);
    }

    #[test]
    fn test_sign_parses_snake_case() {
        let config =
            PipelineConfig::from_json(r#"{"detector": {"sign": "low_is_anomalous"}}"#).unwrap();
        assert_eq!(config.detector.sign, ScoreSign::LowIsAnomalous);
    }

    #[test]
    fn test_rejects_bad_quantile() {
        let err = PipelineConfig::from_json(r#"{"classifier": {"q": 1.5}}"#).unwrap_err();
        assert!(matches!(err, DetectorError::InvalidConfig { name: "q", .. }));
    }

    #[test]
    fn test_rejects_min_samples_above_capacity() {
        let err =
            PipelineConfig::from_json(r#"{"classifier": {"capacity": 10, "min_samples": 10}}"#)
                .unwrap_err();
        assert!(matches!(err, DetectorError::InvalidConfig { name: "min_samples", .. }));
    }

    #[test]
    fn test_rejects_zero_height() {
        let mut config = PipelineConfig::default();
        config.detector.height = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_ensemble() {
        let mut config = PipelineConfig::default();
        config.detector.height = MAX_HEIGHT + 1;
        assert!(matches!(
            config.validate(),
            Err(DetectorError::InvalidConfig { name: "height", .. })
        ));

        config.detector.height = MAX_HEIGHT;
        config.detector.n_trees = 25;
        assert!(config.validate().is_ok());
        config.detector.n_trees = 100;
        assert!(matches!(
            config.validate(),
            Err(DetectorError::InvalidConfig { name: "n_trees", .. })
        ));
    }

    #[test]
    fn test_missing_config_file_means_telemetry() {
        let config = PipelineConfig::load_or_telemetry(None).unwrap();
        assert_eq!(config, PipelineConfig::telemetry());
        assert_eq!(config.detector.features.as_ref().map(Vec::len), Some(DEFAULT_FEATURES.len()));
    }

    #[test]
    fn test_score_sign_apply() {
        assert_eq!(ScoreSign::HighIsAnomalous.apply(0.25), 0.75);
        assert_eq!(ScoreSign::LowIsAnomalous.apply(0.25), 0.25);
    }
}
