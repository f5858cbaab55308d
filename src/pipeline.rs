//! Score, classify, learn: the per-observation cycle.
//!
//! A [`Pipeline`] owns the scaler, the tree ensemble and the score history.
//! Each call to [`Pipeline::process`] runs the full cycle in a fixed order:
//!
//! 1. scale `x` with the current min/max ranges,
//! 2. score the scaled point,
//! 3. classify the score against the history as it stands,
//! 4. append the score to the history,
//! 5. widen the scaler ranges with the raw point,
//! 6. learn the scaled point, unless protection is on and it was flagged.
//!
//! Nothing a point contributes is visible when that same point is scored.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::{DetectorError, InputError, Result};
use crate::models::base_model::BaseModel;
use crate::models::hst::HalfSpaceTrees;
use crate::observation::{sanitize, Observation, Verdict};
use crate::utils::quantile::{QuantileClassifier, Tail};
use crate::utils::ss::MinMaxScaler;

/// Bumped whenever the snapshot layout changes.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to resume a pipeline exactly where it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub version: u32,
    pub config: PipelineConfig,
    pub scaler: MinMaxScaler,
    pub detector: HalfSpaceTrees,
    pub classifier: QuantileClassifier,
    pub processed: u64,
}

impl PipelineState {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Counts from a training pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TrainingSummary {
    pub observations: u64,
    pub rejected: u64,
    pub anomalies: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    config: PipelineConfig,
    scaler: MinMaxScaler,
    detector: HalfSpaceTrees,
    classifier: QuantileClassifier,
    processed: u64,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Pipeline {
            scaler: MinMaxScaler::new(),
            detector: HalfSpaceTrees::new(&config.detector),
            classifier: QuantileClassifier::new(&config.classifier, config.detector.sign.into()),
            processed: 0,
            config,
        })
    }

    /// Drop non-finite values and, with a pinned schema, unknown features.
    fn admit(&self, x: &Observation) -> std::result::Result<Observation, InputError> {
        let mut clean = sanitize(x)?;
        if let Some(schema) = &self.config.detector.features {
            clean.retain(|name, _| schema.iter().any(|f| f == name));
            if clean.is_empty() {
                return Err(InputError::Empty);
            }
        }
        Ok(clean)
    }

    /// Run the full cycle for one observation.
    pub fn process(&mut self, x: &Observation) -> std::result::Result<Verdict, InputError> {
        let x = self.admit(x)?;

        let scaled = self.scaler.transform(&x);
        self.detector.ensure_features(&scaled);
        let score = self.detector.score_one(&scaled);
        let is_anomaly = self.classifier.classify(score);
        self.classifier.observe(score);
        self.scaler.update(&x);
        if !(self.config.classifier.protect && is_anomaly) {
            self.detector.learn_one(&scaled);
        }

        self.processed += 1;
        if is_anomaly {
            debug!(step = self.processed, score, "Flagged anomaly");
        }
        Ok(Verdict { score, is_anomaly })
    }

    /// Score and classify without touching any state.
    pub fn predict(&self, x: &Observation) -> std::result::Result<Verdict, InputError> {
        let x = self.admit(x)?;
        let scaled = self.scaler.transform(&x);
        let score = self.detector.score_one(&scaled);
        Ok(Verdict {
            score,
            is_anomaly: self.classifier.classify(score),
        })
    }

    /// Served-mode entry point: learn only when asked to.
    pub fn predict_and_learn(
        &mut self,
        x: &Observation,
        learn: bool,
    ) -> std::result::Result<Verdict, InputError> {
        if learn {
            self.process(x)
        } else {
            self.predict(x)
        }
    }

    /// Run the cycle over a historical sequence, skipping unusable rows.
    pub fn train<I>(&mut self, rows: I) -> TrainingSummary
    where
        I: IntoIterator<Item = Observation>,
    {
        let mut summary = TrainingSummary::default();
        for row in rows {
            match self.process(&row) {
                Ok(verdict) => {
                    summary.observations += 1;
                    if verdict.is_anomaly {
                        summary.anomalies += 1;
                    }
                }
                Err(_) => summary.rejected += 1,
            }
        }
        info!(
            observations = summary.observations,
            rejected = summary.rejected,
            anomalies = summary.anomalies,
            "Training pass complete"
        );
        summary
    }

    /// Forget everything learned, keeping the configuration.
    pub fn reset(&mut self) {
        self.scaler = MinMaxScaler::new();
        self.detector = HalfSpaceTrees::new(&self.config.detector);
        self.classifier =
            QuantileClassifier::new(&self.config.classifier, self.config.detector.sign.into());
        self.processed = 0;
    }

    pub fn state(&self) -> PipelineState {
        PipelineState {
            version: SNAPSHOT_VERSION,
            config: self.config.clone(),
            scaler: self.scaler.clone(),
            detector: self.detector.clone(),
            classifier: self.classifier.clone(),
            processed: self.processed,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        self.state().serialize()
    }

    /// Resume from a snapshot, refusing one that disagrees with `config`.
    pub fn restore(state: PipelineState, config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        check_compatible(&state, config)?;
        Ok(Pipeline {
            config: config.clone(),
            scaler: state.scaler,
            detector: state.detector,
            classifier: state.classifier,
            processed: state.processed,
        })
    }

    pub fn deserialize(bytes: &[u8], config: &PipelineConfig) -> Result<Self> {
        Self::restore(PipelineState::deserialize(bytes)?, config)
    }

    /// Write the snapshot to `path` via a temporary file and a rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_snapshot(&self.state(), path)
    }

    pub fn load(path: &Path, config: &PipelineConfig) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let pipeline = Self::deserialize(&bytes, config)?;
        info!(
            path = %path.display(),
            processed = pipeline.processed,
            "Pipeline snapshot loaded"
        );
        Ok(pipeline)
    }

    /// Resume from a snapshot using the configuration stored inside it.
    pub fn load_with_stored_config(path: &Path) -> Result<Self> {
        let state = PipelineState::deserialize(&std::fs::read(path)?)?;
        let config = state.config.clone();
        Self::restore(state, &config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn scaler(&self) -> &MinMaxScaler {
        &self.scaler
    }

    pub fn detector(&self) -> &HalfSpaceTrees {
        &self.detector
    }

    pub fn classifier(&self) -> &QuantileClassifier {
        &self.classifier
    }

    pub fn threshold(&self) -> Option<f64> {
        self.classifier.threshold()
    }

    /// Observations run through the full cycle.
    pub fn processed(&self) -> u64 {
        self.processed
    }
}

fn check_compatible(state: &PipelineState, config: &PipelineConfig) -> Result<()> {
    if state.version != SNAPSHOT_VERSION {
        return Err(DetectorError::mismatch("version", SNAPSHOT_VERSION, state.version));
    }
    let d = &state.detector;
    let want = &config.detector;
    if d.n_trees() != want.n_trees {
        return Err(DetectorError::mismatch("n_trees", want.n_trees, d.n_trees()));
    }
    if d.is_built() && d.trees().len() != want.n_trees {
        return Err(DetectorError::mismatch("n_trees", want.n_trees, d.trees().len()));
    }
    if d.height() != want.height {
        return Err(DetectorError::mismatch("height", want.height, d.height()));
    }
    if d.window_size() != want.window_size {
        return Err(DetectorError::mismatch("window_size", want.window_size, d.window_size()));
    }
    if d.sign() != want.sign {
        return Err(DetectorError::mismatch(
            "sign",
            format!("{:?}", want.sign),
            format!("{:?}", d.sign()),
        ));
    }
    if let Some(features) = &want.features {
        if d.features() != features.as_slice() {
            return Err(DetectorError::mismatch(
                "features",
                features.join(","),
                d.features().join(","),
            ));
        }
    }
    for tree in d.trees() {
        if !tree.is_well_formed(want.height, d.features().len()) {
            return Err(DetectorError::mismatch(
                "tree structure",
                format!("full tree of height {}", want.height),
                "malformed node arena",
            ));
        }
    }
    if !state.classifier.matches(&config.classifier) {
        return Err(DetectorError::mismatch(
            "classifier",
            format!(
                "q={} capacity={} min_samples={}",
                config.classifier.q, config.classifier.capacity, config.classifier.min_samples
            ),
            format!(
                "q={} capacity={} min_samples={}",
                state.config.classifier.q,
                state.config.classifier.capacity,
                state.config.classifier.min_samples
            ),
        ));
    }
    if state.classifier.len() > config.classifier.capacity {
        return Err(DetectorError::mismatch(
            "classifier history",
            format!("at most {} scores", config.classifier.capacity),
            state.classifier.len(),
        ));
    }
    let tail = Tail::from(want.sign);
    if state.classifier.tail() != tail {
        return Err(DetectorError::mismatch(
            "classifier tail",
            format!("{:?}", tail),
            format!("{:?}", state.classifier.tail()),
        ));
    }
    Ok(())
}

fn write_snapshot(state: &PipelineState, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let bytes = state.serialize()?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    info!(path = %path.display(), processed = state.processed, "Pipeline snapshot saved");
    Ok(())
}

/// A pipeline behind one lock, so each observation is a single transaction.
#[derive(Debug, Clone)]
pub struct SharedPipeline {
    inner: Arc<Mutex<Pipeline>>,
}

impl SharedPipeline {
    pub fn new(pipeline: Pipeline) -> Self {
        SharedPipeline {
            inner: Arc::new(Mutex::new(pipeline)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Pipeline>> {
        self.inner.lock().map_err(|_| DetectorError::LockPoisoned)
    }

    pub fn process(&self, x: &Observation) -> Result<Verdict> {
        Ok(self.lock()?.process(x)?)
    }

    pub fn predict(&self, x: &Observation, learn: bool) -> Result<Verdict> {
        Ok(self.lock()?.predict_and_learn(x, learn)?)
    }

    /// Process several observations under one lock acquisition.
    pub fn process_batch(
        &self,
        xs: &[Observation],
    ) -> Result<Vec<std::result::Result<Verdict, InputError>>> {
        let mut pipeline = self.lock()?;
        Ok(xs.iter().map(|x| pipeline.process(x)).collect())
    }

    pub fn snapshot(&self) -> Result<PipelineState> {
        Ok(self.lock()?.state())
    }

    /// Snapshot under the lock, then write with the lock released.
    pub fn save(&self, path: &Path) -> Result<()> {
        let state = self.snapshot()?;
        write_snapshot(&state, path)
    }

    pub fn threshold(&self) -> Result<Option<f64>> {
        Ok(self.lock()?.threshold())
    }
}
