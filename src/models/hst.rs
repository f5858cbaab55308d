use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{DetectorConfig, ScoreSign};
use crate::models::base_model::BaseModel;
use crate::models::hst_tree::HalfSpaceTree;
use crate::observation::Observation;

/// Ensemble of half-space trees sharing one feature schema.
///
/// Every tree sees the same points in the same order, so all of them rotate
/// their windows on the same learning step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HalfSpaceTrees {
    n_trees: usize,
    height: usize,
    window_size: usize,
    seed: u64,
    sign: ScoreSign,
    features: Vec<String>,
    trees: Vec<HalfSpaceTree>,
    step: u64,
}

impl HalfSpaceTrees {
    /// Trees are grown immediately when the config pins a schema, otherwise on
    /// the first observation.
    pub fn new(config: &DetectorConfig) -> Self {
        let mut instance = HalfSpaceTrees {
            n_trees: config.n_trees,
            height: config.height,
            window_size: config.window_size,
            seed: config.seed,
            sign: config.sign,
            features: Vec::new(),
            trees: Vec::with_capacity(config.n_trees),
            step: 0,
        };
        if let Some(features) = &config.features {
            instance.build(features.clone());
        }
        instance
    }

    fn build(&mut self, features: Vec<String>) {
        let mut rng = StdRng::seed_from_u64(self.seed);
        self.trees = (0..self.n_trees)
            .map(|_| HalfSpaceTree::new(features.len(), self.height, &mut rng))
            .collect();
        debug!(
            n_trees = self.n_trees,
            height = self.height,
            n_features = features.len(),
            "Built half-space trees"
        );
        self.features = features;
    }

    /// Grow the trees from the sorted keys of `x` if no schema exists yet.
    pub fn ensure_features(&mut self, x: &Observation) {
        if self.is_built() || x.is_empty() {
            return;
        }
        let mut features: Vec<String> = x.keys().cloned().collect();
        features.sort();
        self.build(features);
    }

    pub fn is_built(&self) -> bool {
        !self.trees.is_empty()
    }

    /// Whether a full window has been promoted to the reference profile.
    pub fn has_reference(&self) -> bool {
        self.trees.first().map_or(false, |t| t.rotations() > 0)
    }

    /// Lay `x` out in schema order; features outside the schema are dropped.
    pub fn encode(&self, x: &Observation) -> Vec<Option<f64>> {
        self.features.iter().map(|f| x.get(f).copied()).collect()
    }

    /// Largest mass one tree can report: a full window on every level.
    fn max_mass(&self) -> f64 {
        let levels: f64 = (0..=self.height).map(|d| 0.5f64.powi(d as i32)).sum();
        self.window_size as f64 * levels
    }

    /// Mean reference mass along the path of `x`, scaled into `[0, 1]`.
    ///
    /// Before the first rotation there is no reference and every point is
    /// treated as fully normal.
    pub fn normalized_mass(&self, x: &Observation) -> f64 {
        if !self.has_reference() {
            return 1.0;
        }
        let encoded = self.encode(x);
        let masses: Vec<f64> = self.trees.par_iter().map(|t| t.mass(&encoded)).collect();
        let total: f64 = masses.iter().sum();
        total / self.trees.len() as f64 / self.max_mass()
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn trees(&self) -> &[HalfSpaceTree] {
        &self.trees
    }

    pub fn n_trees(&self) -> usize {
        self.n_trees
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn sign(&self) -> ScoreSign {
        self.sign
    }

    /// Total number of points learned.
    pub fn step(&self) -> u64 {
        self.step
    }
}

impl BaseModel for HalfSpaceTrees {
    fn learn_one(&mut self, x: &Observation) {
        self.ensure_features(x);
        if !self.is_built() {
            return;
        }
        let encoded = self.encode(x);
        let window_size = self.window_size;
        let rotated: Vec<bool> = self
            .trees
            .par_iter_mut()
            .map(|t| {
                t.learn(&encoded);
                t.maybe_rotate_window(window_size)
            })
            .collect();
        assert!(
            rotated.iter().all(|&r| r == rotated[0]),
            "half-space trees rotated out of lock-step"
        );
        self.step += 1;
        if rotated[0] {
            debug!(step = self.step, window_size, "Rotated reference window");
        }
    }

    fn score_one(&self, x: &Observation) -> f64 {
        self.sign.apply(self.normalized_mass(x))
    }
}
