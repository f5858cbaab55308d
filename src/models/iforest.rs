//! Batch isolation forest used as an offline comparator.
//!
//! Fit once on an early slice of history, score a later slice. Shares no
//! state with the streaming pipeline.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DetectorError, Result};
use crate::observation::Observation;
use crate::utils::quantile::quantile_sorted;

const EULER_GAMMA: f64 = 0.5772156649;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationForestConfig {
    pub n_estimators: usize,
    pub max_samples: usize,
    pub contamination: f64,
    pub seed: u64,
    /// Leading share of rows used for fitting.
    pub train_fraction: f64,
}

impl Default for IsolationForestConfig {
    fn default() -> Self {
        IsolationForestConfig {
            n_estimators: 200,
            max_samples: 256,
            contamination: 0.01,
            seed: 42,
            train_fraction: 0.7,
        }
    }
}

// Custom tree node structure
struct Node {
    split_feature: Option<usize>,
    split_value: f64,
    size: usize,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
}

impl Node {
    fn leaf(size: usize) -> Self {
        Node {
            split_feature: None,
            split_value: 0.0,
            size,
            left: None,
            right: None,
        }
    }
}

/// Average path length of an unsuccessful search in a binary search tree of `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

fn build_tree(
    data: &ArrayView2<f64>,
    rows: &[usize],
    height: usize,
    height_limit: usize,
    rng: &mut StdRng,
) -> Node {
    let size = rows.len();
    if size <= 1 || height >= height_limit {
        return Node::leaf(size);
    }

    let split_feature = rng.gen_range(0..data.ncols());
    let (mut min_val, mut max_val) = (f64::INFINITY, f64::NEG_INFINITY);
    for &r in rows {
        let val = data[[r, split_feature]];
        min_val = min_val.min(val);
        max_val = max_val.max(val);
    }
    if (max_val - min_val).abs() < 1e-10 {
        return Node::leaf(size);
    }

    let split_value = rng.gen::<f64>() * (max_val - min_val) + min_val;
    let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
        .iter()
        .copied()
        .partition(|&r| data[[r, split_feature]] < split_value);

    if left_rows.is_empty() || right_rows.is_empty() {
        return Node::leaf(size);
    }
    Node {
        split_feature: Some(split_feature),
        split_value,
        size,
        left: Some(Box::new(build_tree(data, &left_rows, height + 1, height_limit, rng))),
        right: Some(Box::new(build_tree(data, &right_rows, height + 1, height_limit, rng))),
    }
}

fn path_length(node: &Node, x: &ArrayView1<f64>, current_height: usize) -> f64 {
    match (node.split_feature, &node.left, &node.right) {
        (Some(feature), Some(left), Some(right)) => {
            let next = if x[feature] < node.split_value { left } else { right };
            path_length(next, x, current_height + 1)
        }
        _ => current_height as f64 + average_path_length(node.size),
    }
}

/// Zero-mean unit-variance scaling with statistics from the training slice.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    mean: Array1<f64>,
    std: Array1<f64>,
}

impl StandardScaler {
    pub fn fit(x: &ArrayView2<f64>) -> Self {
        let mean = x
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(x.ncols()));
        let std = x
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > 0.0 { s } else { 1.0 });
        StandardScaler { mean, std }
    }

    pub fn transform(&self, x: &ArrayView2<f64>) -> Array2<f64> {
        (x - &self.mean) / &self.std
    }
}

pub struct BatchIsolationForest {
    trees: Vec<Node>,
    scaler: StandardScaler,
    max_samples: usize,
    offset: f64,
}

impl BatchIsolationForest {
    pub fn fit(train: &ArrayView2<f64>, config: &IsolationForestConfig) -> Result<Self> {
        if train.nrows() < 2 {
            return Err(DetectorError::InsufficientData {
                required: 2,
                got: train.nrows(),
            });
        }
        if !(config.contamination > 0.0 && config.contamination < 0.5) {
            return Err(DetectorError::invalid("contamination", "must lie in (0, 0.5)"));
        }
        if config.n_estimators == 0 || config.max_samples == 0 {
            return Err(DetectorError::invalid(
                "n_estimators",
                "n_estimators and max_samples must be at least 1",
            ));
        }

        let scaler = StandardScaler::fit(train);
        let scaled = scaler.transform(train);
        let view = scaled.view();
        let max_samples = config.max_samples.min(view.nrows());
        let height_limit = (max_samples as f64).log2().ceil() as usize;

        let trees: Vec<Node> = (0..config.n_estimators)
            .into_par_iter()
            .map(|i| {
                let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(i as u64));
                let rows = sample(&mut rng, view.nrows(), max_samples).into_vec();
                build_tree(&view, &rows, 0, height_limit, &mut rng)
            })
            .collect();

        let mut forest = BatchIsolationForest {
            trees,
            scaler,
            max_samples,
            offset: f64::INFINITY,
        };
        let mut train_scores = forest.score_scaled(&view);
        train_scores.sort_by(f64::total_cmp);
        forest.offset = quantile_sorted(&train_scores, 1.0 - config.contamination)
            .unwrap_or(f64::INFINITY);
        Ok(forest)
    }

    fn score_scaled(&self, x: &ArrayView2<f64>) -> Vec<f64> {
        let expected = average_path_length(self.max_samples);
        (0..x.nrows())
            .into_par_iter()
            .map(|i| {
                let row = x.row(i);
                let total: f64 = self.trees.iter().map(|t| path_length(t, &row, 0)).sum();
                let mean = total / self.trees.len() as f64;
                if expected > 0.0 {
                    2.0f64.powf(-mean / expected)
                } else {
                    1.0
                }
            })
            .collect()
    }

    /// Anomaly score per row; higher is more anomalous.
    pub fn score_samples(&self, x: &ArrayView2<f64>) -> Vec<f64> {
        let scaled = self.scaler.transform(x);
        self.score_scaled(&scaled.view())
    }

    /// Score cut-off taken from the training slice.
    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn predict(&self, x: &ArrayView2<f64>) -> Vec<bool> {
        self.score_samples(x)
            .into_iter()
            .map(|s| s > self.offset)
            .collect()
    }
}

/// Comparator output for one row of the scored slice.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BaselineRow {
    /// Position of the row in the input sequence.
    pub index: usize,
    pub score: f64,
    pub is_anomaly: bool,
}

/// Lay observations out as a matrix, filling gaps with the column mean of
/// the first `train_rows` rows.
pub fn to_matrix(rows: &[Observation], features: &[String], train_rows: usize) -> Array2<f64> {
    let mut matrix = Array2::from_shape_fn((rows.len(), features.len()), |(r, c)| {
        rows[r].get(&features[c]).copied().unwrap_or(f64::NAN)
    });
    for mut column in matrix.axis_iter_mut(Axis(1)) {
        let known: Vec<f64> = column
            .iter()
            .take(train_rows)
            .copied()
            .filter(|v| v.is_finite())
            .collect();
        let fill = if known.is_empty() {
            0.0
        } else {
            known.iter().sum::<f64>() / known.len() as f64
        };
        column.mapv_inplace(|v| if v.is_finite() { v } else { fill });
    }
    matrix
}

/// Fit on the leading slice of `rows`, score the remainder.
pub fn baseline(
    rows: &[Observation],
    features: &[String],
    config: &IsolationForestConfig,
) -> Result<Vec<BaselineRow>> {
    if features.is_empty() {
        return Err(DetectorError::invalid("features", "schema cannot be empty"));
    }
    let train_rows = (rows.len() as f64 * config.train_fraction) as usize;
    if train_rows < 2 || train_rows >= rows.len() {
        return Err(DetectorError::InsufficientData {
            required: 3,
            got: rows.len(),
        });
    }
    let matrix = to_matrix(rows, features, train_rows);
    let train = matrix.slice(ndarray::s![..train_rows, ..]);
    let test = matrix.slice(ndarray::s![train_rows.., ..]);

    let forest = BatchIsolationForest::fit(&train, config)?;
    let scores = forest.score_samples(&test);
    let flagged = scores.iter().filter(|&&s| s > forest.offset()).count();
    info!(
        train_rows,
        scored_rows = scores.len(),
        flagged,
        "Isolation forest baseline complete"
    );
    Ok(scores
        .into_iter()
        .enumerate()
        .map(|(i, score)| BaselineRow {
            index: train_rows + i,
            score,
            is_anomaly: score > forest.offset(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn obs(pairs: &[(&str, f64)]) -> Observation {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn cluster(n: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, 2), |(r, c)| ((r * 31 + c * 17) % 23) as f64 / 23.0)
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        assert!(average_path_length(256) > average_path_length(16));
    }

    #[test]
    fn test_standard_scaler() {
        let x = array![[1.0, 5.0], [3.0, 5.0]];
        let scaler = StandardScaler::fit(&x.view());
        let t = scaler.transform(&x.view());
        assert_eq!(t, array![[-1.0, 0.0], [1.0, 0.0]]);
    }

    #[test]
    fn test_outlier_scores_above_cluster() {
        let train = cluster(300);
        let config = IsolationForestConfig {
            n_estimators: 50,
            ..IsolationForestConfig::default()
        };
        let forest = BatchIsolationForest::fit(&train.view(), &config).unwrap();
        let probe = array![[0.5, 0.5], [25.0, -25.0]];
        let scores = forest.score_samples(&probe.view());
        assert!(scores[1] > scores[0]);
        assert!(forest.predict(&probe.view())[1]);
    }

    #[test]
    fn test_fit_is_deterministic() {
        let train = cluster(100);
        let config = IsolationForestConfig {
            n_estimators: 20,
            ..IsolationForestConfig::default()
        };
        let a = BatchIsolationForest::fit(&train.view(), &config).unwrap();
        let b = BatchIsolationForest::fit(&train.view(), &config).unwrap();
        assert_eq!(a.score_samples(&train.view()), b.score_samples(&train.view()));
    }

    #[test]
    fn test_fit_rejects_tiny_input() {
        let train = array![[1.0, 2.0]];
        let err = BatchIsolationForest::fit(&train.view(), &IsolationForestConfig::default());
        assert!(matches!(err, Err(DetectorError::InsufficientData { .. })));
    }

    #[test]
    fn test_to_matrix_fills_missing_with_train_mean() {
        let rows = vec![obs(&[("a", 1.0)]), obs(&[("a", 3.0)]), obs(&[("b", 9.0)])];
        let features = vec!["a".to_string(), "b".to_string()];
        let m = to_matrix(&rows, &features, 2);
        assert_eq!(m[[2, 0]], 2.0);
        // Nothing known for "b" in the training slice.
        assert_eq!(m[[0, 1]], 0.0);
        assert_eq!(m[[2, 1]], 9.0);
    }

    #[test]
    fn test_baseline_scores_tail_rows() {
        let rows: Vec<Observation> = (0..100)
            .map(|i| obs(&[("a", (i % 10) as f64), ("b", (i % 7) as f64)]))
            .collect();
        let features = vec!["a".to_string(), "b".to_string()];
        let config = IsolationForestConfig {
            n_estimators: 25,
            ..IsolationForestConfig::default()
        };
        let out = baseline(&rows, &features, &config).unwrap();
        assert_eq!(out.len(), 30);
        assert_eq!(out[0].index, 70);
        assert!(out.iter().all(|r| r.score > 0.0 && r.score <= 1.0));
    }
}
