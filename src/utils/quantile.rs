use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::{ClassifierConfig, ScoreSign};

/// Which end of the score distribution is flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tail {
    Upper,
    Lower,
}

impl From<ScoreSign> for Tail {
    fn from(sign: ScoreSign) -> Self {
        match sign {
            ScoreSign::HighIsAnomalous => Tail::Upper,
            ScoreSign::LowIsAnomalous => Tail::Lower,
        }
    }
}

/// Linear-interpolated quantile of an ascending slice.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Flags scores beyond a high quantile of a bounded score history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileClassifier {
    q: f64,
    capacity: usize,
    min_samples: usize,
    tail: Tail,
    history: VecDeque<f64>,
}

impl QuantileClassifier {
    pub fn new(config: &ClassifierConfig, tail: Tail) -> Self {
        QuantileClassifier {
            q: config.q,
            capacity: config.capacity,
            min_samples: config.min_samples,
            tail,
            history: VecDeque::with_capacity(config.capacity),
        }
    }

    /// Current cut-off, or `None` while the history holds `min_samples` or fewer scores.
    pub fn threshold(&self) -> Option<f64> {
        if self.history.len() <= self.min_samples {
            return None;
        }
        let mut sorted: Vec<f64> = self.history.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let rank = match self.tail {
            Tail::Upper => self.q,
            Tail::Lower => 1.0 - self.q,
        };
        quantile_sorted(&sorted, rank)
    }

    /// Classify against the history as it stands; the score itself is not in it.
    pub fn classify(&self, score: f64) -> bool {
        match (self.threshold(), self.tail) {
            (None, _) => false,
            (Some(t), Tail::Upper) => score >= t,
            (Some(t), Tail::Lower) => score <= t,
        }
    }

    /// Append a score, evicting the oldest once full.
    pub fn observe(&mut self, score: f64) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(score);
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn tail(&self) -> Tail {
        self.tail
    }

    pub fn history(&self) -> impl Iterator<Item = f64> + '_ {
        self.history.iter().copied()
    }

    pub(crate) fn matches(&self, config: &ClassifierConfig) -> bool {
        self.q == config.q
            && self.capacity == config.capacity
            && self.min_samples == config.min_samples
    }
}
