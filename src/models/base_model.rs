use crate::observation::Observation;

/// A common Rust trait for streaming anomaly models.
pub trait BaseModel {
    /// Incorporate one instance.
    fn learn_one(&mut self, x: &Observation);

    /// Score one instance without changing the model.
    fn score_one(&self, x: &Observation) -> f64;

    /// Default: score, then learn. Never the other way round.
    fn score_learn_one(&mut self, x: &Observation) -> f64 {
        let score = self.score_one(x);
        self.learn_one(x);
        score
    }

    /// Default: learn a batch of instances.
    fn learn_many(&mut self, xs: &[Observation]) {
        for x in xs {
            self.learn_one(x);
        }
    }

    /// Default: score a batch.
    fn score_many(&self, xs: &[Observation]) -> Vec<f64> {
        xs.iter().map(|x| self.score_one(x)).collect()
    }

    /// Default: score+learn a batch.
    fn score_learn_many(&mut self, xs: &[Observation]) -> Vec<f64> {
        xs.iter().map(|x| self.score_learn_one(x)).collect()
    }
}
