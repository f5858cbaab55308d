//! Streaming anomaly detection for equipment telemetry with half-space trees.

pub mod config;
pub mod error;
pub mod models;
pub mod observation;
pub mod pipeline;
pub mod replay;
pub mod utils;

#[cfg(feature = "python")]
mod python;

pub use config::{ClassifierConfig, DetectorConfig, PipelineConfig, ScoreSign};
pub use error::{DetectorError, InputError, Result};
pub use models::base_model::BaseModel;
pub use models::hst::HalfSpaceTrees;
pub use observation::{Observation, Verdict};
pub use pipeline::{Pipeline, PipelineState, SharedPipeline, TrainingSummary};

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// A Python module implemented in Rust.
#[cfg(feature = "python")]
#[pymodule]
fn hst_sentinel(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<python::StreamingDetector>()?;
    Ok(())
}
