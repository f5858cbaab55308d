use numpy::{PyArray1, PyArray2};
use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::path::Path;

use crate::config::PipelineConfig;
use crate::error::{DetectorError, InputError};
use crate::observation::{parse_text, Observation, Verdict};
use crate::pipeline::Pipeline;

fn to_py_err(err: DetectorError) -> PyErr {
    match err {
        DetectorError::Io(e) => PyIOError::new_err(e.to_string()),
        other => PyValueError::new_err(other.to_string()),
    }
}

fn input_err(err: InputError) -> PyErr {
    PyValueError::new_err(err.to_string())
}

/// Parse `config_json`, falling back to the telemetry schema.
fn config_from(config_json: Option<&str>) -> PyResult<PipelineConfig> {
    match config_json {
        Some(json) => PipelineConfig::from_json(json).map_err(to_py_err),
        None => Ok(PipelineConfig::telemetry()),
    }
}

/// Numeric entries of a Python dict; anything else is dropped.
fn observation_from_dict(event: &PyDict) -> Observation {
    let mut x = Observation::with_capacity(event.len());
    for (key, value) in event.iter() {
        let Ok(name) = key.extract::<String>() else {
            continue;
        };
        let parsed = if let Ok(v) = value.extract::<f64>() {
            Some(v).filter(|v| v.is_finite())
        } else if let Ok(s) = value.extract::<&str>() {
            parse_text(s)
        } else {
            None
        };
        if let Some(v) = parsed {
            x.insert(name, v);
        }
    }
    x
}

/// Online detector over dict-shaped events.
#[pyclass]
pub struct StreamingDetector {
    pipeline: Pipeline,
}

impl StreamingDetector {
    fn run(&mut self, event: &PyDict, learn: bool) -> PyResult<Verdict> {
        let x = observation_from_dict(event);
        self.pipeline.predict_and_learn(&x, learn).map_err(input_err)
    }
}

#[pymethods]
impl StreamingDetector {
    #[new]
    #[pyo3(signature = (config_json = None))]
    fn new(config_json: Option<&str>) -> PyResult<Self> {
        let config = config_from(config_json)?;
        Ok(StreamingDetector {
            pipeline: Pipeline::new(config).map_err(to_py_err)?,
        })
    }

    /// Score, classify and learn one event. Returns `(score, is_anomaly)`.
    fn process(&mut self, event: &PyDict) -> PyResult<(f64, bool)> {
        let v = self.run(event, true)?;
        Ok((v.score, v.is_anomaly))
    }

    #[pyo3(signature = (event, learn = false))]
    fn predict(&mut self, event: &PyDict, learn: bool) -> PyResult<(f64, bool)> {
        let v = self.run(event, learn)?;
        Ok((v.score, v.is_anomaly))
    }

    /// Score each row of a 2-D array in order. Rows without a usable value
    /// get a NaN score and are never flagged.
    #[pyo3(signature = (array, columns, learn = false))]
    fn score_batch<'py>(
        &mut self,
        py: Python<'py>,
        array: &PyArray2<f64>,
        columns: Vec<String>,
        learn: bool,
    ) -> PyResult<(&'py PyArray1<f64>, Vec<bool>)> {
        let view = array.readonly();
        let matrix = view.as_array();
        if matrix.ncols() != columns.len() {
            return Err(input_err(InputError::UnknownFeatureShape {
                columns: columns.len(),
                values: matrix.ncols(),
            }));
        }
        let mut scores = Vec::with_capacity(matrix.nrows());
        let mut flags = Vec::with_capacity(matrix.nrows());
        for row in matrix.outer_iter() {
            let x: Observation = columns
                .iter()
                .zip(row.iter())
                .filter(|(_, v)| v.is_finite())
                .map(|(name, v)| (name.clone(), *v))
                .collect();
            match self.pipeline.predict_and_learn(&x, learn) {
                Ok(v) => {
                    scores.push(v.score);
                    flags.push(v.is_anomaly);
                }
                Err(_) => {
                    scores.push(f64::NAN);
                    flags.push(false);
                }
            }
        }
        Ok((PyArray1::from_vec(py, scores), flags))
    }

    fn save(&self, path: &str) -> PyResult<()> {
        self.pipeline.save(Path::new(path)).map_err(to_py_err)
    }

    /// Restore a saved detector. Without `config_json` the stored config is used.
    #[staticmethod]
    #[pyo3(signature = (path, config_json = None))]
    fn load(path: &str, config_json: Option<&str>) -> PyResult<Self> {
        let pipeline = match config_json {
            Some(json) => {
                let config = config_from(Some(json))?;
                Pipeline::load(Path::new(path), &config)
            }
            None => Pipeline::load_with_stored_config(Path::new(path)),
        }
        .map_err(to_py_err)?;
        Ok(StreamingDetector { pipeline })
    }

    fn threshold(&self) -> Option<f64> {
        self.pipeline.threshold()
    }

    #[getter]
    fn processed(&self) -> u64 {
        self.pipeline.processed()
    }

    fn reset(&mut self) {
        self.pipeline.reset();
    }
}
