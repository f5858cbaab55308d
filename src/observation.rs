//! Feature vectors and record cleaning.
//!
//! Absent, empty, unparsable and non-finite values are dropped rather than
//! defaulted, so a missing sensor reading never looks like a zero.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::InputError;

/// One observation: feature name to finite value.
pub type Observation = HashMap<String, f64>;

/// Score and flag emitted for one observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub score: f64,
    pub is_anomaly: bool,
}

fn in_schema(schema: Option<&[String]>, name: &str) -> bool {
    schema.map_or(true, |s| s.iter().any(|f| f == name))
}

/// Numeric value of a text cell.
pub fn parse_text(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Numeric value of a JSON field, accepting numeric strings.
pub fn parse_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => parse_text(s),
        _ => None,
    }
}

/// Build an observation from a JSON object (a request body).
pub fn from_json(event: &Value, schema: Option<&[String]>) -> Result<Observation, InputError> {
    let map = event.as_object().ok_or(InputError::NotAnObject)?;
    let x: Observation = map
        .iter()
        .filter(|(name, _)| in_schema(schema, name))
        .filter_map(|(name, value)| parse_value(value).map(|v| (name.clone(), v)))
        .collect();
    non_empty(x)
}

/// Build an observation from textual `(column, cell)` pairs (a CSV row).
pub fn from_fields<'a, I>(fields: I, schema: Option<&[String]>) -> Result<Observation, InputError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let x: Observation = fields
        .into_iter()
        .filter(|(name, _)| in_schema(schema, name))
        .filter_map(|(name, cell)| parse_text(cell).map(|v| (name.to_string(), v)))
        .collect();
    non_empty(x)
}

/// Drop non-finite entries from an already numeric map.
pub fn sanitize(x: &Observation) -> Result<Observation, InputError> {
    let clean: Observation = x
        .iter()
        .filter(|(_, v)| v.is_finite())
        .map(|(k, v)| (k.clone(), *v))
        .collect();
    non_empty(clean)
}

fn non_empty(x: Observation) -> Result<Observation, InputError> {
    if x.is_empty() {
        Err(InputError::Empty)
    } else {
        Ok(x)
    }
}
