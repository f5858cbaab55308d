//! Offline replay of telemetry CSV files through the pipeline.

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::{info, warn};

use crate::error::{InputError, Result};
use crate::observation::{from_fields, Observation};
use crate::pipeline::Pipeline;

pub const TIME_COL: &str = "timestamp";
pub const ID_COL: &str = "machine_id";

/// One cleaned input row with its pass-through identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: String,
    pub machine_id: String,
    pub features: Observation,
}

/// A row as read: usable, or rejected with the reason.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Valid(Record),
    Rejected { line: u64, error: InputError },
}

/// Output row, mirroring the identity columns of the input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRow {
    pub timestamp: String,
    pub machine_id: String,
    pub score: f64,
    pub is_anomaly: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ReplaySummary {
    pub rows: u64,
    pub scored: u64,
    pub skipped: u64,
    pub anomalies: u64,
}

/// Iterator over the rows of a headed CSV source.
pub struct RecordStream<R: Read> {
    reader: csv::Reader<R>,
    headers: StringRecord,
    schema: Option<Vec<String>>,
    line: u64,
}

impl<R: Read> RecordStream<R> {
    pub fn new(reader: R, schema: Option<Vec<String>>) -> Result<Self> {
        // Short rows leave their trailing features absent.
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        let headers = reader.headers()?.to_owned();
        Ok(RecordStream {
            reader,
            headers,
            schema,
            line: 1,
        })
    }

    fn parse(&self, record: &StringRecord) -> Row {
        let mut timestamp = String::new();
        let mut machine_id = String::new();
        let mut fields = Vec::with_capacity(record.len());
        for (header, cell) in self.headers.iter().zip(record.iter()) {
            match header {
                TIME_COL => timestamp = cell.to_string(),
                ID_COL => machine_id = cell.to_string(),
                _ => fields.push((header, cell)),
            }
        }
        match from_fields(fields, self.schema.as_deref()) {
            Ok(features) => Row::Valid(Record {
                timestamp,
                machine_id,
                features,
            }),
            Err(error) => Row::Rejected {
                line: self.line,
                error,
            },
        }
    }
}

impl<R: Read> Iterator for RecordStream<R> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut record = StringRecord::new();
        match self.reader.read_record(&mut record) {
            Ok(true) => {
                self.line += 1;
                Some(Ok(self.parse(&record)))
            }
            Ok(false) => None,
            Err(e) => Some(Err(e.into())),
        }
    }
}

/// Load every usable row, returning them with the number rejected.
pub fn read_records<R: Read>(reader: R, schema: Option<Vec<String>>) -> Result<(Vec<Record>, u64)> {
    let mut records = Vec::new();
    let mut rejected = 0;
    for row in RecordStream::new(reader, schema)? {
        match row? {
            Row::Valid(record) => records.push(record),
            Row::Rejected { line, error } => {
                warn!(line, %error, "Skipping row");
                rejected += 1;
            }
        }
    }
    Ok((records, rejected))
}

/// Order records by timestamp, then machine, keeping input order for ties.
pub fn sort_chronologically(records: &mut [Record]) {
    records.sort_by(|a, b| {
        (a.timestamp.as_str(), a.machine_id.as_str())
            .cmp(&(b.timestamp.as_str(), b.machine_id.as_str()))
    });
}

/// Score every row of `reader` in order, learning as it goes, and write one
/// output row per scored input row.
pub fn stream_csv<R: Read, W: Write>(
    reader: R,
    writer: W,
    pipeline: &mut Pipeline,
) -> Result<ReplaySummary> {
    let schema = pipeline.config().detector.features.clone();
    let mut out = WriterBuilder::new().has_headers(true).from_writer(writer);
    let mut summary = ReplaySummary::default();

    for row in RecordStream::new(reader, schema)? {
        summary.rows += 1;
        let record = match row? {
            Row::Valid(record) => record,
            Row::Rejected { line, error } => {
                warn!(line, %error, "Skipping row");
                summary.skipped += 1;
                continue;
            }
        };
        let verdict = match pipeline.process(&record.features) {
            Ok(verdict) => verdict,
            Err(error) => {
                warn!(machine_id = %record.machine_id, %error, "Skipping row");
                summary.skipped += 1;
                continue;
            }
        };
        summary.scored += 1;
        if verdict.is_anomaly {
            summary.anomalies += 1;
        }
        out.serialize(ScoredRow {
            timestamp: record.timestamp,
            machine_id: record.machine_id,
            score: verdict.score,
            is_anomaly: u8::from(verdict.is_anomaly),
        })?;
    }
    out.flush()?;
    info!(
        rows = summary.rows,
        scored = summary.scored,
        skipped = summary.skipped,
        anomalies = summary.anomalies,
        "Replay complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, DEFAULT_FEATURES};
    use std::io::Cursor;

    const CSV: &str = "\
timestamp,machine_id,rpm_variance,idle_time_mins
2024-01-01T00:00:00,EXC-1,3.5,12
2024-01-01T01:00:00,EXC-2,,
2024-01-01T02:00:00,EXC-1,4.0,oops
";

    #[test]
    fn test_record_stream_parses_and_rejects() {
        let rows: Vec<Row> = RecordStream::new(Cursor::new(CSV), None)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(rows.len(), 3);
        match &rows[0] {
            Row::Valid(record) => {
                assert_eq!(record.machine_id, "EXC-1");
                assert_eq!(record.timestamp, "2024-01-01T00:00:00");
                assert_eq!(record.features.len(), 2);
            }
            other => panic!("unexpected row {other:?}"),
        }
        assert_eq!(
            rows[1],
            Row::Rejected {
                line: 3,
                error: InputError::Empty
            }
        );
        match &rows[2] {
            Row::Valid(record) => assert_eq!(record.features.len(), 1),
            other => panic!("unexpected row {other:?}"),
        }
    }

    #[test]
    fn test_numeric_machine_id_is_not_a_feature() {
        let csv = "machine_id,rpm_variance\n7,1.0\n";
        let (records, rejected) = read_records(Cursor::new(csv), None).unwrap();
        assert_eq!(rejected, 0);
        assert_eq!(records[0].machine_id, "7");
        assert!(!records[0].features.contains_key(ID_COL));
    }

    #[test]
    fn test_stream_csv_writes_scored_rows() {
        let mut pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
        let mut out = Vec::new();
        let summary = stream_csv(Cursor::new(CSV), &mut out, &mut pipeline).unwrap();
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.scored, 2);
        assert_eq!(summary.skipped, 1);

        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("timestamp,machine_id,score,is_anomaly"));
        assert_eq!(lines.next(), Some("2024-01-01T00:00:00,EXC-1,0.0,0"));
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_short_row_does_not_stop_replay() {
        let csv = "\
timestamp,machine_id,rpm_variance,idle_time_mins
t0,EXC-1,3.5,12
t1,EXC-1,4.0
t2,EXC-1,3.9,11
";
        let mut pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
        let mut out = Vec::new();
        let summary = stream_csv(Cursor::new(csv), &mut out, &mut pipeline).unwrap();
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.scored, 3);
        assert_eq!(pipeline.processed(), 3);

        let text = String::from_utf8(out).unwrap();
        assert!(text.lines().last().unwrap().starts_with("t2,EXC-1,"));
    }

    #[test]
    fn test_short_row_with_no_features_is_skipped() {
        let csv = "timestamp,machine_id,rpm_variance\nt0,EXC-1\nt1,EXC-1,2.0\n";
        let (records, rejected) = read_records(Cursor::new(csv), None).unwrap();
        assert_eq!(rejected, 1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, "t1");
    }

    #[test]
    fn test_extra_numeric_column_never_becomes_a_feature() {
        let csv = "\
timestamp,machine_id,rpm_variance,idle_time_mins,is_anomaly_label
t0,EXC-1,3.5,12,0
t1,EXC-2,4.0,10,1
";
        let mut pipeline = Pipeline::new(PipelineConfig::load_or_telemetry(None).unwrap()).unwrap();
        let mut out = Vec::new();
        stream_csv(Cursor::new(csv), &mut out, &mut pipeline).unwrap();

        let features = pipeline.detector().features();
        assert_eq!(features.len(), DEFAULT_FEATURES.len());
        assert!(features.iter().all(|f| f != "is_anomaly_label"));
        assert!(pipeline.scaler().range("is_anomaly_label").is_none());
        // Features missing from the first row stay in the schema.
        assert!(features.iter().any(|f| f == "battery_low_voltage_events"));
    }

    #[test]
    fn test_sort_chronologically() {
        let record = |t: &str, m: &str| Record {
            timestamp: t.to_string(),
            machine_id: m.to_string(),
            features: Observation::new(),
        };
        let mut records = vec![record("t2", "A"), record("t1", "B"), record("t1", "A")];
        sort_chronologically(&mut records);
        let order: Vec<(&str, &str)> = records
            .iter()
            .map(|r| (r.timestamp.as_str(), r.machine_id.as_str()))
            .collect();
        assert_eq!(order, vec![("t1", "A"), ("t1", "B"), ("t2", "A")]);
    }
}
