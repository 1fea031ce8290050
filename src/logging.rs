// src/logging.rs
//
// Event sinks for apexcoach.
// - EventSink: trait used by the decision pipeline
// - NoopSink:  discards all events
// - FileSink:  writes one JSON-like line per decision cycle for
//   backtesting / offline analysis

use std::fs::File;
use std::io::{self, BufWriter, Write};

use crate::types::{CoachingRecommendation, LapNumber};

/// Per-cycle summary handed to the sink after every completed lap.
#[derive(Debug, Clone, Copy)]
pub struct CycleRecord<'a> {
    pub lap: LapNumber,
    pub lap_valid: bool,
    pub observations: usize,
    pub candidates: usize,
    pub recommendations: &'a [CoachingRecommendation],
    /// The estimator sub-budget forced the heuristic path this cycle.
    pub degraded: bool,
    pub elapsed_ms: f64,
}

/// Abstract sink for per-cycle telemetry.
pub trait EventSink {
    fn log_cycle(&mut self, record: &CycleRecord<'_>);
}

impl<T: EventSink + ?Sized> EventSink for Box<T> {
    fn log_cycle(&mut self, record: &CycleRecord<'_>) {
        (**self).log_cycle(record)
    }
}

/// Sink that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn log_cycle(&mut self, _record: &CycleRecord<'_>) {
        // intentionally no-op
    }
}

/// JSONL file sink.
///
/// Each cycle is written as a single JSON object on its own line. The
/// payload is kept small and encoded manually.
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    /// Create a new sink writing to `path`.
    pub fn create(path: &str) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl EventSink for FileSink {
    fn log_cycle(&mut self, record: &CycleRecord<'_>) {
        let mut recs = String::new();
        for (i, r) in record.recommendations.iter().enumerate() {
            if i > 0 {
                recs.push(',');
            }
            recs.push_str(&format!(
                "{{\"corner\":\"{}\",\"action\":\"{}\",\"intensity\":\"{}\",\"theme\":\"{}\"}}",
                r.corner_id,
                r.action.as_str(),
                r.intensity.as_str(),
                r.theme.as_str(),
            ));
        }

        let line = format!(
            "{{\
                \"lap\":{},\
                \"lap_valid\":{},\
                \"observations\":{},\
                \"candidates\":{},\
                \"recommendations\":[{}],\
                \"degraded\":{},\
                \"elapsed_ms\":{}\
            }}\n",
            record.lap,
            record.lap_valid,
            record.observations,
            record.candidates,
            recs,
            record.degraded,
            record.elapsed_ms,
        );

        // If logging fails we don't want to crash the pipeline,
        // so we deliberately ignore I/O errors.
        let _ = self.writer.write_all(line.as_bytes());
        let _ = self.writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionClass, CoachingTheme, CornerId, Intensity, TurnPhase};

    #[test]
    fn file_sink_writes_one_line_per_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cycles.jsonl");
        let path_str = path.to_str().unwrap().to_string();

        let recs = [CoachingRecommendation {
            corner_id: CornerId::new(1, 4),
            phase: TurnPhase::Entry,
            action: ActionClass::BrakeEarlier,
            intensity: Intensity::Progressive,
            theme: CoachingTheme::Pace,
        }];
        {
            let mut sink = FileSink::create(&path_str).unwrap();
            sink.log_cycle(&CycleRecord {
                lap: 5,
                lap_valid: true,
                observations: 9,
                candidates: 3,
                recommendations: &recs,
                degraded: false,
                elapsed_ms: 2.5,
            });
            sink.log_cycle(&CycleRecord {
                lap: 6,
                lap_valid: false,
                observations: 0,
                candidates: 0,
                recommendations: &[],
                degraded: true,
                elapsed_ms: 0.4,
            });
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        // Every line parses as JSON.
        for line in lines {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(v.get("lap").is_some());
        }
        assert!(contents.contains("brake_earlier"));
    }
}
