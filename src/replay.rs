// src/replay.rs
//
// Frame-log writer/reader for deterministic replay.
//
// A recorded session is one TelemetryFrame per JSONL line, in arrival
// order (not timestamp order; the reorder buffer must see the same
// sequence on replay to make the same decisions).

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::CoachError;
use crate::types::TelemetryFrame;

/// Append-style frame log writer.
pub struct FrameLogWriter {
    writer: BufWriter<File>,
}

impl FrameLogWriter {
    pub fn create(path: &Path) -> Result<Self, CoachError> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn write_frame(&mut self, frame: &TelemetryFrame) -> Result<(), CoachError> {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<(), CoachError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Read a recorded session back, preserving arrival order. Lines that fail
/// to parse abort the read; a truncated log is not a valid replay source.
pub fn read_frame_log(path: &Path) -> Result<Vec<TelemetryFrame>, CoachError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut frames = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        frames.push(serde_json::from_str(&line)?);
    }
    Ok(frames)
}
