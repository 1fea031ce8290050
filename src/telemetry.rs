//! telemetry.rs
//!
//! Lightweight JSONL telemetry sink for apexcoach.
//!
//! # Goals
//!
//! - Provide a simple, low-overhead way to write one JSON object per
//!   review outcome (or KPI event) to a file, for the external dashboard
//!   to pick up.
//! - Controlled entirely via environment variables so experiments can
//!   turn telemetry on/off without code changes.
//!
//! # Environment variables
//!
//! - `APEXCOACH_TELEMETRY_MODE`: `"off"` (default) disables telemetry,
//!   `"jsonl"` writes JSONL to `APEXCOACH_TELEMETRY_PATH`.
//! - `APEXCOACH_TELEMETRY_PATH`: Path to the JSONL file. Required when
//!   mode is `"jsonl"`.
//! - `APEXCOACH_TELEMETRY_APPEND`: Optional. When set to
//!   `"1"`/`"true"`/`"yes"`, appends to existing files instead of
//!   truncating. Default is truncate.
//!
//! Writes never fail the caller: a sink that cannot be opened degrades to
//! off, and I/O errors on the hot path are swallowed.

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::types::ReviewEvent;

enum SinkMode {
    Off,
    Jsonl(BufWriter<File>),
}

/// JSONL telemetry sink. Construct once per session.
pub struct TelemetrySink {
    mode: SinkMode,
}

impl TelemetrySink {
    /// Build a sink from the environment. Any misconfiguration degrades to
    /// an off sink with a warning, never an error.
    pub fn from_env() -> Self {
        let mode = env::var("APEXCOACH_TELEMETRY_MODE").unwrap_or_default();
        if !mode.eq_ignore_ascii_case("jsonl") {
            return Self { mode: SinkMode::Off };
        }

        let Ok(path) = env::var("APEXCOACH_TELEMETRY_PATH") else {
            warn!("APEXCOACH_TELEMETRY_MODE=jsonl but APEXCOACH_TELEMETRY_PATH unset; telemetry off");
            return Self { mode: SinkMode::Off };
        };

        let append = env::var("APEXCOACH_TELEMETRY_APPEND")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Self::to_path(PathBuf::from(path), append)
    }

    /// Build a sink writing to an explicit path.
    pub fn to_path(path: PathBuf, append: bool) -> Self {
        let file = if append {
            OpenOptions::new().create(true).append(true).open(&path)
        } else {
            File::create(&path)
        };
        match file {
            Ok(f) => Self {
                mode: SinkMode::Jsonl(BufWriter::new(f)),
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "telemetry sink unavailable");
                Self { mode: SinkMode::Off }
            }
        }
    }

    pub fn off() -> Self {
        Self { mode: SinkMode::Off }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.mode, SinkMode::Jsonl(_))
    }

    /// Write one arbitrary JSON record as a line.
    pub fn log_json<T: Serialize>(&mut self, record: &T) {
        let SinkMode::Jsonl(writer) = &mut self.mode else {
            return;
        };
        if let Ok(mut line) = serde_json::to_string(record) {
            line.push('\n');
            let _ = writer.write_all(line.as_bytes());
            let _ = writer.flush();
        }
    }

    /// Write one review outcome event.
    pub fn log_review(&mut self, event: &ReviewEvent) {
        if !self.is_enabled() {
            return;
        }
        let record = json!({
            "kind": "review_outcome",
            "corner": event.corner_id.to_string(),
            "action": event.action.as_str(),
            "outcome": event.outcome.as_str(),
            "realized_delta": event.realized_delta,
            "lap": event.lap,
        });
        self.log_json(&record);
    }

    /// Write a degraded-cycle event (estimator fell back to the heuristic
    /// past its sub-budget).
    pub fn log_degraded_cycle(&mut self, lap: u32, elapsed_ms: f64) {
        if !self.is_enabled() {
            return;
        }
        let record = json!({
            "kind": "degraded_cycle",
            "lap": lap,
            "elapsed_ms": elapsed_ms,
        });
        self.log_json(&record);
    }
}
