// src/error.rs
//
// Typed errors for the few genuinely fallible edges of the crate: sink
// I/O and state snapshot encoding/decoding. The decision path itself never
// returns errors; every failure mode there has a defined degraded-but-safe
// behavior (skip the corner, fall back to the heuristic, drop the frame).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoachError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state snapshot codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
