// src/reviewer.rs
//
// Reviewer: watches the laps after a tip was issued and classifies the
// driver's response.
//
// State machine per issued tip, terminal states only:
//
//   Pending -> Success   metric moved the intended way, exit/apex speed
//                        held, affected phase never went Red
//   Pending -> Overshoot metric moved but the phase went Red or the corner
//                        got slower
//   Pending -> NoAttempt window expired with the metric inside the noise
//                        band of the pre-tip baseline
//
// Invalid laps neither confirm nor deny an attempt; they do not consume
// the observation window. A session ending with reviews still pending
// discards them neutrally (no learning updates).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::candidates::{CycleDirective, DirectiveKind};
use crate::config::ReviewerConfig;
use crate::safety::PhaseSlip;
use crate::types::{
    ActionClass, CornerId, CornerObservation, Intensity, LapNumber, MetricKind, ReviewEvent,
    ReviewOutcome, SlipState,
};

/// Pre-tip baseline captured from the observation that triggered the tip.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Baseline {
    pub metric_value: f64,
    pub exit_speed_kmh: f64,
    pub min_speed_kmh: f64,
    pub corner_time_ms: f64,
}

impl Baseline {
    pub fn from_observation(obs: &CornerObservation, metric: MetricKind) -> Self {
        Self {
            metric_value: obs.metric(metric),
            exit_speed_kmh: obs.exit_speed_kmh,
            min_speed_kmh: obs.min_speed_kmh,
            corner_time_ms: obs.corner_time_ms,
        }
    }
}

/// One tip under observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingReview {
    pub corner_id: CornerId,
    pub action: ActionClass,
    pub intensity: Intensity,
    pub lap_issued: LapNumber,
    pub laps_remaining: u32,
    pub baseline: Baseline,
    /// Absolute band around the baseline metric inside which a change is
    /// indistinguishable from noise.
    pub noise_band_abs: f64,
}

/// Terminal resolution of one review, with everything the callers need to
/// close the loop.
#[derive(Debug, Clone)]
pub struct ReviewResolution {
    pub event: ReviewEvent,
    /// Corner-time gain vs the pre-tip baseline, positive = faster. Feeds
    /// the bandit reward and the learned utility model.
    pub realized_gain_ms: f64,
    /// Minimum speed of the resolving lap's observation, for utility-model
    /// bucketing. Zero when the review expired without an attempt.
    pub observed_min_speed_kmh: f64,
    /// Constraint on the next cycle for this corner, when the outcome
    /// demands one.
    pub directive: Option<CycleDirective>,
}

/// The direction the targeted metric is expected to move, as a sign on
/// (new - baseline). Exhaustive over the action classes.
fn intended_sign(action: ActionClass) -> f64 {
    match action {
        // Earlier along the lap = smaller distance mark.
        ActionClass::BrakeEarlier => -1.0,
        // Higher peak pressure.
        ActionClass::BuildPressureFaster => 1.0,
        ActionClass::ReleaseEarlier => -1.0,
        ActionClass::ThrottleEarlierProgressive => -1.0,
        // Gentler opening after unwinding the wheel.
        ActionClass::ReduceSteerThenThrottle => -1.0,
    }
}

#[derive(Debug, Default)]
pub struct Reviewer {
    pending: HashMap<CornerId, PendingReview>,
    /// Reviews discarded neutrally (session end / window starvation).
    pub discarded_neutral: u64,
}

impl Reviewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self, corner: CornerId) -> bool {
        self.pending.contains_key(&corner)
    }

    /// Start observing a freshly issued tip. An older pending review for the
    /// same corner is superseded.
    pub fn open(
        &mut self,
        corner_id: CornerId,
        action: ActionClass,
        intensity: Intensity,
        lap_issued: LapNumber,
        baseline: Baseline,
        noise_band_abs: f64,
        cfg: &ReviewerConfig,
    ) {
        let review = PendingReview {
            corner_id,
            action,
            intensity,
            lap_issued,
            laps_remaining: cfg.observation_window_laps,
            baseline,
            noise_band_abs: noise_band_abs.max(f64::EPSILON),
        };
        if self.pending.insert(corner_id, review).is_some() {
            debug!(corner = %corner_id, "pending review superseded by new tip");
        }
    }

    /// Feed one completed lap. Valid laps consume the observation window
    /// and may terminate reviews; invalid laps are ignored entirely.
    pub fn observe_lap(
        &mut self,
        lap: LapNumber,
        lap_valid: bool,
        observations: &[(CornerObservation, PhaseSlip)],
        cfg: &ReviewerConfig,
    ) -> Vec<ReviewResolution> {
        if !lap_valid {
            return Vec::new();
        }

        let mut resolutions = Vec::new();
        let mut closed: Vec<CornerId> = Vec::new();

        // Deterministic iteration: corner id order.
        let mut corners: Vec<CornerId> = self.pending.keys().copied().collect();
        corners.sort();

        for corner in corners {
            let review = self.pending.get_mut(&corner).expect("key from map");
            // The issuing lap itself is not evidence.
            if lap <= review.lap_issued {
                continue;
            }

            let observed = observations
                .iter()
                .find(|(o, _)| o.corner_id == corner && o.complete);

            if let Some((obs, slip)) = observed {
                if let Some(resolution) = classify(review, obs, *slip, lap, cfg) {
                    resolutions.push(resolution);
                    closed.push(corner);
                    continue;
                }
            }

            review.laps_remaining = review.laps_remaining.saturating_sub(1);
            if review.laps_remaining == 0 {
                resolutions.push(no_attempt_resolution(review, lap));
                closed.push(corner);
            }
        }

        for corner in closed {
            self.pending.remove(&corner);
        }
        resolutions
    }

    /// Session over: everything still pending resolves neutrally, with no
    /// learning updates.
    pub fn discard_all(&mut self) -> usize {
        let n = self.pending.len();
        if n > 0 {
            info!(pending = n, "session ended; pending reviews discarded neutrally");
        }
        self.discarded_neutral += n as u64;
        self.pending.clear();
        n
    }
}

/// Attempt-lap classification. None when the metric stayed inside the noise
/// band (the window keeps running).
fn classify(
    review: &PendingReview,
    obs: &CornerObservation,
    slip: PhaseSlip,
    lap: LapNumber,
    cfg: &ReviewerConfig,
) -> Option<ReviewResolution> {
    let metric = MetricKind::for_action(review.action);
    let delta = obs.metric(metric) - review.baseline.metric_value;
    let moved_intended = delta * intended_sign(review.action) > review.noise_band_abs;
    if !moved_intended {
        return None;
    }

    let realized_gain_ms = review.baseline.corner_time_ms - obs.corner_time_ms;
    let phase_state = crate::safety::governing_state(review.action, slip);
    let went_red = phase_state == SlipState::Red;
    let time_regressed = realized_gain_ms < -cfg.time_regress_tolerance_ms;
    let speed_held = obs.exit_speed_kmh
        >= review.baseline.exit_speed_kmh - cfg.speed_regress_tolerance_kmh
        && obs.min_speed_kmh >= review.baseline.min_speed_kmh - cfg.speed_regress_tolerance_kmh;

    let outcome = if went_red || time_regressed {
        ReviewOutcome::Overshoot
    } else if speed_held {
        ReviewOutcome::Success
    } else {
        ReviewOutcome::Overshoot
    };

    debug!(
        corner = %review.corner_id,
        action = review.action.as_str(),
        outcome = outcome.as_str(),
        "review classified"
    );

    let directive = match outcome {
        ReviewOutcome::Success => None,
        ReviewOutcome::Overshoot => Some(CycleDirective {
            corner_id: review.corner_id,
            kind: DirectiveKind::Soften {
                action: review.action,
                intensity: review.intensity,
            },
        }),
        ReviewOutcome::NoAttempt => unreachable!("no-attempt is resolved at window expiry"),
    };

    Some(ReviewResolution {
        event: ReviewEvent {
            corner_id: review.corner_id,
            action: review.action,
            outcome,
            realized_delta: delta,
            lap,
        },
        realized_gain_ms,
        observed_min_speed_kmh: obs.min_speed_kmh,
        directive,
    })
}

fn no_attempt_resolution(review: &PendingReview, lap: LapNumber) -> ReviewResolution {
    ReviewResolution {
        event: ReviewEvent {
            corner_id: review.corner_id,
            action: review.action,
            outcome: ReviewOutcome::NoAttempt,
            realized_delta: 0.0,
            lap,
        },
        realized_gain_ms: 0.0,
        observed_min_speed_kmh: 0.0,
        directive: Some(CycleDirective {
            corner_id: review.corner_id,
            kind: DirectiveKind::MicroDrill {
                action: review.action,
            },
        }),
    }
}
