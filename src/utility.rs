// src/utility.rs
//
// Expected-gain estimation for candidates, as a strategy interface with two
// implementations behind one facade:
//
//  - `LearnedModel`: trained incrementally from realized reviewer outcomes,
//    per (action, corner speed class) bucket, with confidence calibrated by
//    sample count and outcome variance.
//  - `HeuristicModel`: conservative rule-based table, used whenever the
//    learned model is under-trained, under-confident, or out of time.
//
// Which path answered is recorded on the estimate; the choice is
// deterministic given the same training snapshot.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::candidates::Candidate;
use crate::config::UtilityConfig;
use crate::metrics::OnlineStats;
use crate::types::{ActionClass, AssistClass, FilterKey, InputDevice, Intensity, SlipState};

/// Coarse corner classification by minimum speed, used to bucket gains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpeedClass {
    Slow,
    Medium,
    Fast,
}

impl SpeedClass {
    pub fn from_min_speed_kmh(v: f64) -> Self {
        if v < 120.0 {
            SpeedClass::Slow
        } else if v < 180.0 {
            SpeedClass::Medium
        } else {
            SpeedClass::Fast
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpeedClass::Slow => "slow",
            SpeedClass::Medium => "medium",
            SpeedClass::Fast => "fast",
        }
    }
}

/// Context a cycle hands to the estimator alongside the candidate itself.
#[derive(Debug, Clone, Copy)]
pub struct UtilityContext {
    pub speed_class: SpeedClass,
    pub filter_key: FilterKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateSource {
    Learned,
    Heuristic,
}

impl EstimateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EstimateSource::Learned => "learned",
            EstimateSource::Heuristic => "heuristic",
        }
    }
}

/// Expected gain for one candidate, one cycle. Transient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtilityEstimate {
    pub expected_gain_ms: f64,
    /// Calibrated confidence in [0, 1].
    pub confidence: f64,
    pub source: EstimateSource,
}

/// Conservative rule-based estimate. Base gains per action and corner speed
/// class, scaled by intensity and discounted for slip and context.
#[derive(Debug, Clone, Default)]
pub struct HeuristicModel;

impl HeuristicModel {
    fn base_gain_ms(action: ActionClass, class: SpeedClass) -> f64 {
        match (action, class) {
            (ActionClass::BrakeEarlier, SpeedClass::Slow) => 30.0,
            (ActionClass::BrakeEarlier, SpeedClass::Medium) => 20.0,
            (ActionClass::BrakeEarlier, SpeedClass::Fast) => 15.0,
            (ActionClass::BuildPressureFaster, SpeedClass::Slow) => 15.0,
            (ActionClass::BuildPressureFaster, SpeedClass::Medium) => 25.0,
            (ActionClass::BuildPressureFaster, SpeedClass::Fast) => 20.0,
            (ActionClass::ReleaseEarlier, SpeedClass::Slow) => 10.0,
            (ActionClass::ReleaseEarlier, SpeedClass::Medium) => 15.0,
            (ActionClass::ReleaseEarlier, SpeedClass::Fast) => 12.0,
            (ActionClass::ThrottleEarlierProgressive, SpeedClass::Slow) => 20.0,
            (ActionClass::ThrottleEarlierProgressive, SpeedClass::Medium) => 35.0,
            (ActionClass::ThrottleEarlierProgressive, SpeedClass::Fast) => 45.0,
            (ActionClass::ReduceSteerThenThrottle, SpeedClass::Slow) => 5.0,
            (ActionClass::ReduceSteerThenThrottle, SpeedClass::Medium) => 10.0,
            (ActionClass::ReduceSteerThenThrottle, SpeedClass::Fast) => 15.0,
        }
    }

    fn intensity_mult(intensity: Intensity) -> f64 {
        match intensity {
            Intensity::VerySoft => 0.5,
            Intensity::Soft => 0.7,
            Intensity::Progressive => 1.0,
            Intensity::Fast => 1.3,
        }
    }

    pub fn estimate(&self, candidate: &Candidate, ctx: &UtilityContext) -> UtilityEstimate {
        let mut gain = Self::base_gain_ms(candidate.action, ctx.speed_class)
            * Self::intensity_mult(candidate.intensity);

        // Slip discount: a compromised corner yields less and risks more.
        gain *= match candidate.slip.worst() {
            SlipState::Green => 1.0,
            SlipState::Yellow => 0.7,
            SlipState::Red => 0.3,
        };

        // Already close to the reference leaves little on the table; far from
        // it leaves more.
        let abs_delta = candidate.delta_ms.abs();
        if abs_delta < 50.0 {
            gain *= 0.6;
        } else if abs_delta > 200.0 {
            gain *= 1.3;
        }

        if ctx.filter_key.device == InputDevice::Pad {
            gain *= 0.8;
        }
        if ctx.filter_key.assists == AssistClass::Full {
            gain *= 0.9;
        }

        UtilityEstimate {
            expected_gain_ms: gain.max(5.0),
            confidence: 0.4,
            source: EstimateSource::Heuristic,
        }
    }
}

/// Online model over realized outcomes, bucketed by (action, speed class).
///
/// Confidence grows with sample count and shrinks with outcome variance,
/// which keeps the facade on the heuristic path until the buckets have
/// actually seen this kind of tip work.
#[derive(Debug, Clone, Default)]
pub struct LearnedModel {
    buckets: HashMap<(ActionClass, SpeedClass), OnlineStats>,
    total_samples: u64,
}

impl LearnedModel {
    pub fn observe(&mut self, action: ActionClass, class: SpeedClass, realized_gain_ms: f64) {
        self.buckets
            .entry((action, class))
            .or_default()
            .add(realized_gain_ms);
        self.total_samples += 1;
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    fn estimate(&self, candidate: &Candidate, ctx: &UtilityContext) -> Option<UtilityEstimate> {
        let stats = self.buckets.get(&(candidate.action, ctx.speed_class))?;
        let n = stats.n();
        if n < 3 {
            return None;
        }
        let mean = stats.mean();
        let sd = stats.variance_population().sqrt();
        // Calibration: saturating in n, penalized by the coefficient of
        // variation of observed outcomes.
        let n_term = n as f64 / (n as f64 + 10.0);
        let spread_term = 1.0 / (1.0 + sd / mean.abs().max(1.0));
        let confidence = (n_term * spread_term).clamp(0.0, 1.0);
        Some(UtilityEstimate {
            expected_gain_ms: mean * HeuristicModel::intensity_mult(candidate.intensity),
            confidence,
            source: EstimateSource::Learned,
        })
    }
}

/// Facade selecting between the learned and heuristic paths.
#[derive(Debug, Clone, Default)]
pub struct UtilityEstimator {
    pub learned: LearnedModel,
    heuristic: HeuristicModel,
}

impl UtilityEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Estimate a candidate's expected gain.
    ///
    /// `within_budget` is false when the cycle's estimator sub-budget has
    /// already run out; the heuristic then answers unconditionally.
    pub fn estimate(
        &self,
        candidate: &Candidate,
        ctx: &UtilityContext,
        cfg: &UtilityConfig,
        within_budget: bool,
    ) -> UtilityEstimate {
        if within_budget && self.learned.total_samples() >= cfg.min_training_samples as u64 {
            if let Some(est) = self.learned.estimate(candidate, ctx) {
                if est.confidence >= cfg.confidence_threshold {
                    return est;
                }
                debug!(
                    action = candidate.action.as_str(),
                    confidence = est.confidence,
                    "learned estimate below confidence threshold; using heuristic"
                );
            }
        }
        self.heuristic.estimate(candidate, ctx)
    }

    /// Feed one realized outcome back into the learned model.
    pub fn train(&mut self, action: ActionClass, class: SpeedClass, realized_gain_ms: f64) {
        self.learned.observe(action, class, realized_gain_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::PhaseSlip;
    use crate::types::{CoachingTheme, CornerId};

    fn candidate(action: ActionClass, intensity: Intensity, slip: SlipState) -> Candidate {
        Candidate {
            corner_id: CornerId::new(1, 1),
            phase: action.phase(),
            action,
            intensity,
            theme: CoachingTheme::Pace,
            slip: PhaseSlip {
                entry: slip,
                exit: slip,
            },
            impact: 1.0,
            delta_ms: 120.0,
        }
    }

    fn ctx() -> UtilityContext {
        UtilityContext {
            speed_class: SpeedClass::Medium,
            filter_key: FilterKey {
                assists: AssistClass::None,
                device: InputDevice::Wheel,
            },
        }
    }

    #[test]
    fn heuristic_discounts_yellow_slip() {
        let h = HeuristicModel;
        let green = h.estimate(
            &candidate(ActionClass::BrakeEarlier, Intensity::Progressive, SlipState::Green),
            &ctx(),
        );
        let yellow = h.estimate(
            &candidate(ActionClass::BrakeEarlier, Intensity::Progressive, SlipState::Yellow),
            &ctx(),
        );
        assert!(yellow.expected_gain_ms < green.expected_gain_ms);
        assert_eq!(yellow.source, EstimateSource::Heuristic);
    }

    #[test]
    fn untrained_estimator_uses_heuristic() {
        let est = UtilityEstimator::new();
        let out = est.estimate(
            &candidate(ActionClass::BrakeEarlier, Intensity::Progressive, SlipState::Green),
            &ctx(),
            &UtilityConfig::default(),
            true,
        );
        assert_eq!(out.source, EstimateSource::Heuristic);
    }

    #[test]
    fn consistent_outcomes_promote_the_learned_path() {
        let mut est = UtilityEstimator::new();
        let cfg = UtilityConfig::default();
        for _ in 0..cfg.min_training_samples + 10 {
            est.train(ActionClass::BrakeEarlier, SpeedClass::Medium, 40.0);
        }
        let out = est.estimate(
            &candidate(ActionClass::BrakeEarlier, Intensity::Progressive, SlipState::Green),
            &ctx(),
            &cfg,
            true,
        );
        assert_eq!(out.source, EstimateSource::Learned);
        assert!((out.expected_gain_ms - 40.0).abs() < 1.0);
        assert!(out.confidence >= cfg.confidence_threshold);
    }

    #[test]
    fn noisy_outcomes_fall_back_to_heuristic() {
        let mut est = UtilityEstimator::new();
        let cfg = UtilityConfig::default();
        for i in 0..cfg.min_training_samples + 10 {
            // Wildly alternating outcomes keep the spread term low.
            let gain = if i % 2 == 0 { 200.0 } else { -180.0 };
            est.train(ActionClass::BrakeEarlier, SpeedClass::Medium, gain);
        }
        let out = est.estimate(
            &candidate(ActionClass::BrakeEarlier, Intensity::Progressive, SlipState::Green),
            &ctx(),
            &cfg,
            true,
        );
        assert_eq!(out.source, EstimateSource::Heuristic);
    }

    #[test]
    fn exhausted_budget_forces_heuristic() {
        let mut est = UtilityEstimator::new();
        let cfg = UtilityConfig::default();
        for _ in 0..cfg.min_training_samples + 10 {
            est.train(ActionClass::BrakeEarlier, SpeedClass::Medium, 40.0);
        }
        let out = est.estimate(
            &candidate(ActionClass::BrakeEarlier, Intensity::Progressive, SlipState::Green),
            &ctx(),
            &cfg,
            false,
        );
        assert_eq!(out.source, EstimateSource::Heuristic);
    }

    #[test]
    fn same_snapshot_same_estimate() {
        let mut est = UtilityEstimator::new();
        for _ in 0..80 {
            est.train(ActionClass::ReleaseEarlier, SpeedClass::Medium, 25.0);
        }
        let c = candidate(ActionClass::ReleaseEarlier, Intensity::Soft, SlipState::Green);
        let cfg = UtilityConfig::default();
        let a = est.estimate(&c, &ctx(), &cfg, true);
        let b = est.estimate(&c, &ctx(), &cfg, true);
        assert_eq!(a, b);
    }
}
