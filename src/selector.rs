// src/selector.rs
//
// Bandit selector: personalizes the final action choice per corner with
// Thompson sampling over (corner, action_class) arms.
//
//  - Beta(alpha, beta) belief per arm, nudged by the utility estimate.
//  - Cooldown: an arm coached within `cooldown_laps` is excluded, unless
//    its previous outcome was a clear Success or Overshoot (both carry
//    information worth acting on immediately).
//  - Safety interaction: exploration only happens with both phases Green;
//    under Yellow/Red the gated candidate is taken as-is, no sampling.
//
// The RNG is a seeded ChaCha8 stream so a replayed session makes the same
// choices.

use std::collections::HashMap;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::candidates::Candidate;
use crate::config::SelectorConfig;
use crate::safety;
use crate::types::{
    ActionClass, CoachingTheme, CornerId, Intensity, LapNumber, ReviewOutcome,
};
use crate::utility::UtilityEstimate;

/// Belief state for one (corner, action_class) arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditArm {
    /// Beta distribution parameters; successes + 1 / failures + 1.
    pub alpha: f64,
    pub beta: f64,
    pub total_reward_ms: f64,
    pub reward_count: u32,
    pub last_coached_lap: Option<LapNumber>,
    pub last_outcome: Option<ReviewOutcome>,
    pub consecutive_selections: u32,
}

impl Default for BanditArm {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            total_reward_ms: 0.0,
            reward_count: 0,
            last_coached_lap: None,
            last_outcome: None,
            consecutive_selections: 0,
        }
    }
}

impl BanditArm {
    /// Mean of the Beta belief.
    pub fn expected_reward(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// Fold one realized reward into the belief. The reward is normalized
    /// against a 100 ms yardstick and split into success / failure mass.
    fn update(&mut self, reward_ms: f64, confidence: f64) {
        self.total_reward_ms += reward_ms;
        self.reward_count += 1;
        let normalized = (reward_ms / 100.0).clamp(-1.0, 1.0);
        self.alpha += confidence * normalized.max(0.0);
        self.beta += confidence * (-normalized).max(0.0);
    }

    fn effective_cooldown(&self, cfg: &SelectorConfig) -> u32 {
        if self.consecutive_selections >= cfg.max_consecutive_selections {
            cfg.cooldown_laps * 3
        } else {
            cfg.cooldown_laps
        }
    }

    fn in_cooldown(&self, current_lap: LapNumber, cfg: &SelectorConfig) -> bool {
        let Some(coached) = self.last_coached_lap else {
            return false;
        };
        // A clear outcome either way is informative enough to act on
        // immediately.
        if matches!(
            self.last_outcome,
            Some(ReviewOutcome::Success) | Some(ReviewOutcome::Overshoot)
        ) {
            return false;
        }
        current_lap.saturating_sub(coached) <= self.effective_cooldown(cfg)
    }
}

/// All arms for one driver, keyed by corner and action class.
///
/// Persistence goes through `entries` / `from_entries` rather than direct
/// serde on the struct: JSON cannot key maps by composite types.
#[derive(Debug, Clone, Default)]
pub struct BanditState {
    arms: HashMap<CornerId, HashMap<ActionClass, BanditArm>>,
}

impl BanditState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flatten into serde-friendly entries, in deterministic key order.
    pub fn entries(&self) -> Vec<(CornerId, ActionClass, BanditArm)> {
        let mut out = Vec::new();
        for (corner, per_action) in &self.arms {
            for (action, arm) in per_action {
                out.push((*corner, *action, arm.clone()));
            }
        }
        out.sort_by(|a, b| (a.0, a.1.as_str()).cmp(&(b.0, b.1.as_str())));
        out
    }

    pub fn from_entries(entries: Vec<(CornerId, ActionClass, BanditArm)>) -> Self {
        let mut state = Self::default();
        for (corner, action, arm) in entries {
            state.arms.entry(corner).or_default().insert(action, arm);
        }
        state
    }

    pub fn arm(&mut self, corner: CornerId, action: ActionClass) -> &mut BanditArm {
        self.arms.entry(corner).or_default().entry(action).or_default()
    }

    pub fn arm_ref(&self, corner: CornerId, action: ActionClass) -> Option<&BanditArm> {
        self.arms.get(&corner).and_then(|m| m.get(&action))
    }

    /// Apply a reviewer outcome to the arm it concerns.
    /// Success: positive reward. Overshoot: negative reward. NoAttempt:
    /// neutral, no belief update.
    pub fn apply_outcome(
        &mut self,
        corner: CornerId,
        action: ActionClass,
        outcome: ReviewOutcome,
        realized_gain_ms: f64,
    ) {
        let arm = self.arm(corner, action);
        arm.last_outcome = Some(outcome);
        match outcome {
            ReviewOutcome::Success => {
                arm.update(realized_gain_ms.max(10.0), 0.9);
                arm.consecutive_selections = 0;
            }
            ReviewOutcome::Overshoot => {
                arm.update(-realized_gain_ms.abs().max(10.0), 0.9);
            }
            ReviewOutcome::NoAttempt => {
                // Neutral: the arm was never exercised.
            }
        }
    }
}

/// The per-session selector. Holds only the RNG; all belief state is passed
/// in explicitly so it can live in the external repository.
pub struct Selector {
    rng: ChaCha8Rng,
}

impl Selector {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Pick the final action for one corner from its gated candidate and
    /// utility estimate. Returns None when cooldown rules leave nothing to
    /// coach this cycle.
    pub fn select(
        &mut self,
        state: &mut BanditState,
        candidate: &Candidate,
        estimate: &UtilityEstimate,
        current_lap: LapNumber,
        cfg: &SelectorConfig,
    ) -> Option<Candidate> {
        // Reviewer-driven themes bypass sampling entirely; the reviewer has
        // already decided what this corner needs.
        if candidate.theme != CoachingTheme::Pace {
            let arm = state.arm(candidate.corner_id, candidate.action);
            arm.last_coached_lap = Some(current_lap);
            arm.consecutive_selections += 1;
            return Some(*candidate);
        }

        let explore = candidate.slip.both_green();

        let mut choices: Vec<(ActionClass, Intensity)> =
            vec![(candidate.action, candidate.intensity)];
        if explore {
            for action in ActionClass::ALL {
                if action == candidate.action {
                    continue;
                }
                if !safety::action_permitted(action, candidate.slip) {
                    continue;
                }
                let cap =
                    safety::intensity_cap(safety::governing_state(action, candidate.slip));
                choices.push((action, candidate.intensity.min(cap)));
            }
        }

        // Drop arms in cooldown; the corner is skipped when nothing is
        // eligible this lap.
        choices.retain(|(action, _)| {
            !state
                .arm(candidate.corner_id, *action)
                .in_cooldown(current_lap, cfg)
        });
        if choices.is_empty() {
            debug!(corner = %candidate.corner_id, "all arms in cooldown; corner skipped");
            return None;
        }

        let utility_nudge =
            cfg.utility_prior_weight * (estimate.expected_gain_ms / 100.0).clamp(0.0, 1.0);

        let mut best: Option<(f64, ActionClass, Intensity)> = None;
        for (action, intensity) in choices {
            let arm = state.arm(candidate.corner_id, action);
            let sample = match Beta::new(arm.alpha, arm.beta) {
                Ok(dist) => dist.sample(&mut self.rng),
                // Degenerate parameters cannot happen from our updates, but
                // a belief snapshot from disk might carry them.
                Err(_) => arm.expected_reward(),
            };
            // The primary candidate carries the utility nudge; exploration
            // arms stand on their belief alone.
            let score = if action == candidate.action {
                sample + utility_nudge
            } else {
                sample
            };
            let better = match best {
                None => true,
                Some((s, _, _)) => score > s,
            };
            if better {
                best = Some((score, action, intensity));
            }
        }

        let (_, action, intensity) = best?;
        let arm = state.arm(candidate.corner_id, action);
        arm.last_coached_lap = Some(current_lap);
        arm.last_outcome = None;
        arm.consecutive_selections += 1;

        Some(Candidate {
            action,
            intensity,
            phase: action.phase(),
            ..*candidate
        })
    }
}
