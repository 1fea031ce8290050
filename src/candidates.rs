// src/candidates.rs
//
// Candidate generation: ranks corners by IQR-normalized impact against the
// reference, walks the phase priority Entry -> Rotation -> Exit, applies
// the safety gate with its mandated fallbacks, and resolves conflicts down
// to at most one candidate per corner and at most `max_corners` corners.
//
// This whole module is a deterministic, side-effect-free transformation:
// identical inputs always produce identical output, which offline replay
// relies on. All orderings carry explicit tie-breaks.

use tracing::{debug, error};

use crate::config::CandidateConfig;
use crate::reference::{CornerReference, ReferenceLookup};
use crate::safety::{self, PhaseSlip};
use crate::stats;
use crate::types::{
    ActionClass, CoachingTheme, CornerId, CornerObservation, Intensity, MetricKind, SlipState,
    TurnPhase,
};

/// One proposed coaching action for one corner phase, prior to utility
/// estimation and final selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub corner_id: CornerId,
    pub phase: TurnPhase,
    pub action: ActionClass,
    pub intensity: Intensity,
    pub theme: CoachingTheme,
    pub slip: PhaseSlip,
    /// IQR-normalized corner-time delta vs reference (positive = slower).
    pub impact: f64,
    /// Raw corner-time delta vs reference median, milliseconds.
    pub delta_ms: f64,
}

/// Reviewer instruction constraining what the next cycle may offer for one
/// corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleDirective {
    pub corner_id: CornerId,
    pub kind: DirectiveKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DirectiveKind {
    /// No attempt was detected: re-issue the same theme as a lower-stakes
    /// micro-drill instead of switching corners.
    MicroDrill { action: ActionClass },
    /// The driver overdid the previous tip: force one intensity level down,
    /// or switch to the stability action when the original is now gated.
    Soften { action: ActionClass, intensity: Intensity },
}

/// Everything known about one corner going into a decision cycle.
#[derive(Debug, Clone)]
pub struct CornerInput {
    pub obs: CornerObservation,
    pub lookup: ReferenceLookup,
    pub slip: PhaseSlip,
}

/// Generate gated candidates for one lap. At most one per corner, at most
/// `cfg.max_corners` corners, ranked worst-first.
pub fn generate(
    inputs: &[CornerInput],
    directives: &[CycleDirective],
    cfg: &CandidateConfig,
) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = Vec::new();

    // Reviewer directives are honored first so a micro-drill corner is never
    // displaced by a freshly ranked one.
    for d in directives {
        if out.len() >= cfg.max_corners {
            break;
        }
        let Some(input) = inputs
            .iter()
            .find(|i| i.obs.corner_id == d.corner_id && i.obs.complete)
        else {
            continue;
        };
        if let Some(c) = candidate_for_directive(input, d) {
            out.push(c);
        }
    }

    // Rank the remaining corners by normalized impact, worst first. Corners
    // with insufficient reference data never enter this ranking.
    let mut ranked: Vec<(f64, &CornerInput, &CornerReference)> = Vec::new();
    for input in inputs {
        if !input.obs.complete {
            continue;
        }
        if out.iter().any(|c| c.corner_id == input.obs.corner_id) {
            continue;
        }
        let ReferenceLookup::Ready(reference) = &input.lookup else {
            continue;
        };
        let impact = stats::normalized_delta(
            input.obs.corner_time_ms,
            reference.time.median,
            reference.time.iqr,
        );
        if impact > 0.0 {
            ranked.push((impact, input, reference));
        }
    }
    ranked.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .expect("finite impacts")
            .then(a.1.obs.corner_id.cmp(&b.1.obs.corner_id))
    });

    for (impact, input, reference) in ranked {
        if out.len() >= cfg.max_corners {
            break;
        }
        if let Some(c) = candidate_for_corner(input, reference, impact, cfg) {
            out.push(c);
        }
    }

    // Consistency framing when no pace tip could be produced but corners
    // are still short on reference data.
    if out.is_empty() {
        if let Some(c) = consistency_fallback(inputs) {
            out.push(c);
        }
    }

    enforce_safety(out)
}

fn candidate_for_directive(input: &CornerInput, d: &CycleDirective) -> Option<Candidate> {
    let slip = input.slip;
    match d.kind {
        DirectiveKind::MicroDrill { action } => {
            let action = gated_or_fallback(action, slip)?;
            Some(Candidate {
                corner_id: d.corner_id,
                phase: action.phase(),
                action,
                intensity: Intensity::VerySoft,
                theme: CoachingTheme::MicroDrill,
                slip,
                impact: 0.0,
                delta_ms: 0.0,
            })
        }
        DirectiveKind::Soften { action, intensity } => {
            let (action, theme) = if safety::action_permitted(action, slip) {
                (action, CoachingTheme::Stability)
            } else {
                (stability_fallback(action), CoachingTheme::Stability)
            };
            let cap = safety::intensity_cap(safety::governing_state(action, slip));
            Some(Candidate {
                corner_id: d.corner_id,
                phase: action.phase(),
                action,
                intensity: intensity.step_down().min(cap),
                theme,
                slip,
                impact: 0.0,
                delta_ms: 0.0,
            })
        }
    }
}

/// Walk the phase priority for one ranked corner and emit its single
/// candidate, or None when every phase is either clean or gated away.
fn candidate_for_corner(
    input: &CornerInput,
    reference: &CornerReference,
    impact: f64,
    cfg: &CandidateConfig,
) -> Option<Candidate> {
    let obs = &input.obs;
    let slip = input.slip;

    // High lap-to-lap scatter is coached as a consistency drill before any
    // pace work.
    if reference.consistency_ratio > cfg.consistency_ratio_max {
        return Some(Candidate {
            corner_id: obs.corner_id,
            phase: TurnPhase::Entry,
            action: ActionClass::BrakeEarlier,
            intensity: Intensity::VerySoft,
            theme: CoachingTheme::ConsistencyDrill,
            slip,
            impact,
            delta_ms: obs.corner_time_ms - reference.time.median,
        });
    }

    for phase in TurnPhase::PRIORITY {
        let Some(preferred) = phase_action(obs, reference, phase, cfg) else {
            continue;
        };
        let Some(action) = gated_or_fallback(preferred, slip) else {
            // Every action for this phase is gated; fall through.
            continue;
        };
        let governing = safety::governing_state(action, slip);
        let base = if impact > 2.0 && governing == SlipState::Green {
            Intensity::Fast
        } else {
            Intensity::Progressive
        };
        let intensity = base.min(safety::intensity_cap(governing));
        let theme = if action == ActionClass::ReduceSteerThenThrottle
            && preferred != ActionClass::ReduceSteerThenThrottle
        {
            CoachingTheme::Stability
        } else {
            CoachingTheme::Pace
        };
        return Some(Candidate {
            corner_id: obs.corner_id,
            phase,
            action,
            intensity,
            theme,
            slip,
            impact,
            delta_ms: obs.corner_time_ms - reference.time.median,
        });
    }

    debug!(corner = %obs.corner_id, "no meaningful phase delta; corner dropped");
    None
}

/// The action a phase would coach, judged purely on metric deltas against
/// the reference. None when the phase shows no meaningful delta.
fn phase_action(
    obs: &CornerObservation,
    reference: &CornerReference,
    phase: TurnPhase,
    cfg: &CandidateConfig,
) -> Option<ActionClass> {
    let delta = |kind: MetricKind| -> f64 {
        reference
            .metric(kind)
            .map(|s| stats::normalized_delta(obs.metric(kind), s.median, s.iqr))
            .unwrap_or(0.0)
    };

    match phase {
        TurnPhase::Entry => {
            // Braking later than the reference costs entry speed control;
            // braking early enough but with a soft initial application costs
            // deceleration distance.
            let onset_late = delta(MetricKind::BrakeOnset);
            let pressure_low = -delta(MetricKind::PeakBrake);
            if onset_late >= cfg.min_phase_delta_iqr && onset_late >= pressure_low {
                Some(ActionClass::BrakeEarlier)
            } else if pressure_low >= cfg.min_phase_delta_iqr {
                Some(ActionClass::BuildPressureFaster)
            } else {
                None
            }
        }
        TurnPhase::Rotation => {
            let release_late = delta(MetricKind::BrakeRelease);
            (release_late >= cfg.min_phase_delta_iqr).then_some(ActionClass::ReleaseEarlier)
        }
        TurnPhase::Exit => {
            let throttle_late = delta(MetricKind::ThrottleOnset);
            (throttle_late >= cfg.min_phase_delta_iqr)
                .then_some(ActionClass::ThrottleEarlierProgressive)
        }
    }
}

/// Apply the safety gate to an action, falling back along the mandated
/// chain. None when nothing survives for the phase.
fn gated_or_fallback(action: ActionClass, slip: PhaseSlip) -> Option<ActionClass> {
    if safety::action_permitted(action, slip) {
        return Some(action);
    }
    let fallback = stability_fallback(action);
    safety::action_permitted(fallback, slip).then_some(fallback)
}

/// The mandated fallback for each gated action. Exhaustive so a new action
/// class cannot ship without one.
fn stability_fallback(action: ActionClass) -> ActionClass {
    match action {
        ActionClass::BuildPressureFaster => ActionClass::BrakeEarlier,
        ActionClass::ThrottleEarlierProgressive => ActionClass::ReduceSteerThenThrottle,
        ActionClass::BrakeEarlier => ActionClass::BrakeEarlier,
        ActionClass::ReleaseEarlier => ActionClass::ReleaseEarlier,
        ActionClass::ReduceSteerThenThrottle => ActionClass::ReduceSteerThenThrottle,
    }
}

/// When nothing was rankable, offer one consistency drill on the corner
/// closest to having a usable reference.
fn consistency_fallback(inputs: &[CornerInput]) -> Option<Candidate> {
    let mut best: Option<(usize, &CornerInput)> = None;
    for input in inputs {
        if !input.obs.complete {
            continue;
        }
        let ReferenceLookup::Insufficient { samples } = &input.lookup else {
            continue;
        };
        let samples = *samples;
        let better = match best {
            None => true,
            Some((s, b)) => {
                samples > s || (samples == s && input.obs.corner_id < b.obs.corner_id)
            }
        };
        if better {
            best = Some((samples, input));
        }
    }
    best.map(|(_, input)| Candidate {
        corner_id: input.obs.corner_id,
        phase: TurnPhase::Entry,
        action: ActionClass::BrakeEarlier,
        intensity: Intensity::VerySoft,
        theme: CoachingTheme::ConsistencyDrill,
        slip: input.slip,
        impact: 0.0,
        delta_ms: 0.0,
    })
}

/// Final contract check: nothing gated may leave this module. A violation
/// here is a programming error; it fails loudly under test and is dropped
/// with an error log in release.
fn enforce_safety(candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|c| {
            let ok = safety::action_permitted(c.action, c.slip);
            if !ok {
                debug_assert!(ok, "gated candidate survived generation: {c:?}");
                error!(
                    corner = %c.corner_id,
                    action = c.action.as_str(),
                    "safety contract violation; candidate dropped"
                );
            }
            ok
        })
        .collect()
}
