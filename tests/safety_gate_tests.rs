// tests/safety_gate_tests.rs
//
// Exhaustive checks of the safety invariants over candidate generation and
// selection: no forbidden action may ever be produced, for any combination
// of slip states and metric deltas.

use apexcoach::candidates::{generate, CornerInput};
use apexcoach::config::{CandidateConfig, Config, ReferenceConfig, SelectorConfig};
use apexcoach::reference::{ReferenceLookup, ReferenceModel};
use apexcoach::safety::PhaseSlip;
use apexcoach::selector::{BanditState, Selector};
use apexcoach::types::{
    ActionClass, AssistClass, CornerId, CornerObservation, FilterKey, InputDevice, SlipState,
};
use apexcoach::utility::{HeuristicModel, SpeedClass, UtilityContext};

const SLIP_STATES: [SlipState; 3] = [SlipState::Green, SlipState::Yellow, SlipState::Red];

fn key() -> FilterKey {
    FilterKey {
        assists: AssistClass::None,
        device: InputDevice::Wheel,
    }
}

fn observation(corner: u8, lap: u32) -> CornerObservation {
    CornerObservation {
        corner_id: CornerId::new(1, corner),
        lap,
        entry_speed_kmh: 205.0,
        min_speed_kmh: 112.0,
        exit_speed_kmh: 168.0,
        brake_onset_m: 1020.0,
        peak_brake: 0.9,
        brake_release_m: 1090.0,
        throttle_onset_m: 1170.0,
        throttle_slope: 0.7,
        entry_slip: 0.3,
        exit_slip: 0.3,
        corner_time_ms: 4200.0,
        complete: true,
    }
}

/// Reference with spread on every phase metric, so every action class can
/// become the preferred one depending on the probe observation.
fn ready_lookup(corner: u8) -> ReferenceLookup {
    let rc = ReferenceConfig::default();
    let mut model = ReferenceModel::new();
    for lap in 1..=9u32 {
        let mut o = observation(corner, lap);
        o.corner_time_ms = 4200.0 + (lap % 4) as f64 * 25.0;
        o.brake_onset_m = 1020.0 + (lap % 3) as f64 * 5.0;
        o.peak_brake = 0.90 - (lap % 3) as f64 * 0.02;
        o.brake_release_m = 1090.0 + (lap % 3) as f64 * 5.0;
        o.throttle_onset_m = 1170.0 + (lap % 3) as f64 * 5.0;
        model.update(key(), &o, &rc);
    }
    model.get(key(), CornerId::new(1, corner), &rc)
}

/// Probe observations that make each phase (and each entry action) the
/// preferred coaching target in turn.
fn probe_observations() -> Vec<CornerObservation> {
    let base = observation(1, 30);
    let mut probes = Vec::new();

    // Late brake onset -> BrakeEarlier preferred.
    let mut late_onset = base.clone();
    late_onset.brake_onset_m = 1100.0;
    late_onset.corner_time_ms = 4500.0;
    probes.push(late_onset);

    // Weak peak pressure -> BuildPressureFaster preferred.
    let mut weak_peak = base.clone();
    weak_peak.peak_brake = 0.45;
    weak_peak.corner_time_ms = 4500.0;
    probes.push(weak_peak);

    // Late release -> ReleaseEarlier preferred.
    let mut late_release = base.clone();
    late_release.brake_release_m = 1160.0;
    late_release.corner_time_ms = 4500.0;
    probes.push(late_release);

    // Late throttle -> ThrottleEarlierProgressive preferred.
    let mut late_throttle = base.clone();
    late_throttle.throttle_onset_m = 1290.0;
    late_throttle.corner_time_ms = 4500.0;
    probes.push(late_throttle);

    // Everything late at once.
    let mut all_late = base;
    all_late.brake_onset_m = 1100.0;
    all_late.peak_brake = 0.45;
    all_late.brake_release_m = 1190.0;
    all_late.throttle_onset_m = 1290.0;
    all_late.corner_time_ms = 4700.0;
    probes.push(all_late);

    probes
}

#[test]
fn forbidden_actions_never_survive_any_slip_combination() {
    let cfg = CandidateConfig::default();
    for entry in SLIP_STATES {
        for exit in SLIP_STATES {
            let slip = PhaseSlip { entry, exit };
            for probe in probe_observations() {
                let input = CornerInput {
                    obs: probe.clone(),
                    lookup: ready_lookup(1),
                    slip,
                };
                let out = generate(&[input], &[], &cfg);
                for c in &out {
                    if entry == SlipState::Red {
                        assert_ne!(
                            c.action,
                            ActionClass::BuildPressureFaster,
                            "entry red must block pressure builds (probe {probe:?})"
                        );
                    }
                    if exit == SlipState::Red {
                        assert_ne!(
                            c.action,
                            ActionClass::ThrottleEarlierProgressive,
                            "exit red must block early throttle (probe {probe:?})"
                        );
                    }
                    let governing = apexcoach::safety::governing_state(c.action, slip);
                    if governing == SlipState::Yellow {
                        assert!(
                            c.intensity.is_soft_variant(),
                            "yellow phase must cap intensity (got {:?})",
                            c.intensity
                        );
                    }
                }
            }
        }
    }
}

#[test]
fn selection_respects_the_gate_under_every_slip_combination() {
    let candidate_cfg = CandidateConfig::default();
    let selector_cfg = SelectorConfig::default();
    let heuristic = HeuristicModel;
    let ctx = UtilityContext {
        speed_class: SpeedClass::Medium,
        filter_key: key(),
    };

    for entry in SLIP_STATES {
        for exit in SLIP_STATES {
            let slip = PhaseSlip { entry, exit };
            let mut selector = Selector::new(99);
            let mut bandit = BanditState::new();

            for (round, probe) in probe_observations().into_iter().enumerate() {
                let input = CornerInput {
                    obs: probe,
                    lookup: ready_lookup(1),
                    slip,
                };
                let candidates = generate(&[input], &[], &candidate_cfg);
                for candidate in candidates {
                    let estimate = heuristic.estimate(&candidate, &ctx);
                    // Fresh lap number each round so cooldown never starves
                    // the check.
                    let lap = 10 + (round as u32) * 10;
                    if let Some(picked) =
                        selector.select(&mut bandit, &candidate, &estimate, lap, &selector_cfg)
                    {
                        assert!(
                            apexcoach::safety::action_permitted(picked.action, slip),
                            "selector emitted gated action {:?} under {slip:?}",
                            picked.action
                        );
                    }
                }
            }
        }
    }
}

#[test]
fn at_most_three_corners_and_one_action_per_corner() {
    let cfg = CandidateConfig::default();
    let green = PhaseSlip {
        entry: SlipState::Green,
        exit: SlipState::Green,
    };
    let inputs: Vec<CornerInput> = (1..=10u8)
        .map(|corner| {
            let mut o = observation(corner, 30);
            o.brake_onset_m = 1100.0;
            o.corner_time_ms = 4400.0 + corner as f64 * 15.0;
            CornerInput {
                obs: o,
                lookup: ready_lookup(corner),
                slip: green,
            }
        })
        .collect();

    let out = generate(&inputs, &[], &cfg);
    assert!(out.len() <= 3);
    let mut ids: Vec<CornerId> = out.iter().map(|c| c.corner_id).collect();
    let before = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), before, "one action per corner");
}

#[test]
fn insufficient_reference_never_reaches_the_top_three() {
    let cfg = CandidateConfig::default();
    let green = PhaseSlip {
        entry: SlipState::Green,
        exit: SlipState::Green,
    };

    // A corner with an enormous raw delta but no reference.
    let mut monster = observation(9, 30);
    monster.corner_time_ms = 20_000.0;
    let starved = CornerInput {
        obs: monster,
        lookup: ReferenceLookup::Insufficient { samples: 4 },
        slip: green,
    };

    let mut mild = observation(1, 30);
    mild.brake_onset_m = 1100.0;
    mild.corner_time_ms = 4300.0;
    let ready = CornerInput {
        obs: mild,
        lookup: ready_lookup(1),
        slip: green,
    };

    let out = generate(&[starved, ready], &[], &cfg);
    assert!(out.iter().all(|c| c.corner_id != CornerId::new(1, 9)));
    assert!(out.iter().any(|c| c.corner_id == CornerId::new(1, 1)));
}

/// The full config surface keeps the gate injectable: moving the yellow
/// band down reclassifies the same observation.
#[test]
fn slip_bands_are_configuration_not_constants() {
    let mut cfg = Config::default();
    let obs = observation(1, 5);

    let relaxed = apexcoach::safety::classify(&obs, &cfg.slip_bands);
    assert_eq!(relaxed.entry, SlipState::Green);

    cfg.slip_bands.entry_green_max = 0.2;
    cfg.slip_bands.entry_yellow_max = 0.25;
    let strict = apexcoach::safety::classify(&obs, &cfg.slip_bands);
    assert_eq!(strict.entry, SlipState::Red);
}
