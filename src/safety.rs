// src/safety.rs
//
// Safety classifier: maps a corner observation's slip proxies onto the
// Green / Yellow / Red bands, per phase.
//
// This module is the single authoritative safety gate. Candidate
// generation and the selector must route every action through
// `action_permitted` / `intensity_cap`; nothing else in the crate is
// allowed to decide what is safe.

use crate::config::SlipBandsConfig;
use crate::types::{ActionClass, CornerObservation, Intensity, SlipState};

/// Entry / exit slip classification for one corner on one lap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSlip {
    pub entry: SlipState,
    pub exit: SlipState,
}

impl PhaseSlip {
    pub fn both_green(&self) -> bool {
        self.entry == SlipState::Green && self.exit == SlipState::Green
    }

    /// The more severe of the two phase states.
    pub fn worst(&self) -> SlipState {
        match (self.entry, self.exit) {
            (SlipState::Red, _) | (_, SlipState::Red) => SlipState::Red,
            (SlipState::Yellow, _) | (_, SlipState::Yellow) => SlipState::Yellow,
            _ => SlipState::Green,
        }
    }
}

fn band(value: f64, green_max: f64, yellow_max: f64) -> SlipState {
    if !value.is_finite() {
        // Unreadable proxy: treat as at-the-limit rather than safe.
        return SlipState::Red;
    }
    if value <= green_max {
        SlipState::Green
    } else if value <= yellow_max {
        SlipState::Yellow
    } else {
        SlipState::Red
    }
}

/// Classify one observation. Pure function of the observation's slip peaks
/// against the configured bands; no hidden state.
pub fn classify(obs: &CornerObservation, bands: &SlipBandsConfig) -> PhaseSlip {
    PhaseSlip {
        entry: band(obs.entry_slip, bands.entry_green_max, bands.entry_yellow_max),
        exit: band(obs.exit_slip, bands.exit_green_max, bands.exit_yellow_max),
    }
}

/// Whether an action class may be issued at all under the given slip state.
///
/// Exhaustive over `ActionClass` so a new class cannot ship without a
/// gating decision here.
pub fn action_permitted(action: ActionClass, slip: PhaseSlip) -> bool {
    match action {
        // Braking earlier only ever adds margin.
        ActionClass::BrakeEarlier => true,
        // Aggressive pressure build is forbidden when entry grip is gone.
        ActionClass::BuildPressureFaster => slip.entry != SlipState::Red,
        // Release timing is coached at reduced intensity instead of blocked.
        ActionClass::ReleaseEarlier => true,
        // Earlier throttle is forbidden when exit traction is gone.
        ActionClass::ThrottleEarlierProgressive => slip.exit != SlipState::Red,
        // Unwinding steering before throttle is the stability fallback.
        ActionClass::ReduceSteerThenThrottle => true,
    }
}

/// Highest intensity permitted under a slip state for the action's phase.
pub fn intensity_cap(state: SlipState) -> Intensity {
    match state {
        SlipState::Green => Intensity::Fast,
        SlipState::Yellow => Intensity::Progressive,
        SlipState::Red => Intensity::VerySoft,
    }
}

/// Slip state governing a given action, from the phase it targets.
pub fn governing_state(action: ActionClass, slip: PhaseSlip) -> SlipState {
    match action.phase() {
        crate::types::TurnPhase::Entry | crate::types::TurnPhase::Rotation => slip.entry,
        crate::types::TurnPhase::Exit => slip.exit,
    }
}
