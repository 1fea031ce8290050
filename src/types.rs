// src/types.rs
//
// Common shared types for the apexcoach decision engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Millisecond timestamp since session start.
pub type TimestampMs = i64;

/// 1-based lap counter within a session.
pub type LapNumber = u32;

/// Unique identifier for a corner: track plus corner ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CornerId {
    pub track_id: u16,
    pub corner: u8,
}

impl CornerId {
    pub fn new(track_id: u16, corner: u8) -> Self {
        Self { track_id, corner }
    }
}

impl fmt::Display for CornerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}C{}", self.track_id, self.corner)
    }
}

/// Opaque driver identity used to partition learning state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DriverId(pub u64);

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{}", self.0)
    }
}

/// Driving-assist configuration class. Reference statistics are never mixed
/// across assist classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssistClass {
    None,
    Partial,
    Full,
}

impl AssistClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssistClass::None => "none",
            AssistClass::Partial => "partial",
            AssistClass::Full => "full",
        }
    }
}

/// Input device class. Wheel and pad drivers produce different brake/throttle
/// traces, so they get separate references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputDevice {
    Wheel,
    Pad,
}

impl InputDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputDevice::Wheel => "wheel",
            InputDevice::Pad => "pad",
        }
    }
}

/// Grouping key under which reference statistics are kept separate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterKey {
    pub assists: AssistClass,
    pub device: InputDevice,
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.assists.as_str(), self.device.as_str())
    }
}

/// Turn phase used for segmentation and candidate targeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TurnPhase {
    Entry,
    Rotation,
    Exit,
}

impl TurnPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnPhase::Entry => "entry",
            TurnPhase::Rotation => "rotation",
            TurnPhase::Exit => "exit",
        }
    }

    /// Coaching priority order: Entry is addressed before Rotation before Exit.
    pub const PRIORITY: [TurnPhase; 3] = [TurnPhase::Entry, TurnPhase::Rotation, TurnPhase::Exit];
}

/// Three-level safety classification of how close a corner phase is to
/// traction loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlipState {
    Green,
    Yellow,
    Red,
}

impl SlipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlipState::Green => "green",
            SlipState::Yellow => "yellow",
            SlipState::Red => "red",
        }
    }
}

/// Closed set of coaching action classes.
///
/// Safety gating pattern-matches exhaustively over this enum so that adding
/// a class forces a gating review at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionClass {
    BrakeEarlier,
    BuildPressureFaster,
    ReleaseEarlier,
    ThrottleEarlierProgressive,
    ReduceSteerThenThrottle,
}

impl ActionClass {
    pub const ALL: [ActionClass; 5] = [
        ActionClass::BrakeEarlier,
        ActionClass::BuildPressureFaster,
        ActionClass::ReleaseEarlier,
        ActionClass::ThrottleEarlierProgressive,
        ActionClass::ReduceSteerThenThrottle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionClass::BrakeEarlier => "brake_earlier",
            ActionClass::BuildPressureFaster => "build_pressure_faster",
            ActionClass::ReleaseEarlier => "release_earlier",
            ActionClass::ThrottleEarlierProgressive => "throttle_earlier_progressive",
            ActionClass::ReduceSteerThenThrottle => "reduce_steer_then_throttle",
        }
    }

    /// The turn phase this action targets.
    pub fn phase(&self) -> TurnPhase {
        match self {
            ActionClass::BrakeEarlier | ActionClass::BuildPressureFaster => TurnPhase::Entry,
            ActionClass::ReleaseEarlier => TurnPhase::Rotation,
            ActionClass::ThrottleEarlierProgressive | ActionClass::ReduceSteerThenThrottle => {
                TurnPhase::Exit
            }
        }
    }
}

/// Qualitative intensity ladder for a coaching action, softest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Intensity {
    VerySoft,
    Soft,
    Progressive,
    Fast,
}

impl Intensity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intensity::VerySoft => "very_soft",
            Intensity::Soft => "soft",
            Intensity::Progressive => "progressive",
            Intensity::Fast => "fast",
        }
    }

    /// One step down the ladder; saturates at the softest level.
    pub fn step_down(&self) -> Intensity {
        match self {
            Intensity::VerySoft | Intensity::Soft => Intensity::VerySoft,
            Intensity::Progressive => Intensity::Soft,
            Intensity::Fast => Intensity::Progressive,
        }
    }

    /// Whether this level is permitted under a Yellow slip state.
    pub fn is_soft_variant(&self) -> bool {
        matches!(
            self,
            Intensity::VerySoft | Intensity::Soft | Intensity::Progressive
        )
    }
}

/// One raw telemetry frame for the coached car, as handed over by the
/// external protocol decoder. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub timestamp_ms: TimestampMs,
    pub lap: LapNumber,
    /// Track-relative distance from the start line, metres.
    pub lap_distance_m: f64,
    pub speed_kmh: f64,
    /// Throttle input in [0, 1].
    pub throttle: f64,
    /// Brake input in [0, 1].
    pub brake: f64,
    /// Steering input in [-1, 1].
    pub steering: f64,
    pub gear: i8,
    /// Normalized front/rear slip proxies; 0 = full grip, 1 = at the limit.
    pub front_slip: f64,
    pub rear_slip: f64,
    /// Upstream validity flag; final confirmation happens at lap completion.
    pub lap_valid: bool,
}

/// Static geometry of one corner, provided once per track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CornerDefinition {
    pub id: CornerId,
    /// Distance marks along the lap, metres: entry <= apex <= exit.
    pub entry_s: f64,
    pub apex_s: f64,
    pub exit_s: f64,
}

impl CornerDefinition {
    pub fn contains(&self, lap_distance_m: f64) -> bool {
        lap_distance_m >= self.entry_s && lap_distance_m <= self.exit_s
    }
}

/// Per-metric key into a corner observation. The reference model keeps one
/// median/IQR track per metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    BrakeOnset,
    PeakBrake,
    BrakeRelease,
    ThrottleOnset,
    ThrottleSlope,
    EntrySpeed,
    MinSpeed,
    ExitSpeed,
    CornerTime,
}

impl MetricKind {
    pub const ALL: [MetricKind; 9] = [
        MetricKind::BrakeOnset,
        MetricKind::PeakBrake,
        MetricKind::BrakeRelease,
        MetricKind::ThrottleOnset,
        MetricKind::ThrottleSlope,
        MetricKind::EntrySpeed,
        MetricKind::MinSpeed,
        MetricKind::ExitSpeed,
        MetricKind::CornerTime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::BrakeOnset => "brake_onset",
            MetricKind::PeakBrake => "peak_brake",
            MetricKind::BrakeRelease => "brake_release",
            MetricKind::ThrottleOnset => "throttle_onset",
            MetricKind::ThrottleSlope => "throttle_slope",
            MetricKind::EntrySpeed => "entry_speed",
            MetricKind::MinSpeed => "min_speed",
            MetricKind::ExitSpeed => "exit_speed",
            MetricKind::CornerTime => "corner_time",
        }
    }

    /// The primary metric a coaching action is judged against by the reviewer.
    pub fn for_action(action: ActionClass) -> MetricKind {
        match action {
            ActionClass::BrakeEarlier => MetricKind::BrakeOnset,
            ActionClass::BuildPressureFaster => MetricKind::PeakBrake,
            ActionClass::ReleaseEarlier => MetricKind::BrakeRelease,
            ActionClass::ThrottleEarlierProgressive => MetricKind::ThrottleOnset,
            ActionClass::ReduceSteerThenThrottle => MetricKind::ThrottleSlope,
        }
    }
}

/// Derived per-corner, per-lap observation produced by the feature extractor
/// and handed downstream by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CornerObservation {
    pub corner_id: CornerId,
    pub lap: LapNumber,
    pub entry_speed_kmh: f64,
    pub min_speed_kmh: f64,
    pub exit_speed_kmh: f64,
    /// Distance marks, metres from the start line.
    pub brake_onset_m: f64,
    pub peak_brake: f64,
    pub brake_release_m: f64,
    pub throttle_onset_m: f64,
    /// Throttle opening rate after pickup, fraction per second.
    pub throttle_slope: f64,
    /// Peak normalized slip over the entry / exit windows.
    pub entry_slip: f64,
    pub exit_slip: f64,
    /// Time spent between the entry and exit marks.
    pub corner_time_ms: f64,
    /// False when phase detection failed or phases are out of order; such
    /// records are excluded from learning and ranking.
    pub complete: bool,
}

impl CornerObservation {
    /// Phase ordering invariant: brake onset <= release <= throttle onset
    /// along the lap distance. Callers mark the record incomplete when this
    /// does not hold.
    pub fn phases_ordered(&self) -> bool {
        self.brake_onset_m <= self.brake_release_m && self.brake_release_m <= self.throttle_onset_m
    }

    pub fn metric(&self, kind: MetricKind) -> f64 {
        match kind {
            MetricKind::BrakeOnset => self.brake_onset_m,
            MetricKind::PeakBrake => self.peak_brake,
            MetricKind::BrakeRelease => self.brake_release_m,
            MetricKind::ThrottleOnset => self.throttle_onset_m,
            MetricKind::ThrottleSlope => self.throttle_slope,
            MetricKind::EntrySpeed => self.entry_speed_kmh,
            MetricKind::MinSpeed => self.min_speed_kmh,
            MetricKind::ExitSpeed => self.exit_speed_kmh,
            MetricKind::CornerTime => self.corner_time_ms,
        }
    }
}

/// Coaching theme attached to a recommendation so the external templating
/// layer can pick the right framing. Never carries raw numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoachingTheme {
    Pace,
    ConsistencyDrill,
    MicroDrill,
    Stability,
}

impl CoachingTheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoachingTheme::Pace => "pace",
            CoachingTheme::ConsistencyDrill => "consistency_drill",
            CoachingTheme::MicroDrill => "micro_drill",
            CoachingTheme::Stability => "stability",
        }
    }
}

/// Final structured recommendation handed to the external message-templating
/// component. At most three per lap, one per corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoachingRecommendation {
    pub corner_id: CornerId,
    pub phase: TurnPhase,
    pub action: ActionClass,
    pub intensity: Intensity,
    pub theme: CoachingTheme,
}

/// Terminal classification of a coached tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewOutcome {
    Success,
    Overshoot,
    NoAttempt,
}

impl ReviewOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewOutcome::Success => "success",
            ReviewOutcome::Overshoot => "overshoot",
            ReviewOutcome::NoAttempt => "no_attempt",
        }
    }
}

/// Outcome event emitted for KPI collection when a review terminates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReviewEvent {
    pub corner_id: CornerId,
    pub action: ActionClass,
    pub outcome: ReviewOutcome,
    /// Realized change of the targeted metric vs the pre-tip baseline, in the
    /// metric's own unit. Observability only; never shown to the driver.
    pub realized_delta: f64,
    pub lap: LapNumber,
}
