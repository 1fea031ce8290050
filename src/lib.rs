//! apexcoach core library.
//!
//! Post-lap driving-coach decision engine for time-trial telemetry: per
//! completed valid lap it picks at most three corners, exactly one
//! qualitative action per corner, and hands structured recommendations to
//! an external templating layer. Raw numbers never leave the core.
//!
//! # Architecture
//!
//! The codebase separates the stateful frame consumer from the pure
//! decision core:
//!
//! - **Feature extraction** (`extractor`): the only stateful consumer of
//!   raw frames; reorder buffering, gap bridging, hysteresis phase
//!   detection, per-corner observations at lap completion.
//!
//! - **Decision core** (`reference`, `safety`, `candidates`, `utility`,
//!   `selector`): deterministic transformations from observations to
//!   gated, utility-scored, bandit-selected recommendations. The safety
//!   classifier is the single authoritative gate.
//!
//! - **Feedback loop** (`reviewer`): classifies driver response over the
//!   following valid laps and feeds rewards back into the bandit and the
//!   learned utility model.
//!
//! - **Pipeline** (`pipeline`): the synchronous, budgeted post-lap cycle
//!   wiring the above together, with repository seams (`store`) for the
//!   cross-session learning state.
//!
//! Design principle: components learn decisions, the safety gate enforces
//! limits.

pub mod candidates;
pub mod config;
pub mod error;
pub mod extractor;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod reference;
pub mod replay;
pub mod reviewer;
pub mod safety;
pub mod selector;
pub mod stats;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod utility;

// --- Re-exports for ergonomic external use ---------------------------------

pub use config::{resolve_effective_profile, CoachProfile, Config, EffectiveProfile};

pub use candidates::{Candidate, CornerInput, CycleDirective, DirectiveKind};

pub use error::CoachError;

pub use extractor::{FeatureExtractor, LapBundle};

pub use logging::{CycleRecord, EventSink, FileSink, NoopSink};

pub use metrics::{CycleCounters, ExtractorCounters, OnlineStats};

pub use pipeline::CoachingSession;

pub use reference::{CornerReference, MetricStats, ReferenceLookup, ReferenceModel};

pub use reviewer::{Baseline, PendingReview, Reviewer, ReviewResolution};

pub use safety::{action_permitted, classify, intensity_cap, PhaseSlip};

pub use selector::{BanditArm, BanditState, Selector};

pub use store::{
    BanditStateRepository, InMemoryBanditStore, InMemoryReferenceStore, ReferenceStatsRepository,
};

pub use telemetry::TelemetrySink;

pub use types::{
    ActionClass, AssistClass, CoachingRecommendation, CoachingTheme, CornerDefinition, CornerId,
    CornerObservation, DriverId, FilterKey, InputDevice, Intensity, LapNumber, MetricKind,
    ReviewEvent, ReviewOutcome, SlipState, TelemetryFrame, TimestampMs, TurnPhase,
};

pub use utility::{
    EstimateSource, HeuristicModel, LearnedModel, SpeedClass, UtilityContext, UtilityEstimate,
    UtilityEstimator,
};
