// src/config.rs
//
// Central configuration for the apexcoach engine.
// This is the single source of truth for every tunable the decision
// pipeline reads (phase detection, slip bands, reference statistics,
// candidate gating, utility estimation, bandit selection, review windows,
// timing budgets).
//
// It also carries a small number of "research harness" parameters such as
// the deterministic RNG seed used by the selector.

#[derive(Debug, Clone)]
pub struct Config {
    /// Human-readable config / release version.
    pub version: &'static str,
    /// Seed for the selector's RNG. Same seed + same frame stream = same
    /// recommendations (offline replay determinism).
    pub seed: u64,
    /// Feature extraction / phase detection config.
    pub extractor: ExtractorConfig,
    /// Slip band thresholds for the safety classifier.
    pub slip_bands: SlipBandsConfig,
    /// Reference statistics config.
    pub reference: ReferenceConfig,
    /// Candidate generation / ranking config.
    pub candidates: CandidateConfig,
    /// Utility estimation config.
    pub utility: UtilityConfig,
    /// Bandit selector config.
    pub selector: SelectorConfig,
    /// Reviewer config.
    pub reviewer: ReviewerConfig,
    /// Decision-cycle timing budgets.
    pub budget: BudgetConfig,
}

/// Phase / marker detection tunables for the feature extractor.
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Rising threshold for brake / throttle onset detection.
    pub input_rise_threshold: f64,
    /// Falling threshold for release detection (hysteresis gap below rise).
    pub input_fall_threshold: f64,
    /// Frames an input must stay across a threshold before the event fires.
    pub dwell_frames: u32,
    /// Bounded reordering window, frames. Frames older than this relative to
    /// the newest accepted frame are dropped and counted.
    pub reorder_window_frames: usize,
    /// Maximum telemetry gap bridged by holding the last known state. Beyond
    /// this the affected corner observation is marked incomplete.
    pub max_bridgeable_gap_ms: i64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            input_rise_threshold: 0.10,
            input_fall_threshold: 0.05,
            dwell_frames: 3,
            reorder_window_frames: 8,
            max_bridgeable_gap_ms: 500,
        }
    }
}

/// Green / Yellow band maxima for normalized slip, per phase.
/// Anything above `yellow_max` is Red. Injected, never hardcoded at use
/// sites; the proxy-to-band mapping is an open tuning surface.
#[derive(Debug, Clone)]
pub struct SlipBandsConfig {
    pub entry_green_max: f64,
    pub entry_yellow_max: f64,
    pub exit_green_max: f64,
    pub exit_yellow_max: f64,
}

impl Default for SlipBandsConfig {
    fn default() -> Self {
        Self {
            entry_green_max: 0.60,
            entry_yellow_max: 0.85,
            exit_green_max: 0.60,
            exit_yellow_max: 0.85,
        }
    }
}

/// Reference model tunables.
#[derive(Debug, Clone)]
pub struct ReferenceConfig {
    /// Laps required before a corner reference is usable for pace tips.
    pub min_samples: usize,
    /// Per-metric history window, laps.
    pub history_window: usize,
    /// IQR multiplier for the outlier fence applied before statistics.
    pub outlier_fence_iqr: f64,
    /// Minimum gap between corner-time clusters, in units of the pooled
    /// distribution's IQR, before the history is treated as bimodal. The
    /// pooled IQR spans the gap itself, so this stays well below 1.0.
    pub bimodal_split_iqr: f64,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            min_samples: 5,
            history_window: 50,
            outlier_fence_iqr: 1.5,
            bimodal_split_iqr: 0.5,
        }
    }
}

/// Corner ranking and candidate gating tunables.
#[derive(Debug, Clone)]
pub struct CandidateConfig {
    /// Corners coached per lap, upper bound.
    pub max_corners: usize,
    /// Minimum IQR-normalized delta for a phase to be considered meaningful.
    pub min_phase_delta_iqr: f64,
    /// Driver spread vs reference IQR above which the corner is coached as a
    /// consistency drill instead of a pace tip.
    pub consistency_ratio_max: f64,
}

impl Default for CandidateConfig {
    fn default() -> Self {
        Self {
            max_corners: 3,
            min_phase_delta_iqr: 0.25,
            consistency_ratio_max: 2.0,
        }
    }
}

/// Utility estimation tunables.
#[derive(Debug, Clone)]
pub struct UtilityConfig {
    /// Confidence below which the learned model defers to the heuristic.
    pub confidence_threshold: f64,
    /// Training samples required before the learned model is consulted.
    pub min_training_samples: usize,
    /// Uncertainty floor attached to heuristic estimates, milliseconds.
    pub heuristic_uncertainty_floor_ms: f64,
}

impl Default for UtilityConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.70,
            min_training_samples: 50,
            heuristic_uncertainty_floor_ms: 100.0,
        }
    }
}

/// Bandit selector tunables.
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Laps an arm/corner pair is excluded after being coached, absent a
    /// clear Success or Overshoot signal.
    pub cooldown_laps: u32,
    /// Consecutive selections of the same arm before the cooldown extends.
    pub max_consecutive_selections: u32,
    /// Weight of the utility estimate when nudging sampled arm values.
    pub utility_prior_weight: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            cooldown_laps: 1,
            max_consecutive_selections: 3,
            utility_prior_weight: 0.5,
        }
    }
}

/// Reviewer tunables.
#[derive(Debug, Clone)]
pub struct ReviewerConfig {
    /// Valid laps observed before a pending review expires.
    pub observation_window_laps: u32,
    /// Noise band (IQR units of the targeted metric) within which a change
    /// counts as no attempt.
    pub noise_band_iqr: f64,
    /// Exit/apex speed regression tolerance, km/h.
    pub speed_regress_tolerance_kmh: f64,
    /// Corner-time regression tolerance, milliseconds.
    pub time_regress_tolerance_ms: f64,
}

impl Default for ReviewerConfig {
    fn default() -> Self {
        Self {
            observation_window_laps: 3,
            noise_band_iqr: 0.35,
            speed_regress_tolerance_kmh: 1.0,
            time_regress_tolerance_ms: 10.0,
        }
    }
}

/// Decision-cycle timing budgets.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// End-to-end budget for one post-lap decision cycle, milliseconds.
    pub cycle_budget_ms: u64,
    /// Sub-budget for the learned utility estimator; overrun fails over to
    /// the heuristic path.
    pub estimator_budget_ms: u64,
    /// When false the wall clock is ignored entirely, for bit-exact offline
    /// replay.
    pub enforce_wall_clock: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            cycle_budget_ms: 150,
            estimator_budget_ms: 60,
            enforce_wall_clock: true,
        }
    }
}

/// Coarse coaching profile preset used by the CLI / research harness.
///
/// Presets only tweak a small set of tunables on top of the default
/// (which we treat as "Balanced").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoachProfile {
    Gentle,
    Balanced,
    Assertive,
}

impl CoachProfile {
    /// Stable lowercase name for the profile (used in logs/telemetry).
    pub fn as_str(&self) -> &'static str {
        match self {
            CoachProfile::Gentle => "gentle",
            CoachProfile::Balanced => "balanced",
            CoachProfile::Assertive => "assertive",
        }
    }

    /// Parse a profile name (case-insensitive). Returns None if unrecognized.
    pub fn parse(s: &str) -> Option<CoachProfile> {
        match s.trim().to_ascii_lowercase().as_str() {
            "balanced" | "bal" | "b" => Some(CoachProfile::Balanced),
            "gentle" | "g" | "soft" => Some(CoachProfile::Gentle),
            "assertive" | "a" | "aggressive" => Some(CoachProfile::Assertive),
            _ => None,
        }
    }
}

/// Source of the effective coach profile (for logging precedence).
///
/// Precedence order (highest to lowest):
/// 1. CLI argument (--profile)
/// 2. Environment variable (APEXCOACH_PROFILE)
/// 3. Default (Balanced)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSource {
    Cli,
    Env,
    Default,
}

impl ProfileSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileSource::Cli => "cli",
            ProfileSource::Env => "env",
            ProfileSource::Default => "default",
        }
    }
}

/// Resolved profile with its source for logging.
#[derive(Debug, Clone, Copy)]
pub struct EffectiveProfile {
    pub profile: CoachProfile,
    pub source: ProfileSource,
}

impl EffectiveProfile {
    /// Log the effective profile at startup.
    pub fn log_startup(&self) {
        tracing::info!(
            profile = self.profile.as_str(),
            source = self.source.as_str(),
            "effective coach profile"
        );
    }
}

/// Resolve the effective coach profile using standard precedence rules.
pub fn resolve_effective_profile(cli_profile: Option<CoachProfile>) -> EffectiveProfile {
    if let Some(p) = cli_profile {
        return EffectiveProfile {
            profile: p,
            source: ProfileSource::Cli,
        };
    }

    if let Ok(raw) = std::env::var("APEXCOACH_PROFILE") {
        if let Some(p) = CoachProfile::parse(&raw) {
            return EffectiveProfile {
                profile: p,
                source: ProfileSource::Env,
            };
        }
    }

    EffectiveProfile {
        profile: CoachProfile::Balanced,
        source: ProfileSource::Default,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "apexcoach-0.1.0",
            seed: 0,
            extractor: ExtractorConfig::default(),
            slip_bands: SlipBandsConfig::default(),
            reference: ReferenceConfig::default(),
            candidates: CandidateConfig::default(),
            utility: UtilityConfig::default(),
            selector: SelectorConfig::default(),
            reviewer: ReviewerConfig::default(),
            budget: BudgetConfig::default(),
        }
    }
}

impl Config {
    /// Build a config for a preset profile on top of the defaults.
    pub fn for_profile(profile: CoachProfile) -> Self {
        let mut cfg = Config::default();
        match profile {
            CoachProfile::Balanced => {}
            CoachProfile::Gentle => {
                // Gentle: fewer, safer tips with longer gaps between them.
                cfg.candidates.max_corners = 2;
                cfg.candidates.min_phase_delta_iqr = 0.40;
                cfg.selector.cooldown_laps = 2;
                cfg.slip_bands.entry_green_max = 0.50;
                cfg.slip_bands.exit_green_max = 0.50;
            }
            CoachProfile::Assertive => {
                // Assertive: full tip budget and quicker re-coaching.
                cfg.candidates.min_phase_delta_iqr = 0.15;
                cfg.selector.max_consecutive_selections = 4;
            }
        }
        cfg
    }
}
