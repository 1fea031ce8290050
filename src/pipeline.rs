// src/pipeline.rs
//
// Post-lap decision cycle around the core components.
//
// Ordering per cycle:
//   1) Reviewer pass over the completed lap (close the loop: bandit
//      rewards, utility training, next-cycle directives)
//   2) Reference updates (valid laps only)
//   3) Ranking -> candidates -> utility -> selection
//   4) Review opening for every issued tip, sinks, repository save
//
// The whole cycle is synchronous and budgeted: when the estimator's
// sub-budget is spent, the remaining candidates take the heuristic path
// and the cycle is logged as degraded. A cycle whose output was never
// delivered is superseded (not queued) when the next lap completes.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::candidates::{self, CornerInput, CycleDirective};
use crate::config::Config;
use crate::extractor::{FeatureExtractor, LapBundle};
use crate::logging::{CycleRecord, EventSink};
use crate::metrics::{CycleCounters, OnlineStats};
use crate::reference::{ReferenceLookup, ReferenceModel};
use crate::reviewer::{Baseline, Reviewer};
use crate::safety;
use crate::selector::{BanditState, Selector};
use crate::store::{BanditStateRepository, ReferenceStatsRepository};
use crate::telemetry::TelemetrySink;
use crate::types::{
    CoachingRecommendation, CornerDefinition, CornerObservation, DriverId, FilterKey, MetricKind,
    ReviewOutcome, TelemetryFrame,
};
use crate::utility::{SpeedClass, UtilityContext, UtilityEstimator};

/// Absolute noise band per metric when the reference cannot provide an IQR
/// yet.
fn fallback_noise(metric: MetricKind) -> f64 {
    match metric {
        MetricKind::BrakeOnset | MetricKind::BrakeRelease | MetricKind::ThrottleOnset => 5.0,
        MetricKind::PeakBrake => 0.05,
        MetricKind::ThrottleSlope => 0.1,
        MetricKind::EntrySpeed | MetricKind::MinSpeed | MetricKind::ExitSpeed => 2.0,
        MetricKind::CornerTime => 50.0,
    }
}

/// One driver's coaching session: owns the extractor and the working copies
/// of the learning state, loaded from and saved back to the injected
/// repositories.
pub struct CoachingSession<'a, S: EventSink> {
    cfg: &'a Config,
    driver: DriverId,
    filter_key: FilterKey,
    extractor: FeatureExtractor<'a>,
    reference: ReferenceModel,
    bandit: BanditState,
    selector: Selector,
    estimator: UtilityEstimator,
    reviewer: Reviewer,
    ref_store: &'a dyn ReferenceStatsRepository,
    bandit_store: &'a dyn BanditStateRepository,
    sink: S,
    telemetry: TelemetrySink,
    pub counters: CycleCounters,
    pub cycle_latency_ms: OnlineStats,
    /// Latest cycle's output, cleared on delivery. Replaced (superseded)
    /// when a new lap completes first.
    undelivered: Option<Vec<CoachingRecommendation>>,
}

impl<'a, S: EventSink> CoachingSession<'a, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &'a Config,
        driver: DriverId,
        filter_key: FilterKey,
        corners: Vec<CornerDefinition>,
        ref_store: &'a dyn ReferenceStatsRepository,
        bandit_store: &'a dyn BanditStateRepository,
        sink: S,
        telemetry: TelemetrySink,
    ) -> Self {
        let reference = ref_store.load(driver);
        let bandit = bandit_store.load(driver);
        // Per-driver RNG stream: same config seed + same driver = same
        // choices on replay.
        let selector = Selector::new(cfg.seed ^ driver.0);
        Self {
            cfg,
            driver,
            filter_key,
            extractor: FeatureExtractor::new(cfg, corners),
            reference,
            bandit,
            selector,
            estimator: UtilityEstimator::new(),
            reviewer: Reviewer::new(),
            ref_store,
            bandit_store,
            sink,
            telemetry,
            counters: CycleCounters::default(),
            cycle_latency_ms: OnlineStats::default(),
            undelivered: None,
        }
    }

    /// Feed one telemetry frame. Runs a decision cycle when the frame
    /// closes out a lap.
    pub fn push_frame(&mut self, frame: TelemetryFrame) {
        if let Some(bundle) = self.extractor.push_frame(frame) {
            self.run_cycle(bundle);
        }
    }

    /// Hand the latest cycle's recommendations to the delivery layer.
    /// Empty when nothing is waiting.
    pub fn take_recommendations(&mut self) -> Vec<CoachingRecommendation> {
        self.undelivered.take().unwrap_or_default()
    }

    /// Session over: drain the extractor, discard pending reviews
    /// neutrally, persist learning state.
    pub fn finish(&mut self) {
        for bundle in self.extractor.finish() {
            self.run_cycle(bundle);
        }
        self.reviewer.discard_all();
        self.persist();
        info!(
            driver = %self.driver,
            cycles = self.counters.cycles,
            recommendations = self.counters.recommendations_emitted,
            "session finished"
        );
    }

    pub fn extractor_counters(&self) -> crate::metrics::ExtractorCounters {
        self.extractor.counters
    }

    fn persist(&self) {
        self.ref_store.save(self.driver, &self.reference);
        self.bandit_store.save(self.driver, &self.bandit);
    }

    fn run_cycle(&mut self, bundle: LapBundle) {
        let started = Instant::now();
        self.counters.cycles += 1;

        if self.undelivered.take().is_some() {
            // Previous cycle's output was never delivered; it is superseded,
            // not queued.
            self.counters.superseded_cycles += 1;
            debug!(lap = bundle.lap, "undelivered recommendations superseded");
        }

        // Slip classification happens once per observation and is shared by
        // the reviewer and the candidate gate.
        let classified: Vec<(CornerObservation, safety::PhaseSlip)> = bundle
            .observations
            .iter()
            .filter(|o| o.complete)
            .map(|o| (o.clone(), safety::classify(o, &self.cfg.slip_bands)))
            .collect();

        // 1) Close the loop on earlier tips.
        let resolutions = self.reviewer.observe_lap(
            bundle.lap,
            bundle.lap_valid,
            &classified,
            &self.cfg.reviewer,
        );
        let mut directives: Vec<CycleDirective> = Vec::new();
        for res in resolutions {
            self.counters.reviews_closed += 1;
            self.bandit.apply_outcome(
                res.event.corner_id,
                res.event.action,
                res.event.outcome,
                res.realized_gain_ms,
            );
            match res.event.outcome {
                ReviewOutcome::Success | ReviewOutcome::Overshoot => {
                    self.estimator.train(
                        res.event.action,
                        SpeedClass::from_min_speed_kmh(res.observed_min_speed_kmh),
                        res.realized_gain_ms,
                    );
                }
                ReviewOutcome::NoAttempt => {}
            }
            self.telemetry.log_review(&res.event);
            if let Some(d) = res.directive {
                directives.push(d);
            }
        }

        if !bundle.lap_valid {
            self.counters.laps_invalid += 1;
            debug!(lap = bundle.lap, "invalid lap; no reference update, no tips");
            self.log_cycle(&bundle, 0, &[], false, started);
            return;
        }

        // 2) Reference updates.
        for (obs, _) in &classified {
            self.reference.update(self.filter_key, obs, &self.cfg.reference);
        }

        // 3) Candidates.
        let inputs: Vec<CornerInput> = classified
            .iter()
            .map(|(obs, slip)| CornerInput {
                obs: obs.clone(),
                lookup: self
                    .reference
                    .get(self.filter_key, obs.corner_id, &self.cfg.reference),
                slip: *slip,
            })
            .collect();
        // Directives from this lap's outcomes constrain this same cycle;
        // nothing is carried further.
        let candidates = candidates::generate(&inputs, &directives, &self.cfg.candidates);
        let candidate_count = candidates.len();

        // 4) Utility + selection, under the estimator sub-budget.
        let mut degraded = false;
        let mut recommendations = Vec::new();
        for candidate in candidates {
            let within_budget = if self.cfg.budget.enforce_wall_clock {
                let within =
                    started.elapsed().as_millis() as u64 <= self.cfg.budget.estimator_budget_ms;
                if !within {
                    degraded = true;
                }
                within
            } else {
                true
            };

            let Some((obs, _)) = classified
                .iter()
                .find(|(o, _)| o.corner_id == candidate.corner_id)
            else {
                continue;
            };
            let ctx = UtilityContext {
                speed_class: SpeedClass::from_min_speed_kmh(obs.min_speed_kmh),
                filter_key: self.filter_key,
            };
            let estimate =
                self.estimator
                    .estimate(&candidate, &ctx, &self.cfg.utility, within_budget);

            let Some(selected) = self.selector.select(
                &mut self.bandit,
                &candidate,
                &estimate,
                bundle.lap,
                &self.cfg.selector,
            ) else {
                continue;
            };

            // 5) Open the review window for the issued tip.
            let metric = MetricKind::for_action(selected.action);
            let noise_band = match self
                .reference
                .get(self.filter_key, selected.corner_id, &self.cfg.reference)
            {
                ReferenceLookup::Ready(r) => r
                    .metric(metric)
                    .map(|s| self.cfg.reviewer.noise_band_iqr * s.iqr)
                    .filter(|band| *band > f64::EPSILON)
                    .unwrap_or_else(|| fallback_noise(metric)),
                ReferenceLookup::Insufficient { .. } => fallback_noise(metric),
            };
            self.reviewer.open(
                selected.corner_id,
                selected.action,
                selected.intensity,
                bundle.lap,
                Baseline::from_observation(obs, metric),
                noise_band,
                &self.cfg.reviewer,
            );
            self.counters.reviews_opened += 1;

            recommendations.push(CoachingRecommendation {
                corner_id: selected.corner_id,
                phase: selected.phase,
                action: selected.action,
                intensity: selected.intensity,
                theme: selected.theme,
            });
        }

        debug_assert!(recommendations.len() <= self.cfg.candidates.max_corners);
        self.counters.recommendations_emitted += recommendations.len() as u64;

        if degraded {
            self.counters.degraded_cycles += 1;
            let elapsed = started.elapsed().as_secs_f64() * 1000.0;
            warn!(lap = bundle.lap, elapsed_ms = elapsed, "estimator budget exceeded; heuristic path used");
            self.telemetry.log_degraded_cycle(bundle.lap, elapsed);
        }

        self.log_cycle(&bundle, candidate_count, &recommendations, degraded, started);
        self.undelivered = Some(recommendations);
        self.persist();
    }

    fn log_cycle(
        &mut self,
        bundle: &LapBundle,
        candidates: usize,
        recommendations: &[CoachingRecommendation],
        degraded: bool,
        started: Instant,
    ) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.cycle_latency_ms.add(elapsed_ms);
        if self.cfg.budget.enforce_wall_clock
            && elapsed_ms > self.cfg.budget.cycle_budget_ms as f64
        {
            warn!(
                lap = bundle.lap,
                elapsed_ms, "decision cycle exceeded its end-to-end budget"
            );
        }
        self.sink.log_cycle(&CycleRecord {
            lap: bundle.lap,
            lap_valid: bundle.lap_valid,
            observations: bundle.observations.len(),
            candidates,
            recommendations,
            degraded,
            elapsed_ms,
        });
    }
}
