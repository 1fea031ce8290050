// src/extractor.rs
//
// Feature extractor: the only stateful consumer of raw telemetry frames.
//
//  - absorbs bounded out-of-order delivery through a small reorder buffer
//    (frames beyond the window are dropped and counted, never queued
//    unboundedly),
//  - bridges telemetry gaps by holding the last known state up to a
//    configured maximum; past that the affected corner observation is
//    marked incomplete,
//  - runs hysteresis + dwell debounced edge detection on the brake and
//    throttle channels,
//  - segments each lap into per-corner observations with entry/min/exit
//    speed checkpoints and slip peaks,
//  - emits one `LapBundle` when a lap completes.
//
// Phase detection is inherently sequential; one extractor instance serves
// exactly one car / session and must be fed frames in arrival order.

use tracing::debug;

use crate::config::Config;
use crate::metrics::ExtractorCounters;
use crate::types::{
    CornerDefinition, CornerId, CornerObservation, LapNumber, TelemetryFrame, TimestampMs,
};

/// Everything the post-lap decision cycle needs about one completed lap.
#[derive(Debug, Clone)]
pub struct LapBundle {
    pub lap: LapNumber,
    /// Final validity verdict: latched false if any frame of the lap was
    /// flagged invalid upstream.
    pub lap_valid: bool,
    pub lap_time_ms: f64,
    pub observations: Vec<CornerObservation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Rise,
    Fall,
}

/// Hysteresis edge detector for one input channel.
///
/// An edge fires only after the raw signal has stayed across the threshold
/// for `dwell` consecutive frames, which debounces single-frame telemetry
/// jitter. The rising and falling thresholds are separated so the detector
/// does not chatter around a single level.
#[derive(Debug, Clone)]
struct EdgeDetector {
    dwell: u32,
    rise: f64,
    fall: f64,
    active: bool,
    above_count: u32,
    below_count: u32,
}

impl EdgeDetector {
    fn new(rise: f64, fall: f64, dwell: u32) -> Self {
        Self {
            dwell: dwell.max(1),
            rise,
            fall,
            active: false,
            above_count: 0,
            below_count: 0,
        }
    }

    fn update(&mut self, raw: f64) -> Option<Edge> {
        if !self.active {
            if raw > self.rise {
                self.above_count += 1;
                if self.above_count >= self.dwell {
                    self.active = true;
                    self.above_count = 0;
                    return Some(Edge::Rise);
                }
            } else {
                self.above_count = 0;
            }
        } else if raw < self.fall {
            self.below_count += 1;
            if self.below_count >= self.dwell {
                self.active = false;
                self.below_count = 0;
                return Some(Edge::Fall);
            }
        } else {
            self.below_count = 0;
        }
        None
    }
}

/// Work-in-progress record for the corner currently being driven.
#[derive(Debug, Clone)]
struct CornerProgress {
    def: CornerDefinition,
    entered_at_ms: TimestampMs,
    entry_speed_kmh: f64,
    min_speed_kmh: f64,
    peak_brake: f64,
    brake_onset_m: Option<f64>,
    brake_release_m: Option<f64>,
    throttle_onset_m: Option<f64>,
    throttle_onset_at: Option<(TimestampMs, f64)>,
    last_throttle: (TimestampMs, f64),
    entry_slip_peak: f64,
    exit_slip_peak: f64,
    /// Set when a telemetry gap exceeded the bridgeable maximum while this
    /// corner was live.
    degraded: bool,
}

impl CornerProgress {
    fn begin(def: CornerDefinition, frame: &TelemetryFrame) -> Self {
        Self {
            def,
            entered_at_ms: frame.timestamp_ms,
            entry_speed_kmh: frame.speed_kmh,
            min_speed_kmh: frame.speed_kmh,
            peak_brake: 0.0,
            brake_onset_m: None,
            brake_release_m: None,
            throttle_onset_m: None,
            throttle_onset_at: None,
            last_throttle: (frame.timestamp_ms, frame.throttle),
            entry_slip_peak: 0.0,
            exit_slip_peak: 0.0,
            degraded: false,
        }
    }

    /// Turn the progress record into an observation, or None when no phase
    /// was detectable at all (corner skipped, flat-out, penalty line).
    fn finalize(self, exit_frame: &TelemetryFrame, lap: LapNumber) -> Option<CornerObservation> {
        let any_marker = self.brake_onset_m.is_some()
            || self.brake_release_m.is_some()
            || self.throttle_onset_m.is_some();
        if !any_marker {
            return None;
        }

        let throttle_slope = match self.throttle_onset_at {
            Some((t0, thr0)) => {
                let (t1, thr1) = self.last_throttle;
                let dt_s = (t1 - t0) as f64 / 1000.0;
                if dt_s > 0.0 {
                    ((thr1 - thr0) / dt_s).max(0.0)
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        let brake_onset_m = self.brake_onset_m.unwrap_or(self.def.entry_s);
        let brake_release_m = self.brake_release_m.unwrap_or(self.def.apex_s);
        let throttle_onset_m = self.throttle_onset_m.unwrap_or(self.def.exit_s);

        let all_markers = self.brake_onset_m.is_some()
            && self.brake_release_m.is_some()
            && self.throttle_onset_m.is_some();
        let ordered =
            brake_onset_m <= brake_release_m && brake_release_m <= throttle_onset_m;
        let complete = all_markers && ordered && !self.degraded;

        Some(CornerObservation {
            corner_id: self.def.id,
            lap,
            entry_speed_kmh: self.entry_speed_kmh,
            min_speed_kmh: self.min_speed_kmh,
            exit_speed_kmh: exit_frame.speed_kmh,
            brake_onset_m,
            peak_brake: self.peak_brake,
            brake_release_m,
            throttle_onset_m,
            throttle_slope,
            entry_slip: self.entry_slip_peak,
            exit_slip: self.exit_slip_peak,
            corner_time_ms: (exit_frame.timestamp_ms - self.entered_at_ms) as f64,
            complete,
        })
    }
}

/// Per-session feature extractor. Consumes one car's frame stream at its
/// own pace; see module docs for ordering / gap semantics.
pub struct FeatureExtractor<'a> {
    cfg: &'a Config,
    /// Corner geometry, sorted by entry distance, non-overlapping.
    corners: Vec<CornerDefinition>,
    /// Pending frames sorted by timestamp (bounded reorder buffer).
    reorder: Vec<TelemetryFrame>,
    last_processed_ms: Option<TimestampMs>,
    current_lap: Option<LapNumber>,
    lap_valid: bool,
    lap_start_ms: TimestampMs,
    brake_edge: EdgeDetector,
    throttle_edge: EdgeDetector,
    progress: Option<CornerProgress>,
    finished: Vec<CornerObservation>,
    pub counters: ExtractorCounters,
}

impl<'a> FeatureExtractor<'a> {
    pub fn new(cfg: &'a Config, mut corners: Vec<CornerDefinition>) -> Self {
        corners.sort_by(|a, b| a.entry_s.partial_cmp(&b.entry_s).expect("finite corner marks"));
        let ex = &cfg.extractor;
        Self {
            cfg,
            corners,
            reorder: Vec::with_capacity(ex.reorder_window_frames + 1),
            last_processed_ms: None,
            current_lap: None,
            lap_valid: true,
            lap_start_ms: 0,
            brake_edge: EdgeDetector::new(
                ex.input_rise_threshold,
                ex.input_fall_threshold,
                ex.dwell_frames,
            ),
            throttle_edge: EdgeDetector::new(
                ex.input_rise_threshold,
                ex.input_fall_threshold,
                ex.dwell_frames,
            ),
            progress: None,
            finished: Vec::new(),
            counters: ExtractorCounters::default(),
        }
    }

    /// Feed one frame. Returns a completed lap's bundle when this frame
    /// closes out a lap.
    pub fn push_frame(&mut self, frame: TelemetryFrame) -> Option<LapBundle> {
        self.counters.frames_seen += 1;

        // Sorted insert into the bounded reorder buffer.
        let pos = self
            .reorder
            .partition_point(|f| f.timestamp_ms <= frame.timestamp_ms);
        self.reorder.insert(pos, frame);

        if self.reorder.len() <= self.cfg.extractor.reorder_window_frames {
            return None;
        }
        let next = self.reorder.remove(0);
        self.process_frame(next)
    }

    /// Drain the reorder buffer at session end. Laps completed during the
    /// drain are returned; a lap still in progress is discarded (its pending
    /// reviews resolve neutrally upstream).
    pub fn finish(&mut self) -> Vec<LapBundle> {
        let mut bundles = Vec::new();
        while !self.reorder.is_empty() {
            let next = self.reorder.remove(0);
            if let Some(bundle) = self.process_frame(next) {
                bundles.push(bundle);
            }
        }
        bundles
    }

    fn process_frame(&mut self, frame: TelemetryFrame) -> Option<LapBundle> {
        // Frames that slid past the reorder window arrive behind the clock;
        // drop them rather than rewinding phase state.
        if let Some(last) = self.last_processed_ms {
            if frame.timestamp_ms < last {
                self.counters.frames_dropped_disorder += 1;
                return None;
            }
            let gap = frame.timestamp_ms - last;
            if gap > self.cfg.extractor.max_bridgeable_gap_ms {
                self.counters.gaps_exceeded += 1;
                if let Some(p) = self.progress.as_mut() {
                    p.degraded = true;
                }
            }
        }
        self.last_processed_ms = Some(frame.timestamp_ms);

        let mut completed = None;
        match self.current_lap {
            None => {
                self.current_lap = Some(frame.lap);
                self.lap_start_ms = frame.timestamp_ms;
                self.lap_valid = frame.lap_valid;
            }
            Some(lap) if frame.lap > lap => {
                completed = Some(self.roll_lap(lap, &frame));
            }
            _ => {}
        }

        self.lap_valid &= frame.lap_valid;
        self.track_corner(&frame);
        self.track_inputs(&frame);

        completed
    }

    /// Close out `lap` and reset per-lap state for the frame that opens the
    /// next one.
    fn roll_lap(&mut self, lap: LapNumber, next_frame: &TelemetryFrame) -> LapBundle {
        // A corner still live at the line never completed its phases.
        if let Some(p) = self.progress.take() {
            self.counters.corners_incomplete += 1;
            debug!(corner = %p.def.id, "corner unfinished at lap boundary");
        }

        let bundle = LapBundle {
            lap,
            lap_valid: self.lap_valid,
            lap_time_ms: (next_frame.timestamp_ms - self.lap_start_ms) as f64,
            observations: std::mem::take(&mut self.finished),
        };

        self.current_lap = Some(next_frame.lap);
        self.lap_start_ms = next_frame.timestamp_ms;
        self.lap_valid = next_frame.lap_valid;
        bundle
    }

    fn track_corner(&mut self, frame: &TelemetryFrame) {
        // Finalize the live corner once we pass its exit mark.
        if let Some(p) = self.progress.as_ref() {
            if frame.lap_distance_m >= p.def.exit_s || frame.lap_distance_m < p.def.entry_s {
                let p = self.progress.take().expect("progress checked above");
                let lap = self.current_lap.unwrap_or(frame.lap);
                match p.finalize(frame, lap) {
                    Some(obs) => {
                        if !obs.complete {
                            self.counters.corners_incomplete += 1;
                        }
                        debug!(
                            corner = %obs.corner_id,
                            complete = obs.complete,
                            "corner observation closed"
                        );
                        self.finished.push(obs);
                    }
                    None => {
                        debug!("corner passed without detectable phases");
                    }
                }
            }
        }

        if self.progress.is_none() {
            if let Some(def) = self
                .corners
                .iter()
                .find(|c| c.contains(frame.lap_distance_m))
                .copied()
            {
                self.progress = Some(CornerProgress::begin(def, frame));
            }
        }

        if let Some(p) = self.progress.as_mut() {
            p.min_speed_kmh = p.min_speed_kmh.min(frame.speed_kmh);
            if frame.brake > p.peak_brake {
                p.peak_brake = frame.brake;
            }
            // Entry window watches the front axle, exit window the rear.
            if frame.lap_distance_m <= p.def.apex_s {
                p.entry_slip_peak = p.entry_slip_peak.max(frame.front_slip);
            } else {
                p.exit_slip_peak = p.exit_slip_peak.max(frame.rear_slip);
            }
            p.last_throttle = (frame.timestamp_ms, frame.throttle);
        }
    }

    fn track_inputs(&mut self, frame: &TelemetryFrame) {
        let brake_edge = self.brake_edge.update(frame.brake);
        let throttle_edge = self.throttle_edge.update(frame.throttle);

        let Some(p) = self.progress.as_mut() else {
            return;
        };

        match brake_edge {
            Some(Edge::Rise) if p.brake_onset_m.is_none() => {
                p.brake_onset_m = Some(frame.lap_distance_m);
                debug!(
                    corner = %p.def.id,
                    distance = frame.lap_distance_m,
                    "brake onset"
                );
            }
            Some(Edge::Fall) if p.brake_onset_m.is_some() && p.brake_release_m.is_none() => {
                p.brake_release_m = Some(frame.lap_distance_m);
                debug!(
                    corner = %p.def.id,
                    distance = frame.lap_distance_m,
                    "brake release"
                );
            }
            _ => {}
        }

        if let Some(Edge::Rise) = throttle_edge {
            if p.throttle_onset_m.is_none() {
                p.throttle_onset_m = Some(frame.lap_distance_m);
                p.throttle_onset_at = Some((frame.timestamp_ms, frame.throttle));
                debug!(
                    corner = %p.def.id,
                    distance = frame.lap_distance_m,
                    "throttle pickup"
                );
            }
        }
    }

    /// Corner ids this extractor knows about, in track order.
    pub fn corner_ids(&self) -> Vec<CornerId> {
        self.corners.iter().map(|c| c.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn corner() -> CornerDefinition {
        CornerDefinition {
            id: CornerId::new(7, 3),
            entry_s: 1000.0,
            apex_s: 1150.0,
            exit_s: 1300.0,
        }
    }

    fn frame(ts: TimestampMs, lap: LapNumber, dist: f64) -> TelemetryFrame {
        TelemetryFrame {
            timestamp_ms: ts,
            lap,
            lap_distance_m: dist,
            speed_kmh: 180.0,
            throttle: 1.0,
            brake: 0.0,
            steering: 0.0,
            gear: 5,
            front_slip: 0.2,
            rear_slip: 0.2,
            lap_valid: true,
        }
    }

    /// Drive one scripted lap through the corner: braking from 1020..1140,
    /// coasting, throttle from 1200.
    fn scripted_lap(lap: LapNumber, t0: TimestampMs) -> Vec<TelemetryFrame> {
        let mut frames = Vec::new();
        let mut ts = t0;
        let mut dist = 900.0;
        while dist < 1400.0 {
            let mut f = frame(ts, lap, dist);
            if (1020.0..1140.0).contains(&dist) {
                f.brake = 0.8;
                f.throttle = 0.0;
                f.speed_kmh = 140.0;
            } else if (1140.0..1200.0).contains(&dist) {
                f.brake = 0.0;
                f.throttle = 0.0;
                f.speed_kmh = 120.0;
            } else if dist >= 1200.0 {
                f.brake = 0.0;
                f.throttle = 0.9;
                f.speed_kmh = 150.0;
            }
            frames.push(f);
            ts += 20;
            dist += 10.0;
        }
        // Roll into the next lap so the bundle is emitted.
        frames.push(frame(ts, lap + 1, 0.0));
        frames
    }

    fn run(frames: Vec<TelemetryFrame>) -> (Vec<LapBundle>, ExtractorCounters) {
        let cfg = Config::default();
        let mut fx = FeatureExtractor::new(&cfg, vec![corner()]);
        let mut bundles = Vec::new();
        for f in frames {
            if let Some(b) = fx.push_frame(f) {
                bundles.push(b);
            }
        }
        bundles.extend(fx.finish());
        (bundles, fx.counters)
    }

    #[test]
    fn scripted_lap_yields_one_complete_observation() {
        let (bundles, _) = run(scripted_lap(1, 0));
        assert_eq!(bundles.len(), 1);
        let bundle = &bundles[0];
        assert_eq!(bundle.lap, 1);
        assert!(bundle.lap_valid);
        assert_eq!(bundle.observations.len(), 1);

        let obs = &bundle.observations[0];
        assert!(obs.complete, "phases detected in order: {obs:?}");
        assert!(obs.brake_onset_m >= 1020.0 && obs.brake_onset_m <= 1080.0);
        assert!(obs.brake_release_m > obs.brake_onset_m);
        assert!(obs.throttle_onset_m >= obs.brake_release_m);
        assert!(obs.min_speed_kmh <= 120.0);
        assert!(obs.corner_time_ms > 0.0);
    }

    #[test]
    fn single_frame_jitter_does_not_fire_markers() {
        let mut frames = scripted_lap(1, 0);
        // One-frame brake spike inside the corner but before the real
        // braking zone. With a dwell of 3 frames it must not fire.
        for f in frames.iter_mut() {
            if (1005.0..1015.0).contains(&f.lap_distance_m) {
                f.brake = 1.0;
            }
        }
        let (bundles, _) = run(frames);
        let obs = &bundles[0].observations[0];
        assert!(obs.brake_onset_m >= 1020.0, "onset {}", obs.brake_onset_m);
    }

    #[test]
    fn out_of_order_frame_beyond_window_is_dropped() {
        let mut frames = scripted_lap(1, 1000);
        // A frame from far in the past, injected late in the stream.
        let stale = frame(0, 1, 905.0);
        frames.insert(frames.len() - 5, stale);
        let (_, counters) = run(frames);
        assert_eq!(counters.frames_dropped_disorder, 1);
    }

    #[test]
    fn long_gap_marks_observation_incomplete() {
        let mut frames = scripted_lap(1, 0);
        // Open a >500ms hole mid-corner.
        let n = frames.len();
        for (i, f) in frames.iter_mut().enumerate() {
            if i > n / 2 {
                f.timestamp_ms += 2_000;
            }
        }
        let (bundles, counters) = run(frames);
        assert!(counters.gaps_exceeded >= 1);
        let obs = &bundles[0].observations[0];
        assert!(!obs.complete);
    }

    #[test]
    fn invalid_frame_latches_lap_invalid() {
        let mut frames = scripted_lap(1, 0);
        let n = frames.len();
        frames[n / 2].lap_valid = false;
        let (bundles, _) = run(frames);
        assert!(!bundles[0].lap_valid);
    }

    #[test]
    fn corner_without_inputs_yields_no_observation() {
        // Flat-out pass: throttle pinned, never brakes -> throttle edge never
        // rises (already active from warm-up), no markers at all.
        let mut frames = Vec::new();
        let mut ts = 0;
        let mut dist = 900.0;
        while dist < 1400.0 {
            frames.push(frame(ts, 1, dist));
            ts += 20;
            dist += 10.0;
        }
        frames.push(frame(ts, 2, 0.0));
        let (bundles, _) = run(frames);
        assert_eq!(bundles.len(), 1);
        assert!(bundles[0].observations.is_empty());
    }
}
