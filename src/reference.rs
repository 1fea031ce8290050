// src/reference.rs
//
// Per-corner reference model: running median / IQR for every observation
// metric, kept separately per filter key (assists + input device).
//
// Only complete observations from valid laps enter the history. Stats are
// computed over the "active mode": when the corner-time distribution splits
// into two clearly separated clusters (two racing lines), the faster
// cluster is the reference and the other is retained but unused. More than
// two clusters falls back to the most-sampled cluster and is flagged for
// review in the logs.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ReferenceConfig;
use crate::stats;
use crate::types::{CornerId, CornerObservation, FilterKey, LapNumber, MetricKind};

fn metric_index(kind: MetricKind) -> usize {
    MetricKind::ALL
        .iter()
        .position(|k| *k == kind)
        .expect("metric kind is a member of ALL")
}

/// One valid lap's metrics for one corner.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetricRow {
    lap: LapNumber,
    values: [f64; MetricKind::ALL.len()],
}

impl MetricRow {
    fn from_observation(obs: &CornerObservation) -> Self {
        let mut values = [0.0; MetricKind::ALL.len()];
        for (i, kind) in MetricKind::ALL.iter().enumerate() {
            values[i] = obs.metric(*kind);
        }
        Self {
            lap: obs.lap,
            values,
        }
    }
}

/// Median / IQR summary for one metric over the active mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub median: f64,
    pub iqr: f64,
    pub samples: usize,
}

/// Windowed history of one corner under one filter key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CornerHistory {
    rows: VecDeque<MetricRow>,
}

impl CornerHistory {
    fn push(&mut self, obs: &CornerObservation, window: usize) {
        debug_assert!(obs.complete, "incomplete observations never enter the reference");
        if self.rows.len() == window {
            self.rows.pop_front();
        }
        self.rows.push_back(MetricRow::from_observation(obs));
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Indices of the rows belonging to the active (reference) mode.
    ///
    /// Clusters are split on corner time at gaps wider than
    /// `bimodal_split_iqr` IQRs. Two clusters: the faster one wins. More
    /// than two: the most-sampled one wins (faster on ties) and the corner
    /// is flagged for review.
    fn active_rows(&self, corner_id: CornerId, cfg: &ReferenceConfig) -> Vec<usize> {
        let n = self.rows.len();
        let all: Vec<usize> = (0..n).collect();
        if n < 4 {
            return all;
        }

        let time_idx = metric_index(MetricKind::CornerTime);
        let mut by_time: Vec<(f64, usize)> = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, r)| (r.values[time_idx], i))
            .collect();
        by_time.sort_by(|a, b| a.0.partial_cmp(&b.0).expect("finite corner times"));

        let times: Vec<f64> = by_time.iter().map(|(t, _)| *t).collect();
        let Some(q) = stats::quartiles(&times) else {
            return all;
        };
        // A mode boundary must stand out against both the overall spread and
        // the typical lap-to-lap spacing, otherwise evenly spread histories
        // would fragment into singletons. The upper quartile of gaps is used
        // because quantized metrics make the median gap collapse to zero.
        let gaps: Vec<f64> = times.windows(2).map(|w| w[1] - w[0]).collect();
        let typical_gap = stats::quartiles(&gaps).map(|g| g.q3).unwrap_or(0.0);
        let min_gap = (cfg.bimodal_split_iqr * q.iqr()).max(3.0 * typical_gap);
        if min_gap <= f64::EPSILON {
            return all;
        }

        // Cluster boundaries at qualifying gaps, scanned in time order.
        let mut clusters: Vec<Vec<usize>> = vec![vec![by_time[0].1]];
        for w in by_time.windows(2) {
            if w[1].0 - w[0].0 > min_gap {
                clusters.push(Vec::new());
            }
            clusters.last_mut().expect("at least one cluster").push(w[1].1);
        }

        // A cluster below two laps is an outlier, not a racing line; the
        // fence deals with those.
        if clusters.iter().any(|c| c.len() < 2) {
            return all;
        }

        match clusters.len() {
            1 => all,
            2 => {
                // Faster mode = the cluster holding the lower corner times;
                // clusters are built in ascending time order.
                clusters.into_iter().next().expect("two clusters")
            }
            n_clusters => {
                warn!(
                    corner = %corner_id,
                    clusters = n_clusters,
                    "reference split into more than two clusters; using most-sampled"
                );
                clusters
                    .into_iter()
                    .max_by_key(|c| c.len())
                    .expect("non-empty cluster list")
            }
        }
    }

    /// Stats for one metric over the active mode, with the outlier fence
    /// applied. None when the history is empty.
    pub fn metric_stats(
        &self,
        corner_id: CornerId,
        kind: MetricKind,
        cfg: &ReferenceConfig,
    ) -> Option<MetricStats> {
        let active = self.active_rows(corner_id, cfg);
        let idx = metric_index(kind);
        let raw: Vec<f64> = active.iter().map(|i| self.rows[*i].values[idx]).collect();
        let kept = stats::iqr_filtered(&raw, cfg.outlier_fence_iqr);
        let q = stats::quartiles(&kept)?;
        Some(MetricStats {
            median: q.median,
            iqr: q.iqr(),
            samples: kept.len(),
        })
    }

    /// Recent corner times (chronological) for consistency scoring.
    fn corner_times(&self) -> Vec<f64> {
        let idx = metric_index(MetricKind::CornerTime);
        self.rows.iter().map(|r| r.values[idx]).collect()
    }
}

/// Read-only snapshot of one corner's reference, built on demand for a
/// decision cycle.
#[derive(Debug, Clone)]
pub struct CornerReference {
    pub corner_id: CornerId,
    pub samples: usize,
    pub time: MetricStats,
    pub metrics: HashMap<MetricKind, MetricStats>,
    /// Driver spread vs the reference IQR; higher = less consistent.
    pub consistency_ratio: f64,
}

impl CornerReference {
    pub fn metric(&self, kind: MetricKind) -> Option<MetricStats> {
        self.metrics.get(&kind).copied()
    }
}

/// Answer to a reference lookup. Below the minimum sample threshold the
/// caller must withhold pace tips and fall back to consistency framing.
#[derive(Debug, Clone)]
pub enum ReferenceLookup {
    Ready(CornerReference),
    Insufficient { samples: usize },
}

/// Reference model for one driver on one track: every corner's history per
/// filter key.
///
/// Persistence goes through `entries` / `from_entries` rather than direct
/// serde on the struct: JSON cannot key maps by composite types.
#[derive(Debug, Clone, Default)]
pub struct ReferenceModel {
    histories: HashMap<FilterKey, HashMap<CornerId, CornerHistory>>,
}

impl ReferenceModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flatten into serde-friendly entries, in deterministic key order.
    pub fn entries(&self) -> Vec<(FilterKey, CornerId, CornerHistory)> {
        let mut out = Vec::new();
        for (key, per_corner) in &self.histories {
            for (corner, history) in per_corner {
                out.push((*key, *corner, history.clone()));
            }
        }
        out.sort_by(|a, b| (a.0.to_string(), a.1).cmp(&(b.0.to_string(), b.1)));
        out
    }

    pub fn from_entries(entries: Vec<(FilterKey, CornerId, CornerHistory)>) -> Self {
        let mut model = Self::default();
        for (key, corner, history) in entries {
            model.histories.entry(key).or_default().insert(corner, history);
        }
        model
    }

    /// Incorporate one observation from a valid lap. Incomplete records are
    /// ignored here; the caller has already counted them.
    pub fn update(&mut self, key: FilterKey, obs: &CornerObservation, cfg: &ReferenceConfig) {
        if !obs.complete {
            return;
        }
        self.histories
            .entry(key)
            .or_default()
            .entry(obs.corner_id)
            .or_default()
            .push(obs, cfg.history_window);
    }

    pub fn get(
        &self,
        key: FilterKey,
        corner_id: CornerId,
        cfg: &ReferenceConfig,
    ) -> ReferenceLookup {
        let Some(history) = self
            .histories
            .get(&key)
            .and_then(|per_corner| per_corner.get(&corner_id))
        else {
            return ReferenceLookup::Insufficient { samples: 0 };
        };

        if history.len() < cfg.min_samples {
            return ReferenceLookup::Insufficient {
                samples: history.len(),
            };
        }

        let Some(time) = history.metric_stats(corner_id, MetricKind::CornerTime, cfg) else {
            return ReferenceLookup::Insufficient {
                samples: history.len(),
            };
        };

        let mut metrics = HashMap::new();
        for kind in MetricKind::ALL {
            if let Some(s) = history.metric_stats(corner_id, kind, cfg) {
                metrics.insert(kind, s);
            }
        }

        let consistency_ratio = stats::consistency_ratio(&history.corner_times(), time.iqr);

        ReferenceLookup::Ready(CornerReference {
            corner_id,
            samples: history.len(),
            time,
            metrics,
            consistency_ratio,
        })
    }

    /// Corners with any history under the given filter key, in id order.
    pub fn known_corners(&self, key: FilterKey) -> Vec<CornerId> {
        let mut ids: Vec<CornerId> = self
            .histories
            .get(&key)
            .map(|per_corner| per_corner.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssistClass, InputDevice};

    fn key() -> FilterKey {
        FilterKey {
            assists: AssistClass::None,
            device: InputDevice::Wheel,
        }
    }

    fn obs(lap: LapNumber, corner_time_ms: f64, brake_onset_m: f64) -> CornerObservation {
        CornerObservation {
            corner_id: CornerId::new(1, 4),
            lap,
            entry_speed_kmh: 210.0,
            min_speed_kmh: 110.0,
            exit_speed_kmh: 170.0,
            brake_onset_m,
            peak_brake: 0.92,
            brake_release_m: brake_onset_m + 60.0,
            throttle_onset_m: brake_onset_m + 110.0,
            throttle_slope: 0.7,
            entry_slip: 0.3,
            exit_slip: 0.3,
            corner_time_ms,
            complete: true,
        }
    }

    #[test]
    fn below_min_samples_is_insufficient() {
        let cfg = ReferenceConfig::default();
        let mut model = ReferenceModel::new();
        for lap in 1..=4 {
            model.update(key(), &obs(lap, 4200.0, 1020.0), &cfg);
        }
        match model.get(key(), CornerId::new(1, 4), &cfg) {
            ReferenceLookup::Insufficient { samples } => assert_eq!(samples, 4),
            ReferenceLookup::Ready(_) => panic!("4 laps must not be enough"),
        }
    }

    #[test]
    fn incomplete_observations_are_excluded() {
        let cfg = ReferenceConfig::default();
        let mut model = ReferenceModel::new();
        for lap in 1..=10 {
            let mut o = obs(lap, 4200.0, 1020.0);
            o.complete = false;
            model.update(key(), &o, &cfg);
        }
        assert!(matches!(
            model.get(key(), CornerId::new(1, 4), &cfg),
            ReferenceLookup::Insufficient { samples: 0 }
        ));
    }

    /// For a driver whose corner time improves monotonically, the newest
    /// lap's delta against the reported median never flips positive.
    #[test]
    fn monotone_improvement_keeps_delta_sign() {
        let cfg = ReferenceConfig::default();
        let mut model = ReferenceModel::new();
        let mut time = 5000.0;
        for lap in 1..=30 {
            time -= 10.0;
            model.update(key(), &obs(lap, time, 1020.0), &cfg);
            if let ReferenceLookup::Ready(r) = model.get(key(), CornerId::new(1, 4), &cfg) {
                let delta = time - r.time.median;
                assert!(delta <= 0.0, "lap {lap}: delta {delta} flipped sign");
            }
        }
    }

    #[test]
    fn bimodal_history_prefers_the_faster_mode() {
        let cfg = ReferenceConfig::default();
        let mut model = ReferenceModel::new();
        // Two separated lines: ~4000ms and ~5000ms, slower line sampled more.
        for lap in 1..=6 {
            model.update(key(), &obs(lap, 4000.0 + lap as f64, 1020.0), &cfg);
        }
        for lap in 7..=16 {
            model.update(key(), &obs(lap, 5000.0 + lap as f64, 1020.0), &cfg);
        }
        match model.get(key(), CornerId::new(1, 4), &cfg) {
            ReferenceLookup::Ready(r) => {
                assert!(
                    r.time.median < 4500.0,
                    "median {} should come from the fast mode",
                    r.time.median
                );
            }
            ReferenceLookup::Insufficient { .. } => panic!("enough samples"),
        }
    }

    #[test]
    fn window_caps_history_length() {
        let mut cfg = ReferenceConfig::default();
        cfg.history_window = 10;
        let mut model = ReferenceModel::new();
        for lap in 1..=25 {
            model.update(key(), &obs(lap, 4200.0, 1020.0), &cfg);
        }
        match model.get(key(), CornerId::new(1, 4), &cfg) {
            ReferenceLookup::Ready(r) => assert_eq!(r.samples, 10),
            ReferenceLookup::Insufficient { .. } => panic!("enough samples"),
        }
    }
}
