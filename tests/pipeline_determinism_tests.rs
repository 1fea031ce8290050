// tests/pipeline_determinism_tests.rs
//
// Replaying an identical recorded frame stream through the full pipeline
// must yield identical recommendation sequences, and the per-lap output
// bounds must hold throughout.

use apexcoach::config::Config;
use apexcoach::logging::NoopSink;
use apexcoach::pipeline::CoachingSession;
use apexcoach::store::{
    BanditStateRepository, InMemoryBanditStore, InMemoryReferenceStore, ReferenceStatsRepository,
};
use apexcoach::telemetry::TelemetrySink;
use apexcoach::types::{
    AssistClass, CoachingRecommendation, CornerDefinition, CornerId, DriverId, FilterKey,
    InputDevice, TelemetryFrame, TimestampMs,
};

fn corners() -> Vec<CornerDefinition> {
    (1..=3u8)
        .map(|i| {
            let entry = 500.0 * i as f64;
            CornerDefinition {
                id: CornerId::new(1, i),
                entry_s: entry,
                apex_s: entry + 150.0,
                exit_s: entry + 300.0,
            }
        })
        .collect()
}

/// Deterministic pseudo-noise without an RNG: every run sees the same
/// stream, which is the whole point.
fn jitter(lap: u32, corner: usize) -> f64 {
    ((lap as usize * 7 + corner * 13) % 11) as f64 - 5.0
}

/// Script a full session: per-corner braking habits that slowly improve,
/// one invalid lap in the middle.
fn scripted_session(laps: u32) -> Vec<TelemetryFrame> {
    let corners = corners();
    let mut frames = Vec::new();
    let mut ts: TimestampMs = 0;
    let track_len = 500.0 * (corners.len() as f64 + 1.0);

    for lap in 1..=laps {
        let lap_valid = lap != 4;
        let mut dist = 0.0;
        while dist < track_len {
            let mut speed_kmh = 200.0;
            let mut throttle = 1.0;
            let mut brake = 0.0;
            let front_slip = 0.2;
            let rear_slip = 0.2;

            for (i, c) in corners.iter().enumerate() {
                let delay = (35.0 - lap as f64).max(5.0) + jitter(lap, i);
                let brake_start = c.entry_s + 20.0 + delay;
                let pickup = c.apex_s + 40.0 + jitter(lap, i + 7);
                if dist >= brake_start && dist < c.apex_s {
                    speed_kmh = 125.0;
                    throttle = 0.0;
                    brake = 0.8;
                } else if dist >= c.apex_s && dist < pickup {
                    speed_kmh = 110.0;
                    throttle = 0.0;
                } else if dist >= pickup && dist < c.exit_s {
                    speed_kmh = 155.0;
                    throttle = 0.85;
                }
            }

            frames.push(TelemetryFrame {
                timestamp_ms: ts,
                lap,
                lap_distance_m: dist,
                speed_kmh,
                throttle,
                brake,
                steering: 0.0,
                gear: 4,
                front_slip,
                rear_slip,
                lap_valid,
            });
            ts += 20;
            dist += speed_kmh / 3.6 * 0.02;
        }
    }
    frames
}

/// Run one full session over the stream; returns every delivered
/// recommendation tagged with the lap it was issued on.
fn run_session(frames: &[TelemetryFrame], cfg: &Config) -> Vec<(u32, Vec<CoachingRecommendation>)> {
    let ref_store = InMemoryReferenceStore::new();
    let bandit_store = InMemoryBanditStore::new();
    let mut session = CoachingSession::new(
        cfg,
        DriverId(7),
        FilterKey {
            assists: AssistClass::None,
            device: InputDevice::Wheel,
        },
        corners(),
        &ref_store,
        &bandit_store,
        NoopSink,
        TelemetrySink::off(),
    );

    let mut delivered = Vec::new();
    for frame in frames {
        session.push_frame(*frame);
        let recs = session.take_recommendations();
        if !recs.is_empty() {
            delivered.push((frame.lap, recs));
        }
    }
    session.finish();
    delivered
}

fn replay_config() -> Config {
    let mut cfg = Config::default();
    cfg.seed = 1234;
    // Offline replay ignores the wall clock so both runs take the same
    // estimator path.
    cfg.budget.enforce_wall_clock = false;
    cfg
}

#[test]
fn identical_streams_yield_identical_recommendations() {
    let frames = scripted_session(14);
    let cfg = replay_config();
    let a = run_session(&frames, &cfg);
    let b = run_session(&frames, &cfg);
    assert_eq!(a, b);
    assert!(
        a.iter().any(|(_, recs)| !recs.is_empty()),
        "the scripted session must actually coach something"
    );
}

#[test]
fn per_lap_bounds_hold() {
    let frames = scripted_session(14);
    let cfg = replay_config();
    for (lap, recs) in run_session(&frames, &cfg) {
        assert!(recs.len() <= 3, "lap {lap}: more than 3 recommendations");
        let mut ids: Vec<CornerId> = recs.iter().map(|r| r.corner_id).collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), before, "lap {lap}: corner coached twice");
    }
}

#[test]
fn invalid_lap_produces_no_recommendations() {
    let frames = scripted_session(14);
    let cfg = replay_config();
    let delivered = run_session(&frames, &cfg);
    // Lap 4 is scripted invalid. Its completion cycle runs while lap 5's
    // first frames stream in, so a tip delivered during lap 5 could only
    // have come from the invalid lap.
    assert!(
        delivered.iter().all(|(lap, _)| *lap != 5),
        "invalid lap was coached"
    );
}

#[test]
fn learning_state_is_persisted_at_session_end() {
    let frames = scripted_session(14);
    let cfg = replay_config();

    let ref_store = InMemoryReferenceStore::new();
    let bandit_store = InMemoryBanditStore::new();
    let driver = DriverId(7);
    let key = FilterKey {
        assists: AssistClass::None,
        device: InputDevice::Wheel,
    };
    let mut session = CoachingSession::new(
        &cfg,
        driver,
        key,
        corners(),
        &ref_store,
        &bandit_store,
        NoopSink,
        TelemetrySink::off(),
    );
    for frame in &frames {
        session.push_frame(*frame);
        session.take_recommendations();
    }
    session.finish();

    let bandit = bandit_store.load(driver);
    assert!(
        !bandit.entries().is_empty(),
        "coached arms must be persisted"
    );
    let reference = ref_store.load(driver);
    assert!(!reference.known_corners(key).is_empty());
}
