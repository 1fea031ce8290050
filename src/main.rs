// src/main.rs
//
// Research-harness friendly CLI entrypoint for apexcoach.
//
// Constraints:
// - CLI profile precedence:
//     --profile overrides env;
//     if missing use APEXCOACH_PROFILE (default Balanced).
// - Deterministic runs via --seed (drives the synthetic session and the
//   selector's RNG stream).
// - Lap count, optional per-cycle JSONL log, verbosity.
// - Print concise run header (profile, laps, cfg version) and an
//   end-of-run KPI summary.
//
// The harness simulates a driver with per-corner habits who reacts to the
// delivered tips, so the full loop (extract -> rank -> gate -> select ->
// review -> learn) is exercised end to end.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::EnvFilter;

use apexcoach::logging::{EventSink, FileSink, NoopSink};
use apexcoach::pipeline::CoachingSession;
use apexcoach::store::{InMemoryBanditStore, InMemoryReferenceStore};
use apexcoach::telemetry::TelemetrySink;
use apexcoach::types::{
    ActionClass, AssistClass, CoachingRecommendation, CornerDefinition, CornerId, DriverId,
    FilterKey, InputDevice, TelemetryFrame, TimestampMs,
};
use apexcoach::{resolve_effective_profile, CoachProfile, Config};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ProfileArg {
    Gentle,
    Balanced,
    Assertive,
}

impl From<ProfileArg> for CoachProfile {
    fn from(p: ProfileArg) -> Self {
        match p {
            ProfileArg::Gentle => CoachProfile::Gentle,
            ProfileArg::Balanced => CoachProfile::Balanced,
            ProfileArg::Assertive => CoachProfile::Assertive,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "apexcoach",
    about = "Post-lap driving coach decision engine (research harness)",
    version
)]
struct Args {
    /// Number of synthetic laps to run.
    #[arg(long, default_value_t = 25)]
    laps: u32,

    /// Coach profile preset (optional).
    #[arg(long, value_enum)]
    profile: Option<ProfileArg>,

    /// Deterministic seed for the synthetic session and the selector.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Number of corners on the synthetic track.
    #[arg(long, default_value_t = 8)]
    corners: u8,

    /// Optional per-cycle JSONL log file.
    #[arg(long)]
    log_file: Option<String>,

    /// Record the synthetic frame stream to a JSONL log.
    #[arg(long)]
    record: Option<String>,

    /// Replay a recorded frame log instead of simulating (ignores --laps;
    /// disables the wall-clock budget for bit-exact decisions).
    #[arg(long, conflicts_with = "record")]
    replay: Option<String>,

    /// Verbosity: repeat for more (-v: tips, -vv: debug logs).
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// One corner's driving habits, mutated as the driver reacts to tips.
struct CornerHabit {
    def: CornerDefinition,
    /// How many metres past the ideal point braking starts.
    brake_delay_m: f64,
    /// How many metres past the apex the throttle comes back.
    pickup_delay_m: f64,
    /// Transient exit-slip spike after an over-eager throttle change.
    overdriving: bool,
}

/// Deterministic synthetic driver: seeded habits, seeded response to tips.
struct SyntheticDriver {
    rng: ChaCha8Rng,
    habits: Vec<CornerHabit>,
    track_len_m: f64,
}

impl SyntheticDriver {
    fn new(seed: u64, corners: u8) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(0x5eed));
        let mut habits = Vec::new();
        for i in 0..corners {
            let entry = 400.0 * (i as f64 + 1.0);
            habits.push(CornerHabit {
                def: CornerDefinition {
                    id: CornerId::new(1, i + 1),
                    entry_s: entry,
                    apex_s: entry + 150.0,
                    exit_s: entry + 300.0,
                },
                brake_delay_m: rng.gen_range(0.0..50.0),
                pickup_delay_m: rng.gen_range(10.0..70.0),
                overdriving: false,
            });
        }
        let track_len_m = 400.0 * (corners as f64 + 1.5);
        Self {
            rng,
            habits,
            track_len_m,
        }
    }

    fn corners(&self) -> Vec<CornerDefinition> {
        self.habits.iter().map(|h| h.def).collect()
    }

    /// React to a delivered tip. Most tips are attempted; some are ignored;
    /// eager throttle changes occasionally overdo it.
    fn apply_tip(&mut self, rec: &CoachingRecommendation) {
        let attempted = self.rng.gen_bool(0.75);
        let Some(habit) = self
            .habits
            .iter_mut()
            .find(|h| h.def.id == rec.corner_id)
        else {
            return;
        };
        if !attempted {
            return;
        }
        match rec.action {
            ActionClass::BrakeEarlier | ActionClass::BuildPressureFaster => {
                habit.brake_delay_m *= 0.35;
            }
            ActionClass::ReleaseEarlier => {
                habit.brake_delay_m *= 0.7;
            }
            ActionClass::ThrottleEarlierProgressive => {
                habit.pickup_delay_m *= 0.4;
                habit.overdriving = self.rng.gen_bool(0.2);
            }
            ActionClass::ReduceSteerThenThrottle => {
                habit.pickup_delay_m *= 0.8;
                habit.overdriving = false;
            }
        }
    }

    /// Generate one lap of frames at 20 ms cadence.
    fn lap_frames(&mut self, lap: u32, t0: TimestampMs) -> (Vec<TelemetryFrame>, TimestampMs) {
        let mut frames = Vec::new();
        let mut ts = t0;
        let mut dist = 0.0;

        // Small lap-to-lap scatter so reference IQRs are non-degenerate.
        let jitter: Vec<f64> = (0..self.habits.len())
            .map(|_| self.rng.gen_range(-6.0..6.0))
            .collect();

        while dist < self.track_len_m {
            let mut speed_kmh = 210.0;
            let mut throttle = 1.0;
            let mut brake = 0.0;
            let mut front_slip = 0.15;
            let mut rear_slip = 0.15;

            for (i, habit) in self.habits.iter().enumerate() {
                let brake_start = habit.def.entry_s + 20.0 + habit.brake_delay_m + jitter[i];
                let pickup = habit.def.apex_s + habit.pickup_delay_m + jitter[i];
                if dist >= brake_start && dist < habit.def.apex_s {
                    speed_kmh = 130.0;
                    throttle = 0.0;
                    brake = 0.85;
                    // Late braking pushes the front axle toward the limit.
                    front_slip = 0.25 + habit.brake_delay_m / 90.0;
                } else if dist >= habit.def.apex_s && dist < pickup {
                    speed_kmh = 115.0;
                    throttle = 0.0;
                    brake = 0.0;
                } else if dist >= pickup && dist < habit.def.exit_s {
                    speed_kmh = 160.0;
                    throttle = 0.9;
                    brake = 0.0;
                    rear_slip = if habit.overdriving { 0.92 } else { 0.3 };
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
                lap_valid: true,
            });

            ts += 20;
            dist += speed_kmh / 3.6 * 0.02;
        }

        // Overdriving is transient; one lap of wheelspin teaches the lesson.
        for habit in self.habits.iter_mut() {
            habit.overdriving = false;
        }

        (frames, ts)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let effective = resolve_effective_profile(args.profile.map(Into::into));
    effective.log_startup();

    let mut cfg = Config::for_profile(effective.profile);
    cfg.seed = args.seed;
    if args.replay.is_some() {
        cfg.budget.enforce_wall_clock = false;
    }

    println!(
        "apexcoach run: profile={} laps={} corners={} seed={} cfg={}",
        effective.profile.as_str(),
        args.laps,
        args.corners,
        args.seed,
        cfg.version
    );

    let ref_store = InMemoryReferenceStore::new();
    let bandit_store = InMemoryBanditStore::new();
    let sink: Box<dyn EventSink> = match &args.log_file {
        Some(path) => Box::new(
            FileSink::create(path).with_context(|| format!("creating log file {path}"))?,
        ),
        None => Box::new(NoopSink),
    };

    let driver = DriverId(1);
    let filter_key = FilterKey {
        assists: AssistClass::None,
        device: InputDevice::Wheel,
    };

    let mut synthetic = SyntheticDriver::new(args.seed, args.corners);
    let mut session = CoachingSession::new(
        &cfg,
        driver,
        filter_key,
        synthetic.corners(),
        &ref_store,
        &bandit_store,
        sink,
        TelemetrySink::from_env(),
    );

    if let Some(path) = &args.replay {
        let frames = apexcoach::replay::read_frame_log(std::path::Path::new(path))
            .with_context(|| format!("reading frame log {path}"))?;
        for frame in frames {
            let lap = frame.lap;
            session.push_frame(frame);
            for rec in session.take_recommendations() {
                if args.verbose > 0 {
                    println!(
                        "  lap {:>3}  {}  {} ({}, {})",
                        lap,
                        rec.corner_id,
                        rec.action.as_str(),
                        rec.intensity.as_str(),
                        rec.theme.as_str()
                    );
                }
            }
        }
    } else {
        let mut recorder = match &args.record {
            Some(path) => Some(
                apexcoach::replay::FrameLogWriter::create(std::path::Path::new(path))
                    .with_context(|| format!("creating frame log {path}"))?,
            ),
            None => None,
        };

        let mut t0: TimestampMs = 0;
        for lap in 1..=args.laps {
            let (frames, t_end) = synthetic.lap_frames(lap, t0);
            t0 = t_end;
            for frame in frames {
                if let Some(w) = recorder.as_mut() {
                    w.write_frame(&frame)?;
                }
                session.push_frame(frame);
                let recs = session.take_recommendations();
                for rec in &recs {
                    if args.verbose > 0 {
                        println!(
                            "  lap {:>3}  {}  {} ({}, {})",
                            lap,
                            rec.corner_id,
                            rec.action.as_str(),
                            rec.intensity.as_str(),
                            rec.theme.as_str()
                        );
                    }
                    synthetic.apply_tip(rec);
                }
            }
        }
        if let Some(w) = recorder {
            w.finish()?;
        }
    }
    session.finish();

    let cycles = session.counters;
    let frames = session.extractor_counters();
    println!("---");
    println!(
        "cycles={} recommendations={} reviews_closed={} degraded={} superseded={}",
        cycles.cycles,
        cycles.recommendations_emitted,
        cycles.reviews_closed,
        cycles.degraded_cycles,
        cycles.superseded_cycles
    );
    println!(
        "frames_seen={} dropped_disorder={} gaps_exceeded={} corners_incomplete={}",
        frames.frames_seen,
        frames.frames_dropped_disorder,
        frames.gaps_exceeded,
        frames.corners_incomplete
    );
    println!(
        "cycle_latency_ms mean={:.3} max={:.3}",
        session.cycle_latency_ms.mean(),
        session.cycle_latency_ms.max()
    );

    Ok(())
}
