// src/store.rs
//
// Repository seams for the two pieces of cross-session learning state:
// reference statistics and bandit beliefs. The decision pipeline only ever
// talks to these traits; the storage engine behind them is someone else's
// problem.
//
// The in-memory implementations shard their lock by driver so concurrent
// sessions (different drivers) never contend. Load hands out a clone of
// the partition's state, save replaces it; the hot path never holds a lock
// across a decision cycle.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::CoachError;
use crate::reference::{CornerHistory, ReferenceModel};
use crate::selector::{BanditArm, BanditState};
use crate::types::{ActionClass, CornerId, DriverId, FilterKey};

const SHARDS: usize = 8;

fn shard_for(driver: DriverId) -> usize {
    (driver.0 as usize) % SHARDS
}

/// Reference statistics keyed by driver (filter key and corner live inside
/// the model).
pub trait ReferenceStatsRepository: Send + Sync {
    fn load(&self, driver: DriverId) -> ReferenceModel;
    fn save(&self, driver: DriverId, model: &ReferenceModel);
}

/// Bandit arm state keyed by driver.
pub trait BanditStateRepository: Send + Sync {
    fn load(&self, driver: DriverId) -> BanditState;
    fn save(&self, driver: DriverId, state: &BanditState);
}

/// Serde-friendly snapshot of one driver's reference model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceSnapshot {
    pub entries: Vec<(FilterKey, CornerId, CornerHistory)>,
}

/// Serde-friendly snapshot of one driver's bandit state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditSnapshot {
    pub arms: Vec<(CornerId, ActionClass, BanditArm)>,
}

/// In-memory reference store with a per-driver-shard lock.
#[derive(Default)]
pub struct InMemoryReferenceStore {
    shards: [Mutex<HashMap<DriverId, ReferenceModel>>; SHARDS],
}

impl InMemoryReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// JSON snapshot of one driver's model, for handing to an external
    /// persistence layer.
    pub fn export_json(&self, driver: DriverId) -> Result<String, CoachError> {
        let model = self.load(driver);
        let snapshot = ReferenceSnapshot {
            entries: model.entries(),
        };
        serde_json::to_string(&snapshot).map_err(CoachError::from)
    }

    pub fn import_json(&self, driver: DriverId, json: &str) -> Result<(), CoachError> {
        let snapshot: ReferenceSnapshot = serde_json::from_str(json)?;
        self.save(driver, &ReferenceModel::from_entries(snapshot.entries));
        Ok(())
    }
}

impl ReferenceStatsRepository for InMemoryReferenceStore {
    fn load(&self, driver: DriverId) -> ReferenceModel {
        let shard = self.shards[shard_for(driver)]
            .lock()
            .expect("reference shard poisoned");
        shard.get(&driver).cloned().unwrap_or_default()
    }

    fn save(&self, driver: DriverId, model: &ReferenceModel) {
        let mut shard = self.shards[shard_for(driver)]
            .lock()
            .expect("reference shard poisoned");
        shard.insert(driver, model.clone());
    }
}

/// In-memory bandit store with a per-driver-shard lock.
#[derive(Default)]
pub struct InMemoryBanditStore {
    shards: [Mutex<HashMap<DriverId, BanditState>>; SHARDS],
}

impl InMemoryBanditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export_json(&self, driver: DriverId) -> Result<String, CoachError> {
        let state = self.load(driver);
        let snapshot = BanditSnapshot {
            arms: state.entries(),
        };
        serde_json::to_string(&snapshot).map_err(CoachError::from)
    }

    pub fn import_json(&self, driver: DriverId, json: &str) -> Result<(), CoachError> {
        let snapshot: BanditSnapshot = serde_json::from_str(json)?;
        self.save(driver, &BanditState::from_entries(snapshot.arms));
        Ok(())
    }
}

impl BanditStateRepository for InMemoryBanditStore {
    fn load(&self, driver: DriverId) -> BanditState {
        let shard = self.shards[shard_for(driver)]
            .lock()
            .expect("bandit shard poisoned");
        shard.get(&driver).cloned().unwrap_or_default()
    }

    fn save(&self, driver: DriverId, state: &BanditState) {
        let mut shard = self.shards[shard_for(driver)]
            .lock()
            .expect("bandit shard poisoned");
        shard.insert(driver, state.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReviewOutcome;

    #[test]
    fn bandit_state_survives_a_json_round_trip() {
        let store = InMemoryBanditStore::new();
        let driver = DriverId(3);

        let mut state = BanditState::new();
        state.apply_outcome(
            CornerId::new(1, 10),
            ActionClass::BrakeEarlier,
            ReviewOutcome::Success,
            50.0,
        );
        store.save(driver, &state);

        let json = store.export_json(driver).unwrap();
        let store2 = InMemoryBanditStore::new();
        store2.import_json(driver, &json).unwrap();

        let loaded = store2.load(driver);
        let arm = loaded
            .arm_ref(CornerId::new(1, 10), ActionClass::BrakeEarlier)
            .expect("arm restored");
        assert!(arm.expected_reward() > 0.5);
        assert_eq!(arm.reward_count, 1);
    }

    #[test]
    fn drivers_do_not_share_state() {
        let store = InMemoryBanditStore::new();
        let mut state = BanditState::new();
        state.apply_outcome(
            CornerId::new(1, 1),
            ActionClass::ReleaseEarlier,
            ReviewOutcome::Success,
            30.0,
        );
        store.save(DriverId(1), &state);

        let other = store.load(DriverId(2));
        assert!(other
            .arm_ref(CornerId::new(1, 1), ActionClass::ReleaseEarlier)
            .is_none());
    }

    #[test]
    fn reference_store_round_trip_preserves_lookup() {
        use crate::config::ReferenceConfig;
        use crate::reference::ReferenceLookup;
        use crate::types::{AssistClass, CornerObservation, InputDevice};

        let cfg = ReferenceConfig::default();
        let key = FilterKey {
            assists: AssistClass::None,
            device: InputDevice::Wheel,
        };
        let mut model = ReferenceModel::new();
        for lap in 1..=8u32 {
            let obs = CornerObservation {
                corner_id: CornerId::new(2, 5),
                lap,
                entry_speed_kmh: 200.0,
                min_speed_kmh: 100.0,
                exit_speed_kmh: 160.0,
                brake_onset_m: 500.0 + lap as f64,
                peak_brake: 0.9,
                brake_release_m: 560.0,
                throttle_onset_m: 600.0,
                throttle_slope: 0.6,
                entry_slip: 0.2,
                exit_slip: 0.2,
                corner_time_ms: 3000.0 + (lap % 3) as f64 * 15.0,
                complete: true,
            };
            model.update(key, &obs, &cfg);
        }

        let store = InMemoryReferenceStore::new();
        store.save(DriverId(9), &model);
        let json = store.export_json(DriverId(9)).unwrap();

        let store2 = InMemoryReferenceStore::new();
        store2.import_json(DriverId(9), &json).unwrap();
        let restored = store2.load(DriverId(9));
        assert!(matches!(
            restored.get(key, CornerId::new(2, 5), &cfg),
            ReferenceLookup::Ready(_)
        ));
    }
}
