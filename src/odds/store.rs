use async_trait::async_trait;

use crate::db::models::{Fixture, FixtureId, Snapshot};
use crate::error::FeedResult;

/// Durable, append-only snapshot storage as seen by the cache.
///
/// Implementations decode payloads before returning, so callers only ever
/// see typed snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The newest snapshot for a fixture, if any.
    async fn read_latest(&self, fixture_id: FixtureId) -> FeedResult<Option<Snapshot>>;

    /// Every snapshot for a fixture, oldest first.
    async fn read_history(&self, fixture_id: FixtureId) -> FeedResult<Vec<Snapshot>>;

    /// Fixtures still open for betting, by start time.
    async fn open_fixtures(&self) -> FeedResult<Vec<Fixture>>;

    async fn fixture(&self, fixture_id: FixtureId) -> FeedResult<Option<Fixture>>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::db::models::{FixtureStatus, OddsPayload, Prop, SidePair};
    use crate::error::FeedError;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::Mutex;

    /// In-memory store with per-fixture read counters.
    #[derive(Default)]
    pub struct CountingStore {
        pub fixtures: Mutex<Vec<Fixture>>,
        pub snapshots: Mutex<HashMap<FixtureId, Vec<Snapshot>>>,
        pub failing: Mutex<HashSet<FixtureId>>,
        delays: Mutex<HashMap<FixtureId, std::time::Duration>>,
        history_reads: Mutex<HashMap<FixtureId, usize>>,
        latest_reads: Mutex<HashMap<FixtureId, usize>>,
    }

    impl CountingStore {
        pub fn with_history(fixture_id: FixtureId, history: Vec<Snapshot>) -> Self {
            let store = CountingStore::default();
            store.snapshots.lock().unwrap().insert(fixture_id, history);
            store
        }

        pub fn push(&self, snapshot: Snapshot) {
            self.snapshots
                .lock()
                .unwrap()
                .entry(snapshot.fixture_id)
                .or_default()
                .push(snapshot);
        }

        pub fn add_fixture(&self, fixture: Fixture) {
            self.fixtures.lock().unwrap().push(fixture);
        }

        pub fn fail(&self, fixture_id: FixtureId) {
            self.failing.lock().unwrap().insert(fixture_id);
        }

        pub fn heal(&self, fixture_id: FixtureId) {
            self.failing.lock().unwrap().remove(&fixture_id);
        }

        /// Make every snapshot read for the fixture take `delay`.
        pub fn slow(&self, fixture_id: FixtureId, delay: std::time::Duration) {
            self.delays.lock().unwrap().insert(fixture_id, delay);
        }

        async fn stall(&self, fixture_id: FixtureId) {
            let delay = self.delays.lock().unwrap().get(&fixture_id).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }

        pub fn history_reads(&self, fixture_id: FixtureId) -> usize {
            *self.history_reads.lock().unwrap().get(&fixture_id).unwrap_or(&0)
        }

        pub fn latest_reads(&self, fixture_id: FixtureId) -> usize {
            *self.latest_reads.lock().unwrap().get(&fixture_id).unwrap_or(&0)
        }

        fn check(&self, fixture_id: FixtureId) -> FeedResult<()> {
            if self.failing.lock().unwrap().contains(&fixture_id) {
                return Err(FeedError::StoreRead(format!("fixture {} unavailable", fixture_id)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SnapshotStore for CountingStore {
        async fn read_latest(&self, fixture_id: FixtureId) -> FeedResult<Option<Snapshot>> {
            *self.latest_reads.lock().unwrap().entry(fixture_id).or_default() += 1;
            self.stall(fixture_id).await;
            self.check(fixture_id)?;
            Ok(self
                .snapshots
                .lock()
                .unwrap()
                .get(&fixture_id)
                .and_then(|h| h.last().cloned()))
        }

        async fn read_history(&self, fixture_id: FixtureId) -> FeedResult<Vec<Snapshot>> {
            *self.history_reads.lock().unwrap().entry(fixture_id).or_default() += 1;
            self.stall(fixture_id).await;
            self.check(fixture_id)?;
            Ok(self
                .snapshots
                .lock()
                .unwrap()
                .get(&fixture_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn open_fixtures(&self) -> FeedResult<Vec<Fixture>> {
            Ok(self
                .fixtures
                .lock()
                .unwrap()
                .iter()
                .filter(|f| f.status == FixtureStatus::Open)
                .cloned()
                .collect())
        }

        async fn fixture(&self, fixture_id: FixtureId) -> FeedResult<Option<Fixture>> {
            Ok(self
                .fixtures
                .lock()
                .unwrap()
                .iter()
                .find(|f| f.id == fixture_id)
                .cloned())
        }
    }

    pub fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 18, 0, 0).unwrap()
    }

    pub fn fixture(id: FixtureId, home: &str, away: &str) -> Fixture {
        Fixture {
            id,
            home_team: home.to_string(),
            away_team: away.to_string(),
            start_time: base_time() + Duration::hours(5),
            status: FixtureStatus::Open,
        }
    }

    /// A prop where book A quotes 50/50 and book B's no-vig is shifted by
    /// the given over/under gaps.
    pub fn prop(over_gap: f64, under_gap: f64) -> Prop {
        Prop {
            line: 20.5,
            book_a_odds: SidePair { over: -110.0, under: -110.0 },
            book_b_odds: SidePair { over: -115.0, under: -105.0 },
            book_a_no_vig: SidePair { over: 0.5, under: 0.5 },
            book_b_no_vig: SidePair {
                over: 0.5 + over_gap,
                under: 0.5 + under_gap,
            },
        }
    }

    pub fn snapshot(
        fixture_id: FixtureId,
        minute: i64,
        props: &[(&str, &str, Prop)],
    ) -> Snapshot {
        let mut by_player: BTreeMap<String, BTreeMap<String, Prop>> = BTreeMap::new();
        for (player, prop_type, prop) in props {
            by_player
                .entry(player.to_string())
                .or_default()
                .insert(prop_type.to_string(), *prop);
        }
        Snapshot {
            fixture_id,
            taken_at: base_time() + Duration::minutes(minute),
            payload: OddsPayload {
                home_team: String::new(),
                away_team: String::new(),
                props: by_player,
            },
        }
    }
}
