//! Per-fixture snapshot history held in memory.
//!
//! The first access to a fixture pulls its full history from the store; after
//! that the entry only grows by appends driven from the update feed, so a
//! rescrape never costs a full re-read. A populated entry is authoritative
//! and is never re-fetched behind the caller's back.
//!
//! The cache is a plain owned value. It lives inside the board runtime task
//! and is handed out by `&mut`, so there is no lock around it.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::db::models::{FixtureId, Snapshot};
use crate::error::FeedResult;
use crate::odds::store::SnapshotStore;

#[derive(Debug, Default)]
pub struct SnapshotCache {
    /// fixture_id → snapshots in chronological (= insertion) order
    entries: HashMap<FixtureId, Vec<Snapshot>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        SnapshotCache::default()
    }

    /// Cached history for a fixture, reading the full history from the store
    /// when the entry is missing or empty.
    ///
    /// A failed read leaves the entry untouched so the next call retries.
    pub async fn get(
        &mut self,
        store: &dyn SnapshotStore,
        fixture_id: FixtureId,
    ) -> FeedResult<&[Snapshot]> {
        if !self.is_populated(fixture_id) {
            let history = store.read_history(fixture_id).await?;
            self.fill(fixture_id, history);
        }
        Ok(self.history(fixture_id).unwrap_or(&[]))
    }

    /// Store a completed full-history read. Last write wins.
    pub fn fill(&mut self, fixture_id: FixtureId, history: Vec<Snapshot>) {
        debug!(
            "SnapshotCache: fixture {} filled with {} snapshots",
            fixture_id,
            history.len()
        );
        self.entries.insert(fixture_id, history);
    }

    /// Append one snapshot, creating a one-element entry if needed. Never
    /// touches the store.
    ///
    /// Returns `false` (and leaves the entry unchanged) only when the
    /// snapshot equals the cached tail, i.e. the feed re-announced a scrape
    /// the cache already holds. A different snapshot with the same timestamp
    /// is a distinct scrape and is appended.
    pub fn append(&mut self, fixture_id: FixtureId, snapshot: Snapshot) -> bool {
        let entry = self.entries.entry(fixture_id).or_default();
        if entry.last() == Some(&snapshot) {
            return false;
        }
        entry.push(snapshot);
        true
    }

    /// Drop every entry whose fixture is not in `keep`.
    pub fn evict(&mut self, keep: &HashSet<FixtureId>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|id, _| keep.contains(id));
        before - self.entries.len()
    }

    pub fn is_populated(&self, fixture_id: FixtureId) -> bool {
        self.entries
            .get(&fixture_id)
            .map_or(false, |history| !history.is_empty())
    }

    pub fn history(&self, fixture_id: FixtureId) -> Option<&[Snapshot]> {
        self.entries.get(&fixture_id).map(Vec::as_slice)
    }

    pub fn latest(&self, fixture_id: FixtureId) -> Option<&Snapshot> {
        self.entries.get(&fixture_id).and_then(|history| history.last())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
