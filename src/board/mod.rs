//! The props board: every open fixture's latest props, flattened into rows
//! and pushed through each session's filter → stable sort → window pipeline.
//!
//! `BoardView` is plain synchronous state. The runtime task owns it next to
//! the snapshot cache and calls `refresh_rows` whenever the cache changes.
//! Fixtures and rows are shared; filters and windows belong to sessions.

pub mod filter;
pub mod pager;
pub mod persist;
pub mod runtime;
pub mod session;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::db::models::{Fixture, FixtureId, Prop, Side};
use crate::odds::gap::{classify, flatten, gap, prop_label, GapClass, GapPoint, Row};
use crate::odds::SnapshotCache;
use persist::SessionStores;
use session::{Session, Sessions};

pub use runtime::{BoardHandle, BoardRuntime, RuntimeConfig};

/// Where a fixture's snapshot history stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    /// First history read not finished yet
    Pending,
    Loaded,
    /// The store has no snapshot for it
    NoData,
    Failed(String),
}

impl LoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::Pending => "pending",
            LoadStatus::Loaded => "loaded",
            LoadStatus::NoData => "noData",
            LoadStatus::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BoardState {
    /// Fixture list or first history reads still in flight
    Loading,
    NoFixtures,
    /// Fixtures exist but none has a snapshot
    NoData,
    Ready,
}

/// A row as served to the UI, with gaps and their classes precomputed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowView {
    pub key: String,
    pub fixture_id: FixtureId,
    pub player: String,
    pub prop_type: String,
    pub prop_label: String,
    pub home_team: String,
    pub away_team: String,
    pub start_time: DateTime<Utc>,
    pub prop: Prop,
    pub over_gap_percent: f64,
    pub under_gap_percent: f64,
    pub over_class: GapClass,
    pub under_class: GapClass,
}

impl From<&Row> for RowView {
    fn from(row: &Row) -> Self {
        RowView {
            key: row.key(),
            fixture_id: row.fixture_id,
            player: row.player.clone(),
            prop_type: row.prop_type.clone(),
            prop_label: prop_label(&row.prop_type).to_string(),
            home_team: row.home_team.clone(),
            away_team: row.away_team.clone(),
            start_time: row.start_time,
            prop: row.prop,
            over_gap_percent: row.gap_percent(Side::Over),
            under_gap_percent: row.gap_percent(Side::Under),
            over_class: classify(gap(&row.prop, Side::Over)),
            under_class: classify(gap(&row.prop, Side::Under)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageView {
    pub state: BoardState,
    pub rows: Vec<RowView>,
    pub total: usize,
    pub window_size: usize,
    pub has_more: bool,
}

/// One prop in detail: its current row plus its gap movement over the
/// fixture's history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropDetail {
    pub fixture: Fixture,
    pub row: RowView,
    pub series: Vec<GapPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureView {
    #[serde(flatten)]
    pub fixture: Fixture,
    pub load_status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct BoardView {
    fixtures: Vec<Fixture>,
    fixtures_loaded: bool,
    status: HashMap<FixtureId, LoadStatus>,
    /// every row, unfiltered, in fixture then player/prop-type order
    rows: Arc<[Row]>,
    sessions: Sessions,
}

impl BoardView {
    pub fn new(stores: Box<dyn SessionStores>, page_size: usize) -> Self {
        BoardView {
            fixtures: Vec::new(),
            fixtures_loaded: false,
            status: HashMap::new(),
            rows: Arc::from(Vec::new()),
            sessions: Sessions::new(stores, page_size),
        }
    }

    /// Replace the fixture list. Known fixtures keep their load status, new
    /// ones start `Pending`. Rows are not recomputed here.
    pub fn set_fixtures(&mut self, fixtures: Vec<Fixture>) {
        let mut status = HashMap::with_capacity(fixtures.len());
        for fixture in &fixtures {
            let s = self
                .status
                .remove(&fixture.id)
                .unwrap_or(LoadStatus::Pending);
            status.insert(fixture.id, s);
        }
        self.status = status;
        self.fixtures = fixtures;
        self.fixtures_loaded = true;
    }

    pub fn fixtures(&self) -> &[Fixture] {
        &self.fixtures
    }

    pub fn fixture(&self, fixture_id: FixtureId) -> Option<&Fixture> {
        self.fixtures.iter().find(|f| f.id == fixture_id)
    }

    pub fn fixture_ids(&self) -> HashSet<FixtureId> {
        self.fixtures.iter().map(|f| f.id).collect()
    }

    pub fn has_fixture(&self, fixture_id: FixtureId) -> bool {
        self.status.contains_key(&fixture_id)
    }

    /// Ignored for fixtures no longer on the board.
    pub fn mark(&mut self, fixture_id: FixtureId, status: LoadStatus) {
        if let Some(s) = self.status.get_mut(&fixture_id) {
            *s = status;
        }
    }

    pub fn status(&self, fixture_id: FixtureId) -> Option<&LoadStatus> {
        self.status.get(&fixture_id)
    }

    pub fn fixture_views(&self) -> Vec<FixtureView> {
        self.fixtures
            .iter()
            .map(|fixture| {
                let status = self.status(fixture.id).unwrap_or(&LoadStatus::Pending);
                FixtureView {
                    fixture: fixture.clone(),
                    load_status: status.as_str(),
                    error: match status {
                        LoadStatus::Failed(reason) => Some(reason.clone()),
                        _ => None,
                    },
                }
            })
            .collect()
    }

    /// Rebuild rows from each fixture's latest cached snapshot.
    pub fn refresh_rows(&mut self, cache: &SnapshotCache) {
        let rows: Vec<Row> = self
            .fixtures
            .iter()
            .flat_map(|fixture| flatten(fixture, cache.latest(fixture.id)))
            .collect();
        self.rows = Arc::from(rows);
    }

    /// Filter and window state for one session, opened on first use.
    pub fn session(&mut self, session_id: &str) -> &mut Session {
        self.sessions.get(session_id, &self.rows)
    }

    /// Teams across all unfiltered rows, first-seen order.
    pub fn all_teams(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut teams = Vec::new();
        for row in self.rows.iter() {
            for team in [&row.home_team, &row.away_team] {
                if seen.insert(team.as_str()) {
                    teams.push(team.clone());
                }
            }
        }
        teams
    }

    pub fn all_prop_types(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.rows
            .iter()
            .filter(|row| seen.insert(row.prop_type.as_str()))
            .map(|row| row.prop_type.clone())
            .collect()
    }

    pub fn state(&self) -> BoardState {
        if !self.fixtures_loaded {
            return BoardState::Loading;
        }
        if self.fixtures.is_empty() {
            return BoardState::NoFixtures;
        }
        if !self.rows.is_empty() {
            return BoardState::Ready;
        }
        if self.status.values().any(|s| *s == LoadStatus::Pending) {
            BoardState::Loading
        } else {
            BoardState::NoData
        }
    }

    pub fn page(&mut self, session_id: &str) -> PageView {
        let state = self.state();
        let session = self.session(session_id);
        PageView {
            state,
            rows: session.visible_rows().iter().map(RowView::from).collect(),
            total: session.total(),
            window_size: session.window_size(),
            has_more: session.has_more(),
        }
    }
}
