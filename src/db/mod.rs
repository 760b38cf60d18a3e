use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

pub mod models;
use models::*;

use crate::error::{FeedError, FeedResult};
use crate::odds::store::SnapshotStore;

/// Thread-safe SQLite connection pool (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// A stored snapshot row before its payload is decoded
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub fixture_id: FixtureId,
    pub odds_data: String,
    pub snapshot_time: DateTime<Utc>,
}

impl SnapshotRow {
    fn decode(self) -> FeedResult<Snapshot> {
        Snapshot::decode(self.fixture_id, self.snapshot_time, &self.odds_data)
    }
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("database mutex poisoned"))
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Fixtures ─────────────────────────────────────────────────────────────

    /// Insert or update a fixture. The scraper owns writes in production.
    #[cfg(test)]
    pub fn upsert_fixture(&self, fixture: &Fixture) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO fixtures (fixture_id, home_team, away_team, start_date, status)
             VALUES (?1,?2,?3,?4,?5)
             ON CONFLICT(fixture_id) DO UPDATE SET
                home_team=excluded.home_team,
                away_team=excluded.away_team,
                start_date=excluded.start_date,
                status=excluded.status",
            params![
                fixture.id,
                fixture.home_team,
                fixture.away_team,
                fixture.start_time,
                fixture.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Fixtures with the given status, ordered by start time
    pub fn list_fixtures(&self, status: FixtureStatus) -> Result<Vec<Fixture>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT fixture_id, home_team, away_team, start_date, status
             FROM fixtures WHERE status = ?1 ORDER BY start_date ASC",
        )?;
        let rows = stmt
            .query_map(params![status.as_str()], map_fixture)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().flatten().collect())
    }

    /// Fetch one fixture by id
    pub fn get_fixture(&self, fixture_id: FixtureId) -> Result<Option<Fixture>> {
        let conn = self.conn()?;
        let fixture = conn
            .query_row(
                "SELECT fixture_id, home_team, away_team, start_date, status
                 FROM fixtures WHERE fixture_id = ?1",
                params![fixture_id],
                map_fixture,
            )
            .optional()?;
        Ok(fixture.flatten())
    }

    // ── Odds snapshots ───────────────────────────────────────────────────────

    /// Append a raw odds snapshot. The scraper owns writes in production.
    #[cfg(test)]
    pub fn insert_snapshot(
        &self,
        fixture_id: FixtureId,
        snapshot_time: DateTime<Utc>,
        odds_data: &str,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO odds_snapshots (fixture_id, odds_data, snapshot_time)
             VALUES (?1,?2,?3)",
            params![fixture_id, odds_data, snapshot_time],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent snapshot row for a fixture
    pub fn latest_snapshot_row(&self, fixture_id: FixtureId) -> Result<Option<SnapshotRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT fixture_id, odds_data, snapshot_time
                 FROM odds_snapshots
                 WHERE fixture_id = ?1
                 ORDER BY snapshot_time DESC, id DESC
                 LIMIT 1",
                params![fixture_id],
                map_snapshot_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Every snapshot row for a fixture, oldest first
    pub fn snapshot_history_rows(&self, fixture_id: FixtureId) -> Result<Vec<SnapshotRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT fixture_id, odds_data, snapshot_time
             FROM odds_snapshots
             WHERE fixture_id = ?1
             ORDER BY snapshot_time ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![fixture_id], map_snapshot_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Run a blocking query on the tokio blocking pool.
    async fn blocking<T, F>(&self, f: F) -> FeedResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(FeedError::store)?
            .map_err(|e| FeedError::StoreRead(format!("{:#}", e)))
    }
}

#[async_trait]
impl SnapshotStore for Database {
    async fn read_latest(&self, fixture_id: FixtureId) -> FeedResult<Option<Snapshot>> {
        let row = self.blocking(move |db| db.latest_snapshot_row(fixture_id)).await?;
        row.map(SnapshotRow::decode).transpose()
    }

    async fn read_history(&self, fixture_id: FixtureId) -> FeedResult<Vec<Snapshot>> {
        let rows = self
            .blocking(move |db| db.snapshot_history_rows(fixture_id))
            .await?;
        let mut history = Vec::with_capacity(rows.len());
        for row in rows {
            match row.decode() {
                Ok(snapshot) => history.push(snapshot),
                Err(e) => warn!("Skipping snapshot in fixture {} history: {}", fixture_id, e),
            }
        }
        Ok(history)
    }

    async fn open_fixtures(&self) -> FeedResult<Vec<Fixture>> {
        self.blocking(|db| db.list_fixtures(FixtureStatus::Open))
            .await
    }

    async fn fixture(&self, fixture_id: FixtureId) -> FeedResult<Option<Fixture>> {
        self.blocking(move |db| db.get_fixture(fixture_id)).await
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

/// Rows with an unknown status are skipped (mapped to `None`) rather than
/// failing the whole listing.
fn map_fixture(row: &rusqlite::Row) -> rusqlite::Result<Option<Fixture>> {
    let id: FixtureId = row.get(0)?;
    let status: String = row.get(4)?;
    let Some(status) = FixtureStatus::parse(&status) else {
        warn!("Fixture {} has unknown status {:?}", id, status);
        return Ok(None);
    };
    Ok(Some(Fixture {
        id,
        home_team: row.get(1)?,
        away_team: row.get(2)?,
        start_time: row.get(3)?,
        status,
    }))
}

fn map_snapshot_row(row: &rusqlite::Row) -> rusqlite::Result<SnapshotRow> {
    Ok(SnapshotRow {
        fixture_id: row.get(0)?,
        odds_data: row.get(1)?,
        snapshot_time: row.get(2)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS fixtures (
    fixture_id  INTEGER PRIMARY KEY,
    home_team   TEXT    NOT NULL,
    away_team   TEXT    NOT NULL,
    start_date  TEXT    NOT NULL,
    status      TEXT    NOT NULL DEFAULT 'open'
);

CREATE TABLE IF NOT EXISTS odds_snapshots (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    fixture_id    INTEGER NOT NULL,
    odds_data     TEXT    NOT NULL,
    snapshot_time TEXT    NOT NULL,
    FOREIGN KEY (fixture_id) REFERENCES fixtures(fixture_id)
);

CREATE INDEX IF NOT EXISTS idx_fixtures_status ON fixtures(status);
CREATE INDEX IF NOT EXISTS idx_snapshots_fixture_time ON odds_snapshots(fixture_id, snapshot_time);
"#;
