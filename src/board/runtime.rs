//! The board runtime task.
//!
//! One task owns the snapshot cache and the board view, so neither needs a
//! lock. Everything reaches it as a message:
//!
//! ```text
//!  BoardHandle ──Command──▶ ┐
//!  UpdateSubscription ────▶ ├─▶ BoardRuntime (cache + view)
//!  fetch tasks ──Event────▶ ┘        │
//!       ▲                            │ spawns store reads
//!       └────────────────────────────┘
//! ```
//!
//! Every store read runs in a spawned task and comes back as an event tagged
//! with the generation it was started in. A generation bump (fixture set
//! change, shutdown) makes every older result stale. A point query for a
//! board fixture the cache does not hold yet parks its reply until that
//! fixture's history read lands; queries for fixtures off the board are
//! answered by their own task straight from the store.

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::filter::FilterConfig;
use super::persist::SessionStores;
use super::{BoardView, FixtureView, LoadStatus, PageView, PropDetail, RowView};
use crate::db::models::{Fixture, FixtureId, Snapshot};
use crate::error::{BoardError, FeedError, FeedResult};
use crate::feed::{UpdateBatch, UpdateSource, UpdateSubscription};
use crate::odds::gap::{gap_series, Row};
use crate::odds::{SnapshotCache, SnapshotStore};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub page_size: usize,
    /// How often the open-fixture list is reloaded
    pub fixture_refresh: Duration,
    /// Re-read every board fixture on this period as well as on updates
    pub poll_interval: Option<Duration>,
    pub store_timeout: Duration,
}

enum Command {
    Page {
        session: String,
        reply: oneshot::Sender<PageView>,
    },
    LoadMore {
        session: String,
        reply: oneshot::Sender<PageView>,
    },
    Filter {
        session: String,
        reply: oneshot::Sender<FilterConfig>,
    },
    UpdateFilter {
        session: String,
        config: FilterConfig,
        reply: oneshot::Sender<PageView>,
    },
    ResetFilter {
        session: String,
        reply: oneshot::Sender<PageView>,
    },
    Teams {
        reply: oneshot::Sender<Vec<String>>,
    },
    PropTypes {
        reply: oneshot::Sender<Vec<String>>,
    },
    Fixtures {
        reply: oneshot::Sender<Vec<FixtureView>>,
    },
    Query {
        fixture_id: FixtureId,
        query: PointQuery,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A read of one fixture's history on behalf of an API caller.
enum PointQuery {
    Latest(oneshot::Sender<FeedResult<Option<Snapshot>>>),
    History(oneshot::Sender<FeedResult<Vec<Snapshot>>>),
    Detail {
        player: String,
        prop_type: String,
        reply: oneshot::Sender<FeedResult<Option<PropDetail>>>,
    },
}

impl PointQuery {
    fn answer(self, fixture: Option<&Fixture>, history: Result<&[Snapshot], &FeedError>) {
        match self {
            PointQuery::Latest(reply) => {
                let _ = reply.send(history.map(|h| h.last().cloned()).map_err(FeedError::clone));
            }
            PointQuery::History(reply) => {
                let _ = reply.send(history.map(<[Snapshot]>::to_vec).map_err(FeedError::clone));
            }
            PointQuery::Detail {
                player,
                prop_type,
                reply,
            } => {
                let detail = history
                    .map(|h| fixture.and_then(|f| prop_detail(f, h, &player, &prop_type)))
                    .map_err(FeedError::clone);
                let _ = reply.send(detail);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FetchKind {
    History,
    Latest,
}

#[derive(Debug)]
enum Fetched {
    History(Vec<Snapshot>),
    Latest(Option<Snapshot>),
}

#[derive(Debug)]
enum Event {
    Fetched {
        generation: u64,
        fixture_id: FixtureId,
        result: FeedResult<Fetched>,
    },
    FixturesLoaded(FeedResult<Vec<Fixture>>),
}

/// Cloneable front door to a running board. Every call fails with
/// `BoardError::Stopped` once the runtime has shut down.
#[derive(Clone)]
pub struct BoardHandle {
    commands: mpsc::Sender<Command>,
}

impl BoardHandle {
    async fn ask<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, BoardError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| BoardError::Stopped)?;
        response.await.map_err(|_| BoardError::Stopped)
    }

    pub async fn page(&self, session: &str) -> Result<PageView, BoardError> {
        let session = session.to_string();
        self.ask(|reply| Command::Page { session, reply }).await
    }

    pub async fn load_more(&self, session: &str) -> Result<PageView, BoardError> {
        let session = session.to_string();
        self.ask(|reply| Command::LoadMore { session, reply }).await
    }

    pub async fn filter(&self, session: &str) -> Result<FilterConfig, BoardError> {
        let session = session.to_string();
        self.ask(|reply| Command::Filter { session, reply }).await
    }

    pub async fn update_filter(
        &self,
        session: &str,
        config: FilterConfig,
    ) -> Result<PageView, BoardError> {
        let session = session.to_string();
        self.ask(|reply| Command::UpdateFilter {
            session,
            config,
            reply,
        })
        .await
    }

    pub async fn reset_filter(&self, session: &str) -> Result<PageView, BoardError> {
        let session = session.to_string();
        self.ask(|reply| Command::ResetFilter { session, reply }).await
    }

    pub async fn teams(&self) -> Result<Vec<String>, BoardError> {
        self.ask(|reply| Command::Teams { reply }).await
    }

    pub async fn prop_types(&self) -> Result<Vec<String>, BoardError> {
        self.ask(|reply| Command::PropTypes { reply }).await
    }

    pub async fn fixtures(&self) -> Result<Vec<FixtureView>, BoardError> {
        self.ask(|reply| Command::Fixtures { reply }).await
    }

    pub async fn latest(&self, fixture_id: FixtureId) -> Result<Option<Snapshot>, BoardError> {
        Ok(self
            .ask(|reply| Command::Query {
                fixture_id,
                query: PointQuery::Latest(reply),
            })
            .await??)
    }

    pub async fn history(&self, fixture_id: FixtureId) -> Result<Vec<Snapshot>, BoardError> {
        Ok(self
            .ask(|reply| Command::Query {
                fixture_id,
                query: PointQuery::History(reply),
            })
            .await??)
    }

    /// Works for any stored fixture, including ones no longer on the board.
    pub async fn prop_detail(
        &self,
        fixture_id: FixtureId,
        player: String,
        prop_type: String,
    ) -> Result<Option<PropDetail>, BoardError> {
        Ok(self
            .ask(|reply| Command::Query {
                fixture_id,
                query: PointQuery::Detail {
                    player,
                    prop_type,
                    reply,
                },
            })
            .await??)
    }

    /// Stop the runtime and wait for its teardown. A no-op when already
    /// stopped.
    pub async fn shutdown(&self) {
        if self.ask(|reply| Command::Shutdown { reply }).await.is_err() {
            debug!("Board runtime already stopped");
        }
    }
}

pub struct BoardRuntime {
    store: Arc<dyn SnapshotStore>,
    source: Arc<dyn UpdateSource>,
    config: RuntimeConfig,
    cache: SnapshotCache,
    view: BoardView,
    generation: u64,
    /// fixture → another read was requested while this one ran
    in_flight: HashMap<FixtureId, bool>,
    /// point queries parked until the fixture's first history read lands
    waiting: HashMap<FixtureId, Vec<PointQuery>>,
    fixtures_loading: bool,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    commands: mpsc::Receiver<Command>,
}

impl BoardRuntime {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        source: Arc<dyn UpdateSource>,
        sessions: Box<dyn SessionStores>,
        config: RuntimeConfig,
    ) -> (Self, BoardHandle) {
        let (commands_tx, commands) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let view = BoardView::new(sessions, config.page_size);
        let runtime = BoardRuntime {
            store,
            source,
            config,
            cache: SnapshotCache::new(),
            view,
            generation: 0,
            in_flight: HashMap::new(),
            waiting: HashMap::new(),
            fixtures_loading: false,
            events_tx,
            events_rx,
            commands,
        };
        (runtime, BoardHandle { commands: commands_tx })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until `BoardHandle::shutdown` or until every handle is dropped.
    pub async fn run(mut self) {
        let mut subscription = Some(UpdateSubscription::open(Arc::clone(&self.source)));
        let mut backoff = INITIAL_BACKOFF;
        let mut reopen_at = Instant::now();

        let mut fixture_refresh = tokio::time::interval(self.config.fixture_refresh);
        fixture_refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = self.config.poll_interval.map(|period| {
            let mut poll = tokio::time::interval_at(Instant::now() + period, period);
            poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
            poll
        });

        info!(
            "Board runtime started (feed: {}, fixture refresh every {:?})",
            self.source.name(),
            self.config.fixture_refresh
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let shutdown = match command {
                        Some(command) => self.on_command(command).map(Some),
                        // every handle dropped
                        None => Some(None),
                    };
                    if let Some(reply) = shutdown {
                        self.teardown(&mut subscription).await;
                        if let Some(reply) = reply {
                            let _ = reply.send(());
                        }
                        break;
                    }
                }
                Some(event) = self.events_rx.recv() => self.on_event(event),
                batch = next_batch(&mut subscription) => match batch {
                    Some(batch) => {
                        backoff = INITIAL_BACKOFF;
                        self.on_batch(&batch);
                    }
                    None => {
                        let (reason, seen) = match subscription.take() {
                            Some(mut closed) => {
                                let seen = closed.latest().map_or(0, |b| b.seq);
                                (closed.close().await, seen)
                            }
                            None => (None, 0),
                        };
                        let delay = jittered(backoff);
                        match reason {
                            Some(e) => warn!(
                                "Update feed closed after {} batches: {}. Reopening in {:?}",
                                seen, e, delay
                            ),
                            None => warn!(
                                "Update feed closed after {} batches. Reopening in {:?}",
                                seen, delay
                            ),
                        }
                        reopen_at = Instant::now() + delay;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                },
                _ = tokio::time::sleep_until(reopen_at), if subscription.is_none() => {
                    info!("Reopening update feed ({})", self.source.name());
                    subscription = Some(UpdateSubscription::open(Arc::clone(&self.source)));
                }
                _ = fixture_refresh.tick() => self.reload_fixtures(),
                _ = tick(&mut poll) => self.poll(),
            }
        }
        info!("Board runtime stopped");
    }

    async fn teardown(&mut self, subscription: &mut Option<UpdateSubscription>) {
        self.generation += 1;
        self.in_flight.clear();
        // parked replies are dropped, so their callers see `Stopped`
        self.waiting.clear();
        if let Some(mut open) = subscription.take() {
            if let Some(e) = open.close().await {
                debug!("Update feed had already failed: {}", e);
            }
        }
    }

    /// Returns the reply channel when the command asks for shutdown.
    fn on_command(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Page { session, reply } => {
                let _ = reply.send(self.view.page(&session));
            }
            Command::LoadMore { session, reply } => {
                self.view.session(&session).load_more();
                let _ = reply.send(self.view.page(&session));
            }
            Command::Filter { session, reply } => {
                let _ = reply.send(self.view.session(&session).filter().clone());
            }
            Command::UpdateFilter {
                session,
                config,
                reply,
            } => {
                self.view.session(&session).update_filter(config);
                let _ = reply.send(self.view.page(&session));
            }
            Command::ResetFilter { session, reply } => {
                self.view.session(&session).reset_filter();
                let _ = reply.send(self.view.page(&session));
            }
            Command::Teams { reply } => {
                let _ = reply.send(self.view.all_teams());
            }
            Command::PropTypes { reply } => {
                let _ = reply.send(self.view.all_prop_types());
            }
            Command::Fixtures { reply } => {
                let _ = reply.send(self.view.fixture_views());
            }
            Command::Query { fixture_id, query } => self.query(fixture_id, query),
            Command::Shutdown { reply } => return Some(reply),
        }
        None
    }

    /// Answer from the cache when it holds the fixture, otherwise park the
    /// query behind the fixture's history read. Fixtures not on the board
    /// are read straight from the store and not cached.
    fn query(&mut self, fixture_id: FixtureId, query: PointQuery) {
        if !self.view.has_fixture(fixture_id) {
            self.query_store(fixture_id, query);
            return;
        }
        if let Some(history) = self.cache.history(fixture_id).filter(|h| !h.is_empty()) {
            query.answer(self.view.fixture(fixture_id), Ok(history));
            return;
        }
        self.waiting.entry(fixture_id).or_default().push(query);
        self.ensure_read(fixture_id);
    }

    fn query_store(&self, fixture_id: FixtureId, query: PointQuery) {
        let store = Arc::clone(&self.store);
        let limit = self.config.store_timeout;
        tokio::spawn(async move {
            let fixture = if matches!(query, PointQuery::Detail { .. }) {
                match with_timeout(limit, store.fixture(fixture_id)).await {
                    Ok(Some(fixture)) => Some(fixture),
                    Ok(None) => return query.answer(None, Ok(&[])),
                    Err(e) => return query.answer(None, Err(&e)),
                }
            } else {
                None
            };
            let history = with_timeout(limit, store.read_history(fixture_id)).await;
            query.answer(fixture.as_ref(), history.as_deref());
        });
    }

    /// Reply to every query parked on `fixture_id`. `failure` only counts
    /// while the cache still has nothing for the fixture.
    fn answer_waiting(&mut self, fixture_id: FixtureId, failure: Option<&FeedError>) {
        let Some(queries) = self.waiting.remove(&fixture_id) else {
            return;
        };
        let cached = self.cache.history(fixture_id).unwrap_or(&[]);
        let history = match failure {
            Some(e) if cached.is_empty() => Err(e),
            _ => Ok(cached),
        };
        let fixture = self.view.fixture(fixture_id);
        for query in queries {
            query.answer(fixture, history);
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Fetched {
                generation,
                fixture_id,
                result,
            } => self.on_fetched(generation, fixture_id, result),
            Event::FixturesLoaded(result) => self.on_fixtures(result),
        }
    }

    fn on_batch(&mut self, batch: &UpdateBatch) {
        debug!("Update batch {}: {:?}", batch.seq, batch.fixture_ids);
        for &fixture_id in &batch.fixture_ids {
            if self.view.has_fixture(fixture_id) {
                self.request(fixture_id);
            } else {
                debug!("Ignoring update for fixture {} not on the board", fixture_id);
            }
        }
    }

    fn poll(&mut self) {
        let ids: Vec<FixtureId> = self.view.fixtures().iter().map(|f| f.id).collect();
        debug!("Polling {} fixtures", ids.len());
        for fixture_id in ids {
            self.request(fixture_id);
        }
    }

    /// Start a read unless one is already running for the fixture.
    fn ensure_read(&mut self, fixture_id: FixtureId) {
        if !self.in_flight.contains_key(&fixture_id) {
            self.request(fixture_id);
        }
    }

    /// Start a read for one fixture: its full history when the cache has
    /// nothing for it, otherwise just the newest snapshot. While a read is
    /// running, further requests collapse into one follow-up read.
    fn request(&mut self, fixture_id: FixtureId) {
        if let Some(again) = self.in_flight.get_mut(&fixture_id) {
            *again = true;
            return;
        }
        self.in_flight.insert(fixture_id, false);

        let kind = if self.cache.is_populated(fixture_id) {
            FetchKind::Latest
        } else {
            FetchKind::History
        };
        let store = Arc::clone(&self.store);
        let events = self.events_tx.clone();
        let generation = self.generation;
        let limit = self.config.store_timeout;

        tokio::spawn(async move {
            let result = match kind {
                FetchKind::History => with_timeout(limit, store.read_history(fixture_id))
                    .await
                    .map(Fetched::History),
                FetchKind::Latest => with_timeout(limit, store.read_latest(fixture_id))
                    .await
                    .map(Fetched::Latest),
            };
            let _ = events.send(Event::Fetched {
                generation,
                fixture_id,
                result,
            });
        });
    }

    fn on_fetched(&mut self, generation: u64, fixture_id: FixtureId, result: FeedResult<Fetched>) {
        if generation != self.generation {
            debug!(
                "Discarding stale read for fixture {} (generation {} < {})",
                fixture_id, generation, self.generation
            );
            return;
        }
        let again = self.in_flight.remove(&fixture_id).unwrap_or(false);
        if !self.view.has_fixture(fixture_id) {
            return;
        }

        let failure = match result {
            Ok(Fetched::History(history)) => {
                self.view.mark(fixture_id, loaded_status(&history));
                self.cache.fill(fixture_id, history);
                None
            }
            Ok(Fetched::Latest(Some(snapshot))) => {
                if self.cache.append(fixture_id, snapshot) {
                    self.view.mark(fixture_id, LoadStatus::Loaded);
                }
                None
            }
            Ok(Fetched::Latest(None)) => None,
            Err(e) => {
                warn!("Read for fixture {} failed: {}", fixture_id, e);
                if !self.cache.is_populated(fixture_id) {
                    self.view.mark(fixture_id, LoadStatus::Failed(e.to_string()));
                }
                Some(e)
            }
        };
        self.view.refresh_rows(&self.cache);
        self.answer_waiting(fixture_id, failure.as_ref());

        if again {
            self.request(fixture_id);
        }
    }

    fn reload_fixtures(&mut self) {
        if self.fixtures_loading {
            return;
        }
        self.fixtures_loading = true;
        let store = Arc::clone(&self.store);
        let events = self.events_tx.clone();
        let limit = self.config.store_timeout;
        tokio::spawn(async move {
            let result = with_timeout(limit, store.open_fixtures()).await;
            let _ = events.send(Event::FixturesLoaded(result));
        });
    }

    fn on_fixtures(&mut self, result: FeedResult<Vec<Fixture>>) {
        self.fixtures_loading = false;
        let fixtures = match result {
            Ok(fixtures) => fixtures,
            Err(e) => {
                warn!("Failed to load fixtures: {}", e);
                return;
            }
        };

        let keep: HashSet<FixtureId> = fixtures.iter().map(|f| f.id).collect();
        let changed = keep != self.view.fixture_ids();
        let evicted = self.cache.evict(&keep);
        self.view.set_fixtures(fixtures);

        let dropped: Vec<FixtureId> = self
            .waiting
            .keys()
            .filter(|fixture_id| !keep.contains(*fixture_id))
            .copied()
            .collect();
        for fixture_id in dropped {
            for query in self.waiting.remove(&fixture_id).unwrap_or_default() {
                self.query_store(fixture_id, query);
            }
        }

        if changed {
            self.generation += 1;
            let restart: Vec<FixtureId> = self
                .in_flight
                .drain()
                .map(|(fixture_id, _)| fixture_id)
                .filter(|fixture_id| keep.contains(fixture_id))
                .collect();
            for fixture_id in restart {
                self.request(fixture_id);
            }
            info!(
                "Board now has {} fixtures ({} cached, {} dropped from cache)",
                keep.len(),
                self.cache.len(),
                evicted
            );
        }

        let missing: Vec<FixtureId> = self
            .view
            .fixtures()
            .iter()
            .map(|f| f.id)
            .filter(|fixture_id| !self.cache.is_populated(*fixture_id))
            .collect();
        for fixture_id in missing {
            // restarted reads above already cover their fixture
            self.ensure_read(fixture_id);
        }
        self.view.refresh_rows(&self.cache);
    }
}

fn prop_detail(
    fixture: &Fixture,
    history: &[Snapshot],
    player: &str,
    prop_type: &str,
) -> Option<PropDetail> {
    let prop = *history.last()?.payload.prop(player, prop_type)?;
    let row = Row {
        fixture_id: fixture.id,
        player: player.to_string(),
        prop_type: prop_type.to_string(),
        prop,
        home_team: fixture.home_team.clone(),
        away_team: fixture.away_team.clone(),
        start_time: fixture.start_time,
    };
    Some(PropDetail {
        fixture: fixture.clone(),
        row: RowView::from(&row),
        series: gap_series(history, player, prop_type),
    })
}

fn loaded_status(history: &[Snapshot]) -> LoadStatus {
    if history.is_empty() {
        LoadStatus::NoData
    } else {
        LoadStatus::Loaded
    }
}

async fn with_timeout<T>(
    limit: Duration,
    read: impl Future<Output = FeedResult<T>>,
) -> FeedResult<T> {
    match tokio::time::timeout(limit, read).await {
        Ok(result) => result,
        Err(_) => Err(FeedError::StoreRead(format!("timed out after {:?}", limit))),
    }
}

async fn next_batch(subscription: &mut Option<UpdateSubscription>) -> Option<UpdateBatch> {
    match subscription {
        Some(open) => open.next_batch().await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// `base` plus up to half of it again.
fn jittered(base: Duration) -> Duration {
    let spread = base.as_millis() as u64 / 2;
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::filter::Direction;
    use crate::board::persist::MemorySessions;
    use crate::board::BoardState;
    use crate::db::models::FixtureStatus;
    use crate::feed::subscriber::mock::ScriptedSource;
    use crate::odds::store::mock::{fixture, prop, snapshot, CountingStore};

    const S: &str = "default";

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            page_size: 12,
            fixture_refresh: Duration::from_secs(300),
            poll_interval: None,
            store_timeout: Duration::from_secs(5),
        }
    }

    fn runtime_with(store: &Arc<CountingStore>, source: ScriptedSource) -> (BoardRuntime, BoardHandle) {
        BoardRuntime::new(
            Arc::clone(store) as Arc<dyn SnapshotStore>,
            Arc::new(source),
            Box::new(MemorySessions::default()),
            config(),
        )
    }

    fn runtime(store: &Arc<CountingStore>) -> BoardRuntime {
        runtime_with(store, ScriptedSource::new(vec![], true)).0
    }

    /// Feed the next `n` completed reads back into the runtime.
    async fn drain(rt: &mut BoardRuntime, n: usize) {
        for _ in 0..n {
            let event = rt.events_rx.recv().await.unwrap();
            rt.on_event(event);
        }
    }

    /// Fixtures 101 (two snapshots) and 202 (one snapshot).
    fn seeded() -> Arc<CountingStore> {
        let store = Arc::new(CountingStore::default());
        store.add_fixture(fixture(101, "Lakers", "Celtics"));
        store.add_fixture(fixture(202, "Knicks", "Heat"));
        store.push(snapshot(101, 0, &[("LeBron James", "points", prop(0.01, 0.0))]));
        store.push(snapshot(101, 5, &[("LeBron James", "points", prop(0.02, 0.0))]));
        store.push(snapshot(202, 0, &[("Jalen Brunson", "assists", prop(0.0, 0.03))]));
        store
    }

    async fn loaded(store: &Arc<CountingStore>) -> BoardRuntime {
        let mut rt = runtime(store);
        rt.reload_fixtures();
        drain(&mut rt, 1).await;
        drain(&mut rt, 2).await;
        rt
    }

    /// Spawn a runtime and wait until its board is ready.
    async fn spawned(store: &Arc<CountingStore>) -> (JoinHandle<()>, BoardHandle) {
        let (rt, board) = runtime_with(store, ScriptedSource::new(vec![], true));
        let task = rt.spawn();
        for _ in 0..100 {
            if board.page(S).await.unwrap().state == BoardState::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (task, board)
    }

    #[tokio::test]
    async fn test_first_load_reads_each_history_once() {
        let store = seeded();
        let mut rt = loaded(&store).await;

        assert_eq!(store.history_reads(101), 1);
        assert_eq!(store.history_reads(202), 1);
        assert_eq!(rt.cache.history(101).unwrap().len(), 2);
        assert_eq!(rt.view.status(101), Some(&LoadStatus::Loaded));
        assert_eq!(rt.view.state(), BoardState::Ready);
        assert_eq!(rt.view.session(S).total(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_appends_latest_without_history_read() {
        let store = seeded();
        let mut rt = loaded(&store).await;

        let fresh = snapshot(101, 10, &[("LeBron James", "points", prop(0.032, 0.0))]);
        store.push(fresh.clone());
        rt.on_batch(&UpdateBatch {
            seq: 1,
            fixture_ids: vec![101],
        });
        drain(&mut rt, 1).await;

        let history = rt.cache.history(101).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history.last(), Some(&fresh));
        assert_eq!(store.history_reads(101), 1);
        assert_eq!(store.latest_reads(101), 1);

        let row = &rt.view.session(S).visible_rows()[0];
        approx::assert_relative_eq!(row.gap_percent(crate::db::models::Side::Over), 3.2, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_broadcast_and_cold_point_query_interleave() {
        let store = seeded();
        let mut rt = runtime(&store);
        rt.view.set_fixtures(vec![
            fixture(101, "Lakers", "Celtics"),
            fixture(202, "Knicks", "Heat"),
        ]);
        let warm = store.snapshots.lock().unwrap()[&101].clone();
        rt.cache.fill(101, warm);

        let fresh = snapshot(101, 10, &[("LeBron James", "points", prop(0.032, 0.0))]);
        store.push(fresh.clone());

        let (history_tx, history_rx) = oneshot::channel();
        let (latest_tx, latest_rx) = oneshot::channel();
        rt.on_batch(&UpdateBatch {
            seq: 1,
            fixture_ids: vec![101],
        });
        assert!(rt
            .on_command(Command::Query {
                fixture_id: 202,
                query: PointQuery::History(history_tx),
            })
            .is_none());
        assert!(rt
            .on_command(Command::Query {
                fixture_id: 202,
                query: PointQuery::Latest(latest_tx),
            })
            .is_none());
        // the 101 latest read and a single 202 history read
        drain(&mut rt, 2).await;

        assert_eq!(history_rx.await.unwrap().unwrap().len(), 1);
        assert!(latest_rx.await.unwrap().unwrap().is_some());
        assert_eq!(store.history_reads(202), 1);
        assert_eq!(store.latest_reads(202), 0);

        let history = rt.cache.history(101).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history.last(), Some(&fresh));
        assert_eq!(store.history_reads(101), 0);
        assert_eq!(store.latest_reads(101), 1);
        assert!(rt.in_flight.is_empty());
        assert!(rt.waiting.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_requests_for_cold_fixture_read_history_once() {
        let store = seeded();
        let mut rt = runtime(&store);
        rt.view.set_fixtures(vec![fixture(202, "Knicks", "Heat")]);

        rt.on_batch(&UpdateBatch {
            seq: 1,
            fixture_ids: vec![202],
        });
        rt.on_batch(&UpdateBatch {
            seq: 2,
            fixture_ids: vec![202],
        });
        // the history read, then one follow-up latest read
        drain(&mut rt, 2).await;

        assert_eq!(store.history_reads(202), 1);
        assert_eq!(store.latest_reads(202), 1);
        assert_eq!(rt.cache.history(202).unwrap().len(), 1);
        assert!(rt.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_updates_for_unknown_fixtures_are_ignored() {
        let store = seeded();
        let mut rt = loaded(&store).await;
        rt.on_batch(&UpdateBatch {
            seq: 1,
            fixture_ids: vec![999],
        });
        assert!(rt.in_flight.is_empty());
        assert_eq!(store.latest_reads(999), 0);
    }

    #[tokio::test]
    async fn test_stale_generation_is_discarded() {
        let store = seeded();
        let mut rt = runtime(&store);
        rt.view.set_fixtures(vec![fixture(101, "Lakers", "Celtics")]);
        rt.generation = 3;

        let history = vec![snapshot(101, 0, &[("A", "points", prop(0.0, 0.0))])];
        rt.on_fetched(2, 101, Ok(Fetched::History(history.clone())));
        assert!(!rt.cache.is_populated(101));
        assert_eq!(rt.view.status(101), Some(&LoadStatus::Pending));

        rt.on_fetched(3, 101, Ok(Fetched::History(history)));
        assert!(rt.cache.is_populated(101));
    }

    #[tokio::test]
    async fn test_fixture_change_restarts_reads_and_evicts() {
        let store = seeded();
        let mut rt = loaded(&store).await;
        let before = rt.generation;

        rt.on_fixtures(Ok(vec![fixture(202, "Knicks", "Heat")]));
        assert_eq!(rt.generation, before + 1);
        assert!(rt.cache.history(101).is_none());
        assert!(!rt.view.has_fixture(101));
        assert_eq!(rt.view.session(S).total(), 1);

        // same set again: nothing restarts
        rt.on_fixtures(Ok(vec![fixture(202, "Knicks", "Heat")]));
        assert_eq!(rt.generation, before + 1);
    }

    #[tokio::test]
    async fn test_restarted_reads_get_no_follow_up() {
        let store = seeded();
        let mut rt = runtime(&store);
        rt.reload_fixtures();
        drain(&mut rt, 1).await;
        assert_eq!(rt.in_flight.len(), 2);

        // the fixture list changes while both history reads run
        rt.on_fixtures(Ok(vec![
            fixture(101, "Lakers", "Celtics"),
            fixture(202, "Knicks", "Heat"),
            fixture(303, "Suns", "Jazz"),
        ]));
        assert_eq!(rt.in_flight.len(), 3);
        assert!(rt.in_flight.values().all(|again| !again));

        // two stale results, then the three current ones
        drain(&mut rt, 5).await;
        assert!(rt.in_flight.is_empty());
        assert_eq!(store.history_reads(101), 2);
        assert_eq!(store.latest_reads(101), 0);
        assert_eq!(store.latest_reads(202), 0);
        assert_eq!(rt.view.status(303), Some(&LoadStatus::NoData));
    }

    #[tokio::test]
    async fn test_failed_fixture_is_isolated_and_retried() {
        let store = seeded();
        store.fail(202);
        let mut rt = loaded(&store).await;

        assert!(matches!(rt.view.status(202), Some(LoadStatus::Failed(_))));
        assert_eq!(rt.view.status(101), Some(&LoadStatus::Loaded));
        assert_eq!(rt.view.state(), BoardState::Ready);
        assert_eq!(rt.view.session(S).total(), 1);

        store.heal(202);
        rt.poll();
        drain(&mut rt, 2).await;
        assert_eq!(rt.view.status(202), Some(&LoadStatus::Loaded));
        assert_eq!(rt.view.session(S).total(), 2);
    }

    #[tokio::test]
    async fn test_parked_query_gets_the_read_error() {
        let store = seeded();
        store.fail(202);
        let mut rt = runtime(&store);
        rt.view.set_fixtures(vec![fixture(202, "Knicks", "Heat")]);

        let (reply, response) = oneshot::channel();
        rt.on_command(Command::Query {
            fixture_id: 202,
            query: PointQuery::History(reply),
        });
        drain(&mut rt, 1).await;
        assert!(matches!(response.await.unwrap(), Err(FeedError::StoreRead(_))));
        assert!(rt.waiting.is_empty());
    }

    #[tokio::test]
    async fn test_point_queries_read_through_cache() {
        let store = seeded();
        let (task, board) = spawned(&store).await;

        assert_eq!(board.history(101).await.unwrap().len(), 2);
        assert_eq!(board.history(101).await.unwrap().len(), 2);
        assert_eq!(store.history_reads(101), 1);

        let detail = board
            .prop_detail(101, "LeBron James".into(), "points".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(detail.series.len(), 2);
        assert_eq!(detail.row.home_team, "Lakers");
        approx::assert_relative_eq!(detail.series[1].over_gap, 2.0, epsilon = 1e-9);
        assert!(board
            .prop_detail(101, "Nobody".into(), "points".into())
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.history_reads(101), 1);

        board.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_fixture_is_served_from_the_store() {
        let store = seeded();
        store.add_fixture(Fixture {
            status: FixtureStatus::Closed,
            ..fixture(303, "Suns", "Jazz")
        });
        store.push(snapshot(303, 0, &[("Devin Booker", "points", prop(0.015, 0.0))]));
        let (task, board) = spawned(&store).await;

        assert!(!board.fixtures().await.unwrap().iter().any(|f| f.fixture.id == 303));
        assert_eq!(board.history(303).await.unwrap().len(), 1);

        let detail = board
            .prop_detail(303, "Devin Booker".into(), "points".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(detail.fixture.status, FixtureStatus::Closed);
        assert_eq!(detail.row.home_team, "Suns");
        assert_eq!(detail.series.len(), 1);

        assert!(board
            .prop_detail(404, "Devin Booker".into(), "points".into())
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.history_reads(404), 0);

        board.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_reads_do_not_stall_the_board() {
        let store = seeded();
        store.fail(202);
        let (task, board) = spawned(&store).await;
        for _ in 0..100 {
            let fixtures = board.fixtures().await.unwrap();
            if fixtures.iter().any(|f| f.fixture.id == 202 && f.load_status == "failed") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        store.heal(202);
        store.slow(202, Duration::from_millis(500));
        store.slow(999, Duration::from_millis(500));

        // one read parked on a board fixture, one straight to the store
        let on_board = tokio::spawn({
            let board = board.clone();
            async move { board.history(202).await }
        });
        let off_board = tokio::spawn({
            let board = board.clone();
            async move { board.history(999).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        let page = board.page(S).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(page.total, 1);

        assert_eq!(on_board.await.unwrap().unwrap().len(), 1);
        assert!(off_board.await.unwrap().unwrap().is_empty());
        assert_eq!(board.page(S).await.unwrap().total, 2);

        board.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_end_to_end() {
        let store = seeded();
        let (task, board) = spawned(&store).await;

        let page = board.page(S).await.unwrap();
        assert_eq!(page.state, BoardState::Ready);
        assert_eq!(page.total, 2);
        assert_eq!(board.teams().await.unwrap(), vec!["Lakers", "Celtics", "Knicks", "Heat"]);

        let page = board
            .update_filter(
                S,
                FilterConfig {
                    direction: Direction::Under,
                    min_gap_percent: 1.0,
                    ..FilterConfig::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.rows[0].player, "Jalen Brunson");
        assert_eq!(board.filter(S).await.unwrap().direction, Direction::Under);

        // another session sees the full board
        assert_eq!(board.page("other").await.unwrap().total, 2);
        assert_eq!(board.filter("other").await.unwrap(), FilterConfig::default());

        assert_eq!(board.reset_filter(S).await.unwrap().total, 2);

        let latest = board.latest(101).await.unwrap().unwrap();
        assert_eq!(latest.taken_at, store.snapshots.lock().unwrap()[&101][1].taken_at);

        board.shutdown().await;
        task.await.unwrap();
        assert_eq!(board.page(S).await.unwrap_err(), BoardError::Stopped);
        board.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_feed_is_reopened() {
        let store = seeded();
        let source = Arc::new(ScriptedSource::new(vec![], false));
        let (rt, board) = BoardRuntime::new(
            Arc::clone(&store) as Arc<dyn SnapshotStore>,
            Arc::clone(&source) as Arc<dyn UpdateSource>,
            Box::new(MemorySessions::default()),
            config(),
        );
        let task = rt.spawn();

        // first reconnect waits between 1 and 1.5 seconds
        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert!(*source.connects.lock().unwrap() >= 2);

        drop(board);
        task.await.unwrap();
    }
}
