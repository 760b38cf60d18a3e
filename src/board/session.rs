//! Per-session board state: one filter and one load-more window per client,
//! all reading the same shared row set.
//!
//! A session keeps an `Arc` of the row set it last sorted. When the board
//! swaps in new rows the pointers stop matching and the session re-sorts on
//! its next access, so idle sessions cost nothing on updates.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::filter::FilterConfig;
use super::pager::Window;
use super::persist::{FilterStateStore, SessionStores};
use crate::odds::gap::Row;

/// Sessions kept live at once; the least recently used is dropped beyond it.
pub const MAX_SESSIONS: usize = 256;

pub struct Session {
    filter: FilterConfig,
    window: Window,
    store: Box<dyn FilterStateStore>,
    rows: Arc<[Row]>,
    /// `rows` after filter and sort
    sorted: Vec<Row>,
    last_used: u64,
}

impl Session {
    fn open(session_id: &str, store: Box<dyn FilterStateStore>, page_size: usize) -> Self {
        let filter = store.load().unwrap_or_default();
        if filter != FilterConfig::default() {
            debug!("Session {}: restored saved filters {:?}", session_id, filter);
        }
        Session {
            filter,
            window: Window::new(page_size),
            store,
            rows: Arc::from(Vec::new()),
            sorted: Vec::new(),
            last_used: 0,
        }
    }

    fn sync(&mut self, rows: &Arc<[Row]>) {
        if !Arc::ptr_eq(&self.rows, rows) {
            self.rows = Arc::clone(rows);
            self.recompute();
        }
    }

    fn recompute(&mut self) {
        self.sorted = self.filter.apply(&self.rows);
    }

    pub fn filter(&self) -> &FilterConfig {
        &self.filter
    }

    /// Apply a new config: persist it, rewind the window, recompute.
    pub fn update_filter(&mut self, config: FilterConfig) {
        if let Err(e) = self.store.save(&config) {
            warn!("Failed to persist filters: {:#}", e);
        }
        debug!("Filters updated ({} active)", config.active_count());
        self.filter = config;
        self.window.reset();
        self.recompute();
    }

    pub fn reset_filter(&mut self) {
        self.update_filter(FilterConfig::default());
    }

    pub fn load_more(&mut self) -> bool {
        self.window.load_more(self.sorted.len())
    }

    pub fn visible_rows(&self) -> &[Row] {
        &self.sorted[..self.window_size()]
    }

    pub fn total(&self) -> usize {
        self.sorted.len()
    }

    pub fn window_size(&self) -> usize {
        self.window.size(self.sorted.len())
    }

    pub fn has_more(&self) -> bool {
        self.window.has_more(self.sorted.len())
    }
}

pub struct Sessions {
    stores: Box<dyn SessionStores>,
    page_size: usize,
    live: HashMap<String, Session>,
    clock: u64,
}

impl Sessions {
    pub fn new(stores: Box<dyn SessionStores>, page_size: usize) -> Self {
        Sessions {
            stores,
            page_size,
            live: HashMap::new(),
            clock: 0,
        }
    }

    /// The session for `session_id`, opened (and its filters restored) on
    /// first use and brought up to date with `rows`.
    pub fn get(&mut self, session_id: &str, rows: &Arc<[Row]>) -> &mut Session {
        self.clock += 1;
        if !self.live.contains_key(session_id) {
            self.make_room();
        }
        let stores = &self.stores;
        let page_size = self.page_size;
        let session = self
            .live
            .entry(session_id.to_string())
            .or_insert_with(|| Session::open(session_id, stores.open(session_id), page_size));
        session.last_used = self.clock;
        session.sync(rows);
        session
    }

    fn make_room(&mut self) {
        if self.live.len() < MAX_SESSIONS {
            return;
        }
        let oldest = self
            .live
            .iter()
            .min_by_key(|(_, session)| session.last_used)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            info!("Dropping idle session {}", id);
            self.live.remove(&id);
        }
    }
}
