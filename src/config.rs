use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::board::pager::DEFAULT_PAGE_SIZE;
use crate::board::persist::valid_session_id;
use crate::board::RuntimeConfig;

/// NBA player-prop odds gap board
#[derive(Parser, Debug, Clone)]
#[command(name = "propscope", version, about)]
pub struct Config {
    /// SQLite database written by the odds scraper
    #[arg(long, env = "DATABASE_PATH", default_value = "propscope.db")]
    pub database_path: String,

    /// Board API listen address
    #[arg(long, env = "DASHBOARD_ADDR", default_value = "0.0.0.0:8080")]
    pub dashboard_addr: String,

    /// Update broadcaster URL: http(s) for server-sent events, ws(s) for WebSocket
    #[arg(
        long,
        env = "BROADCASTER_URL",
        default_value = "http://localhost:3001/events"
    )]
    pub broadcaster_url: String,

    /// Server-sent event name carrying update batches
    #[arg(long, env = "UPDATE_EVENT_NAME", default_value = "odds-update")]
    pub update_event_name: String,

    /// Rows added to the board per "load more"
    #[arg(long, env = "PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,

    /// Directory for saved filter state; kept in memory only when unset
    #[arg(long, env = "FILTER_STATE_DIR")]
    pub filter_state_dir: Option<PathBuf>,

    /// Session for API requests that carry no x-session-id header
    #[arg(long, env = "SESSION_ID", default_value = "default")]
    pub session_id: String,

    /// Open-fixture list reload interval in seconds
    #[arg(long, env = "FIXTURE_REFRESH_SECS", default_value = "300")]
    pub fixture_refresh_secs: u64,

    /// Re-read every fixture on this interval in seconds (0 = updates only)
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value = "0")]
    pub poll_interval_secs: u64,

    /// Store read timeout in seconds
    #[arg(long, env = "STORE_TIMEOUT_SECS", default_value = "10")]
    pub store_timeout_secs: u64,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let url = self.broadcaster_url()?;
        if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
            anyhow::bail!(
                "BROADCASTER_URL must use http, https, ws or wss (got {})",
                url.scheme()
            );
        }
        if self.page_size == 0 {
            anyhow::bail!("page_size must be positive");
        }
        if self.fixture_refresh_secs == 0 {
            anyhow::bail!("fixture_refresh_secs must be positive");
        }
        if self.store_timeout_secs == 0 {
            anyhow::bail!("store_timeout_secs must be positive");
        }
        if self.update_event_name.trim().is_empty() {
            anyhow::bail!("update_event_name must not be empty");
        }
        if !valid_session_id(&self.session_id) {
            anyhow::bail!("session_id must be 1-64 letters, digits, '-' or '_'");
        }
        Ok(())
    }

    pub fn broadcaster_url(&self) -> anyhow::Result<Url> {
        Url::parse(&self.broadcaster_url)
            .map_err(|e| anyhow::anyhow!("Invalid BROADCASTER_URL {}: {}", self.broadcaster_url, e))
    }

    pub fn runtime(&self) -> RuntimeConfig {
        RuntimeConfig {
            page_size: self.page_size,
            fixture_refresh: Duration::from_secs(self.fixture_refresh_secs),
            poll_interval: (self.poll_interval_secs > 0)
                .then(|| Duration::from_secs(self.poll_interval_secs)),
            store_timeout: Duration::from_secs(self.store_timeout_secs),
        }
    }
}
