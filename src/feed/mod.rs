//! Broadcaster update feed.
//!
//! The scraper announces each batch of freshly written snapshots as a small
//! JSON message `{"fixtureIds":[...]}`. The message names fixtures only; the
//! snapshots themselves are read back from the store.

pub mod sse;
pub mod subscriber;
pub mod websocket;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use url::Url;

use crate::error::FeedResult;

pub use subscriber::{UpdateBatch, UpdateSubscription};

/// Raw message bodies from one broadcaster connection. The stream ends (or
/// yields an error) when the connection is lost.
pub type EventStream = BoxStream<'static, FeedResult<String>>;

/// A transport that can open a connection to the broadcaster.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Display name for logging
    fn name(&self) -> &str;

    async fn connect(&self) -> FeedResult<EventStream>;
}

/// Pick the transport from the URL scheme: `http(s)` is server-sent events,
/// `ws(s)` is a WebSocket.
pub fn source_for(url: &Url, event_name: &str) -> Result<Arc<dyn UpdateSource>> {
    match url.scheme() {
        "http" | "https" => Ok(Arc::new(sse::SseSource::new(url.clone(), event_name)?)),
        "ws" | "wss" => Ok(Arc::new(websocket::WsSource::new(url.clone()))),
        other => bail!("Unsupported broadcaster URL scheme: {}", other),
    }
}
