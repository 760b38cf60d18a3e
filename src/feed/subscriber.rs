//! One long-lived subscription to the update feed.
//!
//! A background task reads the source and publishes each decoded batch into a
//! `watch` channel, so a slow consumer only ever sees the most recent batch.
//! The task stops on the first transport error or when the stream ends; the
//! error is kept for `close()` and nothing here reconnects.

use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::UpdateSource;
use crate::db::models::FixtureId;
use crate::error::{FeedError, FeedResult};

/// Fixture ids announced together. `seq` starts at 1 and increases per
/// batch, so two identical id lists are still two batches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateBatch {
    pub seq: u64,
    pub fixture_ids: Vec<FixtureId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateMessage {
    fixture_ids: Vec<FixtureId>,
}

pub fn decode_batch(body: &str) -> serde_json::Result<Vec<FixtureId>> {
    serde_json::from_str::<UpdateMessage>(body).map(|m| m.fixture_ids)
}

pub struct UpdateSubscription {
    batches: watch::Receiver<UpdateBatch>,
    task: Option<JoinHandle<FeedResult<()>>>,
}

impl UpdateSubscription {
    /// Start the background reader. Connection errors surface through
    /// `next_batch` returning `None` and `close` returning the error.
    pub fn open(source: Arc<dyn UpdateSource>) -> Self {
        let (tx, rx) = watch::channel(UpdateBatch::default());
        let task = tokio::spawn(pump(source, tx));
        UpdateSubscription {
            batches: rx,
            task: Some(task),
        }
    }

    /// The most recent batch, if any has arrived.
    pub fn latest(&self) -> Option<UpdateBatch> {
        let batch = self.batches.borrow();
        (batch.seq > 0).then(|| (*batch).clone())
    }

    pub fn is_open(&self) -> bool {
        self.task.is_some()
    }

    /// Wait for a batch newer than the last one returned. `None` once the
    /// reader has stopped and its final batch has been seen.
    pub async fn next_batch(&mut self) -> Option<UpdateBatch> {
        if !self.is_open() {
            return None;
        }
        match self.batches.changed().await {
            Ok(()) => Some(self.batches.borrow_and_update().clone()),
            Err(_) => None,
        }
    }

    /// Stop the reader and return the error it stopped on, if any. Calling
    /// it again is a no-op returning `None`.
    pub async fn close(&mut self) -> Option<FeedError> {
        let task = self.task.take()?;
        task.abort();
        match task.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(e) if e.is_cancelled() => None,
            Err(e) => Some(FeedError::Transport(format!("update reader panicked: {}", e))),
        }
    }
}

impl Drop for UpdateSubscription {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

async fn pump(source: Arc<dyn UpdateSource>, tx: watch::Sender<UpdateBatch>) -> FeedResult<()> {
    let mut events = source.connect().await?;
    info!("[{}] Update feed connected", source.name());

    let mut seq = 0u64;
    while let Some(event) = events.next().await {
        let body = event?;
        match decode_batch(&body) {
            Ok(fixture_ids) => {
                seq += 1;
                debug!("[{}] Batch {}: {:?}", source.name(), seq, fixture_ids);
                if tx.send(UpdateBatch { seq, fixture_ids }).is_err() {
                    // subscription dropped
                    return Ok(());
                }
            }
            Err(e) => warn!("[{}] Ignoring undecodable update {:?}: {}", source.name(), body, e),
        }
    }
    Err(FeedError::Transport(format!("{} stream ended", source.name())))
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::feed::EventStream;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::Mutex;

    /// Replays a fixed script of events, then either holds the connection
    /// open or ends it.
    pub struct ScriptedSource {
        script: Mutex<Vec<FeedResult<String>>>,
        connect_error: Option<FeedError>,
        hold_open: bool,
        pub connects: Mutex<usize>,
    }

    impl ScriptedSource {
        pub fn new(script: Vec<FeedResult<String>>, hold_open: bool) -> Self {
            ScriptedSource {
                script: Mutex::new(script),
                connect_error: None,
                hold_open,
                connects: Mutex::new(0),
            }
        }

        pub fn refusing(error: FeedError) -> Self {
            ScriptedSource {
                connect_error: Some(error),
                ..ScriptedSource::new(vec![], false)
            }
        }

        pub fn ids(ids: &[FixtureId]) -> FeedResult<String> {
            Ok(serde_json::json!({ "fixtureIds": ids }).to_string())
        }
    }

    #[async_trait]
    impl UpdateSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn connect(&self) -> FeedResult<EventStream> {
            *self.connects.lock().unwrap() += 1;
            if let Some(e) = &self.connect_error {
                return Err(e.clone());
            }
            let events = std::mem::take(&mut *self.script.lock().unwrap());
            let replay = stream::iter(events);
            if self.hold_open {
                Ok(replay.chain(stream::pending()).boxed())
            } else {
                Ok(replay.boxed())
            }
        }
    }
}
