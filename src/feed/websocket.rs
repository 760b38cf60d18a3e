//! WebSocket transport for the broadcaster.
//!
//! A background task owns the socket: it answers pings, sends a client ping
//! every `PING_INTERVAL`, and forwards text frames. Each connection lives
//! exactly as long as its event stream; nothing here reconnects.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use futures_util::SinkExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use super::{EventStream, UpdateSource};
use crate::error::{FeedError, FeedResult};

const PING_INTERVAL: Duration = Duration::from_secs(20);

pub struct WsSource {
    url: Url,
}

impl WsSource {
    pub fn new(url: Url) -> Self {
        WsSource { url }
    }
}

#[async_trait]
impl UpdateSource for WsSource {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn connect(&self) -> FeedResult<EventStream> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(FeedError::transport)?;
        debug!("[websocket] Connected to {}", self.url);

        let (tx, rx) = mpsc::channel::<FeedResult<String>>(64);
        tokio::spawn(async move {
            let (mut write, mut read) = ws_stream.split();
            let mut ping_interval = tokio::time::interval_at(
                tokio::time::Instant::now() + PING_INTERVAL,
                PING_INTERVAL,
            );

            loop {
                tokio::select! {
                    msg = read.next() => {
                        let forward = match msg {
                            Some(Ok(Message::Text(text))) => Ok(text),
                            Some(Ok(Message::Ping(data))) => {
                                let _ = write.send(Message::Pong(data)).await;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) => {
                                Err(FeedError::Transport("server closed websocket".into()))
                            }
                            Some(Err(e)) => Err(FeedError::transport(e)),
                            None => Err(FeedError::Transport("websocket stream ended".into())),
                            _ => continue,
                        };
                        let stop = forward.is_err();
                        if tx.send(forward).await.is_err() || stop {
                            break;
                        }
                    }
                    _ = ping_interval.tick() => {
                        if tx.is_closed() {
                            break;
                        }
                        if let Err(e) = write.send(Message::Ping(vec![])).await {
                            warn!("[websocket] Ping failed: {}", e);
                            let _ = tx.send(Err(FeedError::transport(e))).await;
                            break;
                        }
                    }
                }
            }
            let _ = write.close().await;
        });

        let events = stream::unfold(rx, |mut rx| async move {
            let event = rx.recv().await;
            event.map(|event| (event, rx))
        });
        Ok(events.boxed())
    }
}
