//! Server-sent events transport for the broadcaster.
//!
//! The response body is split into events on blank lines. Only events whose
//! name matches the configured one (the broadcaster uses `odds-update`) are
//! passed on; keep-alive comments and other event names are dropped.

use async_trait::async_trait;
use futures_util::future;
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use std::collections::VecDeque;
use std::fmt::Display;
use std::time::Duration;
use url::Url;

use super::{EventStream, UpdateSource};
use crate::error::{FeedError, FeedResult};

/// Longest line the decoder buffers while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 256 * 1024;

pub struct SseSource {
    client: reqwest::Client,
    url: Url,
    event_name: String,
}

impl SseSource {
    pub fn new(url: Url, event_name: &str) -> anyhow::Result<Self> {
        // no overall timeout: the response body is the stream
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(SseSource {
            client,
            url,
            event_name: event_name.to_string(),
        })
    }
}

#[async_trait]
impl UpdateSource for SseSource {
    fn name(&self) -> &str {
        "sse"
    }

    async fn connect(&self) -> FeedResult<EventStream> {
        let resp = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(FeedError::transport)?;

        if !resp.status().is_success() {
            return Err(FeedError::Transport(format!(
                "{} returned {}",
                self.url,
                resp.status()
            )));
        }

        Ok(named_events(resp.bytes_stream(), self.event_name.clone()).boxed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser. Only the `event` and `data`
/// fields are interpreted.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed a chunk of the body; returns every event completed by it. Fails
    /// once an unterminated line grows past `MAX_LINE_BYTES`.
    pub fn push(&mut self, chunk: &[u8]) -> FeedResult<Vec<SseEvent>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.line(&line) {
                out.push(event);
            }
        }
        if self.buf.len() > MAX_LINE_BYTES {
            return Err(FeedError::Transport(format!(
                "event stream line exceeds {} bytes",
                MAX_LINE_BYTES
            )));
        }
        Ok(out)
    }

    fn line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            let event = self.event.take();
            if self.data.is_empty() {
                return None;
            }
            return Some(SseEvent {
                event: event.unwrap_or_else(|| "message".to_string()),
                data: std::mem::take(&mut self.data).join("\n"),
            });
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

/// Decode a byte stream into the data of events named `event_name`. A body
/// error ends the stream after yielding it as a transport error.
pub fn named_events<S, B, E>(
    body: S,
    event_name: String,
) -> impl Stream<Item = FeedResult<String>> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let start = Some((body.boxed(), SseDecoder::default(), VecDeque::<SseEvent>::new()));
    let events = stream::unfold(start, |state| async move {
        let Some((mut body, mut decoder, mut ready)) = state else {
            return None;
        };
        loop {
            if let Some(event) = ready.pop_front() {
                return Some((Ok(event), Some((body, decoder, ready))));
            }
            match body.next().await {
                Some(Ok(chunk)) => match decoder.push(chunk.as_ref()) {
                    Ok(events) => ready.extend(events),
                    Err(e) => return Some((Err(e), None)),
                },
                Some(Err(e)) => return Some((Err(FeedError::transport(e)), None)),
                None => return None,
            }
        }
    });

    events.filter_map(move |event| {
        future::ready(match event {
            Ok(event) if event.event == event_name => Some(Ok(event.data)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
    })
}
