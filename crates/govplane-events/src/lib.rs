// SPDX-License-Identifier: MIT OR Apache-2.0
//! Long-lived consumer of the authority's state-change event stream.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use govplane_authority::AuthorityClient;
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};

/// A small reusable exponential backoff: doubles on each call up to a cap,
/// resets to its initial value on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    next: Duration,
}

impl Backoff {
    /// Build a backoff starting at `initial`, doubling up to `cap`.
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self { initial, cap, next: initial }
    }

    /// Return the current delay and double it (capped) for next time.
    pub fn advance(&mut self) -> Duration {
        let current = self.next;
        self.next = std::cmp::min(self.cap, self.next * 2);
        current
    }

    /// Reset to the initial delay, e.g. after a successful connection.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// One parsed SSE frame: the fields present in a single blank-line-delimited
/// block (`event:`, `id:`, `data:` lines).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, if present.
    pub event: Option<String>,
    /// The `id:` field, if present.
    pub id: Option<String>,
    /// The `data:` field(s), joined with `\n` if more than one line was sent.
    pub data: Option<String>,
}

/// Drain complete blank-line-delimited SSE blocks from `buffer`, leaving any
/// trailing partial block in place for the next call.
pub fn drain_events(buffer: &mut String) -> Vec<SseEvent> {
    let mut events = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        let mut event = SseEvent::default();
        let mut data_lines: Vec<&str> = Vec::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                event.event = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("id:") {
                event.id = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim());
            }
        }
        if !data_lines.is_empty() {
            event.data = Some(data_lines.join("\n"));
        }
        if event.event.is_some() || event.id.is_some() || event.data.is_some() {
            events.push(event);
        }
    }

    events
}

/// Live status of the event-stream connection, read by the distribution
/// server's `/health` endpoint.
#[derive(Debug, Clone, Default)]
pub struct StreamStatus {
    /// Whether the stream is currently connected.
    pub connected: bool,
    /// When the last `state` event was observed.
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Consumes the authority's state-change stream, latching the rebuild
/// (and optionally replay) trigger on every `state` event.
pub struct EventStreamConsumer {
    authority: Arc<AuthorityClient>,
    status: RwLock<StreamStatus>,
    rebuild_trigger: Arc<Notify>,
    replay_trigger: Option<Arc<Notify>>,
    last_event_id_sink: Option<Arc<RwLock<Option<String>>>>,
}

impl EventStreamConsumer {
    /// Build a consumer that latches `rebuild_trigger` on every `state`
    /// event, and `replay_trigger` too when configured. `last_event_id_sink`,
    /// when given, receives the id of every observed `state` event — the
    /// rebuild coordinator reads it back to embed in bundle metadata.
    pub fn new(
        authority: Arc<AuthorityClient>,
        rebuild_trigger: Arc<Notify>,
        replay_trigger: Option<Arc<Notify>>,
        last_event_id_sink: Option<Arc<RwLock<Option<String>>>>,
    ) -> Self {
        Self {
            authority,
            status: RwLock::new(StreamStatus::default()),
            rebuild_trigger,
            replay_trigger,
            last_event_id_sink,
        }
    }

    /// Snapshot the current connection status.
    pub async fn status(&self) -> StreamStatus {
        self.status.read().await.clone()
    }

    /// Run the consume-and-reconnect loop. Never returns; intended to be
    /// `tokio::spawn`ed and left to exit with the process.
    pub async fn run(&self) {
        let mut last_event_id: Option<String> = None;
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));

        loop {
            match self.authority.open_state_stream(last_event_id.as_deref()).await {
                Ok(mut response) => {
                    info!("connected to authority event stream");
                    self.set_connected(true).await;
                    backoff.reset();
                    self.drain_connection(&mut response, &mut last_event_id).await;
                }
                Err(err) => {
                    warn!(error = %err, "failed to open event stream");
                }
            }
            self.set_connected(false).await;
            let delay = backoff.advance();
            tokio::time::sleep(delay).await;
        }
    }

    async fn drain_connection(
        &self,
        response: &mut reqwest::Response,
        last_event_id: &mut Option<String>,
    ) {
        let mut buffer = String::new();
        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for event in drain_events(&mut buffer) {
                        self.handle_event(event, last_event_id).await;
                    }
                }
                Ok(None) => {
                    info!("event stream closed by authority");
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "event stream read failed");
                    return;
                }
            }
        }
    }

    async fn handle_event(&self, event: SseEvent, last_event_id: &mut Option<String>) {
        match event.event.as_deref() {
            Some("state") => {
                if let Some(id) = event.id {
                    *last_event_id = Some(id.clone());
                    if let Some(sink) = &self.last_event_id_sink {
                        *sink.write().await = Some(id);
                    }
                }
                {
                    let mut status = self.status.write().await;
                    status.last_event_at = Some(Utc::now());
                }
                self.rebuild_trigger.notify_one();
                if let Some(replay) = &self.replay_trigger {
                    replay.notify_one();
                }
            }
            Some("tick") | None => {}
            Some(other) => {
                warn!(event_type = other, "ignoring unrecognised SSE event type");
            }
        }
    }

    async fn set_connected(&self, connected: bool) {
        self.status.write().await.connected = connected;
    }
}
