//! Notification and audit sinks.
//!
//! Every admission decision and lifecycle transition is published as an
//! [`Event`]. Sinks are best-effort: a failed delivery is logged and never
//! rolls back the mutation that produced the event.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AdmissionGranted,
    AdmissionDenied,
    Created,
    StatusChanged,
    TransitionRejected,
    OperationFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub requester_id: u64,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(requester_id: u64, event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            requester_id,
            event_type,
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &Event) -> anyhow::Result<()>;
}

/// Publish to a sink, logging instead of propagating delivery failures.
pub async fn deliver(sink: &dyn EventSink, event: Event) {
    if let Err(e) = sink.publish(&event).await {
        warn!(
            event_type = ?event.event_type,
            requester = event.requester_id,
            error = %e,
            "event delivery failed"
        );
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Writes every event to the tracing subscriber.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&self, event: &Event) -> anyhow::Result<()> {
        info!(
            target: "events",
            event_type = ?event.event_type,
            requester = event.requester_id,
            payload = %event.payload,
        );
        Ok(())
    }
}

/// Fans events out to in-process subscribers.
///
/// Having no live subscribers is not an error; the event is simply dropped.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Event>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn publish(&self, event: &Event) -> anyhow::Result<()> {
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// POSTs each event as JSON to a configured URL.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    async fn publish(&self, event: &Event) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Delivers to each inner sink in order. One sink failing does not stop the
/// others; the first error is reported after all have been tried.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl EventSink for FanoutSink {
    async fn publish(&self, event: &Event) -> anyhow::Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(event).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
