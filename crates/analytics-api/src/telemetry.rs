//! Best-effort event forwarding
//!
//! Tracked downloads are mirrored to an external event stream when
//! `TOOLPULSE_TELEMETRY_URL` is set. Forwarding is strictly auxiliary:
//! - [`TelemetryEmitter::emit`] never blocks and never fails
//! - a full buffer drops the event with a warning
//! - a failed POST drops the batch with a warning
//!
//! Events are batched by a background task and sent as a JSON array.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default number of buffered events
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Default flush interval
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Batches are sent early once they reach this size
const MAX_BATCH_SIZE: usize = 100;

/// One forwarded event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub event: String,
    /// Unix seconds
    pub timestamp: i64,
    pub properties: serde_json::Value,
}

impl TelemetryEvent {
    pub fn new(event: impl Into<String>, timestamp: i64, properties: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            timestamp,
            properties,
        }
    }
}

/// Handle used by request handlers to queue events
///
/// A disabled emitter silently discards everything.
#[derive(Debug, Clone)]
pub struct TelemetryEmitter {
    sender: Option<mpsc::Sender<TelemetryEvent>>,
}

impl TelemetryEmitter {
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Create an emitter and the receiver its background task drains
    pub fn new(buffer_size: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// Spawn the forwarding task for `url`, or return a disabled emitter
    /// when no URL is configured
    pub fn spawn(url: Option<String>, timeout: Duration) -> Self {
        let Some(url) = url else {
            debug!("Telemetry forwarding disabled");
            return Self::disabled();
        };
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Failed to build telemetry client, forwarding disabled");
                return Self::disabled();
            }
        };
        let (emitter, receiver) = Self::new(DEFAULT_BUFFER_SIZE);
        tokio::spawn(telemetry_task(receiver, client, url, DEFAULT_FLUSH_INTERVAL));
        emitter
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Queue an event without waiting
    pub fn emit(&self, event: TelemetryEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(event = %event.event, "Telemetry buffer full, event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(event = %event.event, "Telemetry channel closed, event dropped");
            }
        }
    }
}

/// Background task that batches events and POSTs them to `url`
pub async fn telemetry_task(
    mut receiver: mpsc::Receiver<TelemetryEvent>,
    client: reqwest::Client,
    url: String,
    flush_interval: Duration,
) {
    let mut batch: Vec<TelemetryEvent> = Vec::with_capacity(MAX_BATCH_SIZE);
    // First flush one full interval from now, not immediately
    let mut interval =
        tokio::time::interval_at(tokio::time::Instant::now() + flush_interval, flush_interval);

    info!(url = %url, "Telemetry task started");

    loop {
        tokio::select! {
            event = receiver.recv() => {
                match event {
                    Some(e) => {
                        batch.push(e);
                        if batch.len() >= MAX_BATCH_SIZE {
                            flush_batch(&mut batch, &client, &url).await;
                        }
                    }
                    None => {
                        flush_batch(&mut batch, &client, &url).await;
                        info!("Telemetry task shutting down");
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_batch(&mut batch, &client, &url).await;
            }
        }
    }
}

async fn flush_batch(batch: &mut Vec<TelemetryEvent>, client: &reqwest::Client, url: &str) {
    if batch.is_empty() {
        return;
    }
    let events = std::mem::take(batch);
    let count = events.len();

    match client.post(url).json(&events).send().await {
        Ok(response) if response.status().is_success() => {
            debug!(count, "Telemetry batch forwarded");
        }
        Ok(response) => {
            warn!(count, status = response.status().as_u16(), "Telemetry endpoint rejected batch");
        }
        Err(e) => {
            warn!(count, error = %e, "Telemetry batch dropped");
        }
    }
}
