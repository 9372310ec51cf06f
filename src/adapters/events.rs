//! Per-run event sinks handed to runners.
//!
//! Runners emit synchronously from their output loop; a writer task batches
//! payloads into the [`EventStore`] and forwards stored events to the
//! broadcaster.

use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::broadcast::Broadcaster;
use crate::domain::EventPayload;
use crate::store::EventStore;

const MAX_BATCH: usize = 50;

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Queue an event. Never blocks on storage.
    fn emit(&self, payload: EventPayload);

    /// Wait until every event emitted so far is durable.
    async fn flush(&self) -> Result<()>;
}

enum SinkMessage {
    Event(EventPayload),
    Flush(oneshot::Sender<()>),
    Close,
}

/// Batching writer over an [`EventStore`].
pub struct StoreEventSink {
    tx: mpsc::UnboundedSender<SinkMessage>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl StoreEventSink {
    pub fn spawn(
        run_id: &str,
        store: Arc<dyn EventStore>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(writer_task(run_id.to_string(), rx, store, broadcaster));
        Arc::new(Self {
            tx,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Write everything queued and stop the writer. Later events are dropped.
    pub async fn close(&self) -> Result<()> {
        let handle = self
            .writer
            .lock()
            .map_err(|_| anyhow!("event writer lock poisoned"))?
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };
        let _ = self.tx.send(SinkMessage::Close);
        handle
            .await
            .map_err(|e| anyhow!("event writer task failed: {}", e))
    }
}

#[async_trait]
impl EventSink for StoreEventSink {
    fn emit(&self, payload: EventPayload) {
        if self.tx.send(SinkMessage::Event(payload)).is_err() {
            tracing::debug!("Event writer closed; dropping event");
        }
    }

    async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(SinkMessage::Flush(ack_tx)).is_err() {
            return Ok(());
        }
        ack_rx
            .await
            .map_err(|_| anyhow!("event writer stopped before flushing"))
    }
}

async fn writer_task(
    run_id: String,
    mut rx: mpsc::UnboundedReceiver<SinkMessage>,
    store: Arc<dyn EventStore>,
    broadcaster: Arc<dyn Broadcaster>,
) {
    let mut batch: Vec<EventPayload> = Vec::new();
    let mut acks: Vec<oneshot::Sender<()>> = Vec::new();
    let mut closing = false;
    while !closing {
        match rx.recv().await {
            Some(SinkMessage::Event(payload)) => batch.push(payload),
            Some(SinkMessage::Flush(ack)) => acks.push(ack),
            Some(SinkMessage::Close) | None => closing = true,
        }
        // Drain whatever else is ready, up to one batch.
        while !closing && acks.is_empty() && batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(SinkMessage::Event(payload)) => batch.push(payload),
                Ok(SinkMessage::Flush(ack)) => acks.push(ack),
                Ok(SinkMessage::Close) => closing = true,
                Err(_) => break,
            }
        }
        write_batch(&run_id, &mut batch, store.as_ref(), broadcaster.as_ref()).await;
        for ack in acks.drain(..) {
            let _ = ack.send(());
        }
    }
}

async fn write_batch(
    run_id: &str,
    batch: &mut Vec<EventPayload>,
    store: &dyn EventStore,
    broadcaster: &dyn Broadcaster,
) {
    if batch.is_empty() {
        return;
    }
    let count = batch.len();
    match store.append_batch(run_id, std::mem::take(batch)).await {
        Ok(events) => {
            for event in &events {
                broadcaster.broadcast_event(event);
            }
        }
        Err(e) => {
            tracing::warn!(run_id, count, error = %format!("{:#}", e), "Failed to write run events");
        }
    }
}

/// Discards all events.
#[derive(Debug, Default)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    fn emit(&self, _payload: EventPayload) {}

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
