//! Fan-out of run events and run state changes to live subscribers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::{
    ApprovalState, RecommendationStatus, Run, RunEvent, RunMode, RunPhase, RunStatus,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum BroadcastMessage {
    RunEvent {
        event: RunEvent,
    },
    RunStatus {
        run_id: String,
        task_id: String,
        status: RunStatus,
        phase: RunPhase,
        mode: RunMode,
        progress_percent: u8,
        approval_state: ApprovalState,
        recommendation_status: RecommendationStatus,
        error: Option<String>,
    },
    RunProgress {
        run_id: String,
        phase: RunPhase,
        progress_percent: u8,
        current_action: String,
    },
}

impl BroadcastMessage {
    pub fn run_status(run: &Run) -> Self {
        Self::RunStatus {
            run_id: run.id.clone(),
            task_id: run.task_id.clone(),
            status: run.status,
            phase: run.phase,
            mode: run.mode,
            progress_percent: run.progress_percent,
            approval_state: run.approval_state,
            recommendation_status: run.recommendation.status,
            error: run.error_message.clone(),
        }
    }
}

/// Sink for live notifications. Delivery is best effort and never fails
/// the caller.
pub trait Broadcaster: Send + Sync {
    fn broadcast_event(&self, event: &RunEvent);
    fn broadcast_run_status(&self, run: &Run);
    fn broadcast_progress(&self, run_id: &str, phase: RunPhase, percent: u8, action: &str);
}

/// Serializes messages to JSON on a tokio broadcast channel.
#[derive(Clone)]
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<String>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<String> {
        self.tx.clone()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &BroadcastMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            // No receivers is fine.
            let _ = tx.send(json);
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize broadcast message");
        }
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast_event(&self, event: &RunEvent) {
        broadcast_message(
            &self.tx,
            &BroadcastMessage::RunEvent {
                event: event.clone(),
            },
        );
    }

    fn broadcast_run_status(&self, run: &Run) {
        broadcast_message(&self.tx, &BroadcastMessage::run_status(run));
    }

    fn broadcast_progress(&self, run_id: &str, phase: RunPhase, percent: u8, action: &str) {
        broadcast_message(
            &self.tx,
            &BroadcastMessage::RunProgress {
                run_id: run_id.to_string(),
                phase,
                progress_percent: percent,
                current_action: action.to_string(),
            },
        );
    }
}

/// Drops everything. Used when no live surface is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBroadcaster;

impl Broadcaster for NullBroadcaster {
    fn broadcast_event(&self, _event: &RunEvent) {}
    fn broadcast_run_status(&self, _run: &Run) {}
    fn broadcast_progress(&self, _run_id: &str, _phase: RunPhase, _percent: u8, _action: &str) {}
}
