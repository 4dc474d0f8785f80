//! Event types for observing the state tree
//!
//! Events report update progress and every committed change to a cell, so
//! external consumers (a renderer, a UI) can react without polling.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::cell::CellStatus;
use crate::tree::Ref;

/// Trait for delivering state events
///
/// This abstracts over the transport (broadcast channel, host callback,
/// collecting vector) so the engine can be embedded anywhere.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be delivered.
    fn send(&self, event: StateEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone, thiserror::Error)]
#[error("Event error: {message}")]
pub struct EventError {
    pub message: String,
}

impl EventError {
    pub fn no_receivers() -> Self {
        Self {
            message: "No active receivers".to_string(),
        }
    }
}

/// Events emitted by the state engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StateEvent {
    /// An update began; `affected` lists cells scheduled for (re)computation
    #[serde(rename_all = "camelCase")]
    UpdateStarted { update_id: String, affected: Vec<Ref> },

    /// An update finished
    #[serde(rename_all = "camelCase")]
    UpdateFinished { update_id: String, success: bool },

    /// A cell was added to the tree
    #[serde(rename_all = "camelCase")]
    CellCreated { cell_ref: Ref },

    /// A cell was removed from the tree
    #[serde(rename_all = "camelCase")]
    CellRemoved { cell_ref: Ref },

    /// A cell's status changed
    #[serde(rename_all = "camelCase")]
    CellStatusChanged {
        cell_ref: Ref,
        status: CellStatus,
        error: Option<String>,
    },

    /// A cell committed a new value
    #[serde(rename_all = "camelCase")]
    CellCommitted { cell_ref: Ref, version: u64 },

    /// Human-readable phase message (engine- or operation-level)
    #[serde(rename_all = "camelCase")]
    Progress { cell_ref: Option<Ref>, message: String },
}

impl StateEvent {
    /// The cell this event concerns, if any
    pub fn cell_ref(&self) -> Option<&str> {
        match self {
            Self::CellCreated { cell_ref }
            | Self::CellRemoved { cell_ref }
            | Self::CellStatusChanged { cell_ref, .. }
            | Self::CellCommitted { cell_ref, .. } => Some(cell_ref),
            Self::Progress { cell_ref, .. } => cell_ref.as_deref(),
            Self::UpdateStarted { .. } | Self::UpdateFinished { .. } => None,
        }
    }
}

/// A no-op event sink that discards all events
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: StateEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecEventSink {
    events: parking_lot::Mutex<Vec<StateEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<StateEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: StateEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Fan-out sink backed by a tokio broadcast channel
pub struct BroadcastEventSink {
    sender: broadcast::Sender<StateEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event sent after this call
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.sender.subscribe()
    }

    /// Receive events concerning one cell
    pub fn watch(&self, cell_ref: impl Into<Ref>) -> CellWatcher {
        CellWatcher {
            cell_ref: cell_ref.into(),
            receiver: self.sender.subscribe(),
        }
    }
}

impl EventSink for BroadcastEventSink {
    fn send(&self, event: StateEvent) -> Result<(), EventError> {
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|_| EventError::no_receivers())
    }
}

/// Subscription to the events of a single cell
pub struct CellWatcher {
    cell_ref: Ref,
    receiver: broadcast::Receiver<StateEvent>,
}

impl CellWatcher {
    pub fn cell_ref(&self) -> &str {
        &self.cell_ref
    }

    /// Wait for the next event about this cell.
    ///
    /// Returns `None` once the sender is gone. Events lost to lagging are
    /// skipped.
    pub async fn recv(&mut self) -> Option<StateEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.cell_ref() == Some(self.cell_ref.as_str()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Watcher for '{}' lagged by {} events", self.cell_ref, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-buffered event about this cell, without waiting
    pub fn try_recv(&mut self) -> Option<StateEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.cell_ref() == Some(self.cell_ref.as_str()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
