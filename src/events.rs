//! Engine events: traffic, state changes and errors, fanned out to any number of
//! subscribers over a tokio broadcast channel.
//!
//! Publishing never waits. A subscriber that falls more than the channel capacity behind
//! sees `RecvError::Lagged` and carries on from the oldest event still buffered; it never
//! holds up a socket.

use std::sync::Arc;

use chrono::{DateTime, Local};
use log::{debug, info};
use tokio::sync::broadcast;

use crate::connection::{ConnectionId, ConnectionStatus};
use crate::message::Message;
use crate::results::LabResult;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    MessageReceived(InboundMessage),
    StatusChanged(StatusChange),
    Error(ErrorEvent),
}

/// A parsed message that arrived on one of the manager's connections.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub device_id: String,
    pub connection_id: ConnectionId,
    pub message: Arc<Message>,
    /// Already extracted for ORU messages, empty otherwise
    pub lab_results: Arc<[LabResult]>,
    pub received_at: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct StatusChange {
    pub device_id: String,
    /// `None` for listener level changes
    pub connection_id: Option<ConnectionId>,
    pub status: ConnectionStatus,
    pub reason: String,
    pub at: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub device_id: String,
    pub operation: &'static str,
    pub error: String,
    pub at: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub(crate) struct EventPublisher {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventPublisher {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventPublisher { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub(crate) fn message(&self, inbound: InboundMessage) {
        self.publish(EngineEvent::MessageReceived(inbound));
    }

    pub(crate) fn status(
        &self,
        device_id: &str,
        connection_id: Option<ConnectionId>,
        status: ConnectionStatus,
        reason: impl Into<String>,
    ) {
        let reason = reason.into();
        info!("Device {} is now {}: {}", device_id, status, reason);
        self.publish(EngineEvent::StatusChanged(StatusChange {
            device_id: device_id.to_string(),
            connection_id,
            status,
            reason,
            at: Local::now(),
        }));
    }

    // callers log errors at whatever level suits them, this only fans out
    pub(crate) fn error(&self, device_id: &str, operation: &'static str, error: impl ToString) {
        let error = error.to_string();
        debug!("Publishing {} error for device {}: {}", operation, device_id, error);
        self.publish(EngineEvent::Error(ErrorEvent {
            device_id: device_id.to_string(),
            operation,
            error,
            at: Local::now(),
        }));
    }
}
