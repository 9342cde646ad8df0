//! One live TCP conversation with an analyzer, and the table of requests on it that are
//! still waiting for their acknowledgment.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use futures::SinkExt;
use log::{debug, trace, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::oneshot;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::MllpCodec;
use crate::error::{Hl7Error, Result};
use crate::message::Message;

pub type ConnectionId = Uuid;

pub(crate) type MessageWriter = FramedWrite<OwnedWriteHalf, MllpCodec>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Listening,
    Error,
    Stopped,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Listening => "listening",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Who opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// Accepted by one of our listeners; we acknowledge what arrives
    Inbound,
    /// Dialled by us; what arrives is matched against pending requests
    Outbound,
}

type Waiter = oneshot::Sender<Result<Message>>;

/// Requests sent on a connection that are still waiting for the message carrying their
/// control id.
///
/// Every entry leaves the table exactly once, by [`resolve`](Self::resolve),
/// [`cancel`](Self::cancel) or [`fail_all`](Self::fail_all).
#[derive(Debug, Default)]
pub struct PendingResponses {
    waiters: Mutex<HashMap<String, Waiter>>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    // nothing here can panic while the lock is held, but a poisoned map is still usable
    fn waiters(&self) -> MutexGuard<'_, HashMap<String, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts waiting for `control_id`. A second registration for an id that is
    /// still outstanding is refused rather than replacing the first.
    pub fn register(&self, control_id: &str) -> Result<oneshot::Receiver<Result<Message>>> {
        let mut waiters = self.waiters();
        if waiters.contains_key(control_id) {
            return Err(Hl7Error::DuplicateControlId(control_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        waiters.insert(control_id.to_string(), tx);
        Ok(rx)
    }

    /// Hands `message` to whoever is waiting on `control_id`. Returns false when nobody
    /// is, which is normal for unsolicited traffic.
    pub fn resolve(&self, control_id: &str, message: Message) -> bool {
        match self.waiters().remove(control_id) {
            Some(waiter) => {
                // the receiver may have just timed out and gone away
                let _ = waiter.send(Ok(message));
                true
            }
            None => false,
        }
    }

    /// Drops the waiter for `control_id` without answering it.
    pub fn cancel(&self, control_id: &str) -> bool {
        self.waiters().remove(control_id).is_some()
    }

    /// Fails every outstanding waiter with a connection error. Returns how many there were.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, Waiter)> = self.waiters().drain().collect();
        let count = drained.len();
        for (control_id, waiter) in drained {
            trace!("Failing request {}: {}", control_id, reason);
            let _ = waiter.send(Err(Hl7Error::connection(reason)));
        }
        count
    }

    pub fn contains(&self, control_id: &str) -> bool {
        self.waiters().contains_key(control_id)
    }

    pub fn len(&self) -> usize {
        self.waiters().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct ConnectionState {
    status: ConnectionStatus,
    disconnected_at: Option<DateTime<Local>>,
    last_sent_at: Option<DateTime<Local>>,
    last_received_at: Option<DateTime<Local>>,
}

/// Point in time view of a [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub device_id: String,
    pub role: ConnectionRole,
    pub status: ConnectionStatus,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Local>,
    pub disconnected_at: Option<DateTime<Local>>,
    pub last_sent_at: Option<DateTime<Local>>,
    pub last_received_at: Option<DateTime<Local>>,
    /// Requests still waiting for their acknowledgment
    pub pending: usize,
}

/// A registered socket. The read half belongs to the connection's read loop; the write
/// half lives here behind a lock so replies and requests never interleave on the wire.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    device_id: String,
    role: ConnectionRole,
    peer: SocketAddr,
    connected_at: DateTime<Local>,
    state: Mutex<ConnectionState>,
    writer: tokio::sync::Mutex<MessageWriter>,
    pending: PendingResponses,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        device_id: String,
        role: ConnectionRole,
        peer: SocketAddr,
        writer: MessageWriter,
        cancel: CancellationToken,
    ) -> Self {
        Connection {
            id: Uuid::new_v4(),
            device_id,
            role,
            peer,
            connected_at: Local::now(),
            state: Mutex::new(ConnectionState {
                status: ConnectionStatus::Connected,
                disconnected_at: None,
                last_sent_at: None,
                last_received_at: None,
            }),
            writer: tokio::sync::Mutex::new(writer),
            pending: PendingResponses::new(),
            cancel,
            closed: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == ConnectionStatus::Connected && !self.closed.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> &PendingResponses {
        &self.pending
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn info(&self) -> ConnectionInfo {
        let state = self.state();
        ConnectionInfo {
            id: self.id,
            device_id: self.device_id.clone(),
            role: self.role,
            status: state.status,
            peer: self.peer,
            connected_at: self.connected_at,
            disconnected_at: state.disconnected_at,
            last_sent_at: state.last_sent_at,
            last_received_at: state.last_received_at,
            pending: self.pending.len(),
        }
    }

    /// Writes one message, wrapped in the MLLP envelope.
    ///
    /// Gives up with a `Connection` error as soon as the connection starts closing, both
    /// while queued behind another writer and while blocked on a peer that stopped reading.
    pub(crate) async fn send(&self, message: &str) -> Result<()> {
        let closed = || Hl7Error::connection(format!("connection {} is closed", self.id));
        if self.closed.load(Ordering::Acquire) {
            return Err(closed());
        }

        let mut writer = tokio::select! {
            _ = self.cancel.cancelled() => return Err(closed()),
            writer = self.writer.lock() => writer,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(closed()),
            written = writer.send(message) => written.map_err(|e| {
                Hl7Error::connection(format!("writing to {} failed: {}", self.peer, e))
            })?,
        }
        drop(writer);

        self.state().last_sent_at = Some(Local::now());
        trace!("Wrote {} bytes to {}", message.len(), self.peer);
        Ok(())
    }

    pub(crate) fn mark_received(&self) {
        self.state().last_received_at = Some(Local::now());
    }

    /// Flips the connection to closed. Only the first caller gets `true`, and only that
    /// caller goes on to tear the connection down.
    pub(crate) fn begin_close(&self, status: ConnectionStatus) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut state = self.state();
        state.status = status;
        state.disconnected_at = Some(Local::now());
        drop(state);

        self.cancel.cancel();
        true
    }

    /// Sends FIN on the write half. A writer stuck on a peer that stopped reading is
    /// abandoned after a second; the socket goes away with the last reference anyway.
    pub(crate) async fn shutdown_writer(&self) {
        let close = async {
            let mut writer = self.writer.lock().await;
            writer.get_mut().shutdown().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, close).await {
            Ok(Ok(())) => debug!("Closed connection {} to {}", self.id, self.peer),
            Ok(Err(e)) => debug!("Error closing connection {}: {}", self.id, e),
            Err(_) => warn!("Timed out closing connection {} to {}", self.id, self.peer),
        }
    }
}
