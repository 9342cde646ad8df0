//! Listeners, outbound connections and request/response correlation for a set of
//! analyzers.
//!
//! Every socket the manager owns, accepted or dialled, gets its own read loop. Frames
//! arriving on an accepted connection are acknowledged; frames arriving on a dialled
//! connection are matched by control id against the requests waiting on it. Both kinds
//! are published as [`EngineEvent`]s.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::Local;
use futures::StreamExt;
use log::{debug, error, info, trace, warn};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::builder::{build_ack, build_nack, build_order, WorklistRequest};
use crate::codec::{self, MllpCodec};
use crate::config::{DeviceEndpoint, DeviceRegistry, DeviceRole, EngineConfig};
use crate::connection::{
    Connection, ConnectionId, ConnectionInfo, ConnectionRole, ConnectionStatus,
};
use crate::error::{Hl7Error, Result};
use crate::events::{EngineEvent, EventPublisher, InboundMessage};
use crate::message::{AckCode, Message};
use crate::parser::{parse, salvage_control_id};
use crate::results::LabResult;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Application hook run on every message accepted from an analyzer, before it is
/// acknowledged. An `Err` turns the acknowledgment into an `AE` carrying the reason.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, device_id: &str, message: &Message) -> std::result::Result<(), String>;
}

/// What [`ConnectionManager::start_device`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStarted {
    Listening(SocketAddr),
    Connected(ConnectionId),
}

/// Everything the manager knows about one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub device_id: String,
    pub status: ConnectionStatus,
    /// Address the device's listener is bound to, if one is running
    pub listening_on: Option<SocketAddr>,
    pub connections: Vec<ConnectionInfo>,
}

impl DeviceStatus {
    pub fn is_listening(&self) -> bool {
        self.listening_on.is_some()
    }

    pub fn active_connections(&self) -> usize {
        self.connections
            .iter()
            .filter(|c| c.status == ConnectionStatus::Connected)
            .count()
    }
}

#[derive(Debug)]
struct Listener {
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

struct Inner {
    config: EngineConfig,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    listeners: RwLock<HashMap<String, Listener>>,
    events: EventPublisher,
    shutdown: CancellationToken,
    handler: Option<Arc<dyn MessageHandler>>,
    devices: Option<Arc<dyn DeviceRegistry>>,
}

/// Owns every listener and connection for a set of devices.
///
/// Cheap to clone; clones share the same registry. Must be used from within a tokio
/// runtime since listeners and read loops are spawned onto it.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

/// Assembles a [`ConnectionManager`] with its optional collaborators.
pub struct ConnectionManagerBuilder {
    config: EngineConfig,
    handler: Option<Arc<dyn MessageHandler>>,
    devices: Option<Arc<dyn DeviceRegistry>>,
}

impl ConnectionManagerBuilder {
    pub fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn device_registry(mut self, devices: Arc<dyn DeviceRegistry>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn build(self) -> ConnectionManager {
        ConnectionManager {
            inner: Arc::new(Inner {
                events: EventPublisher::new(self.config.event_capacity),
                config: self.config,
                connections: RwLock::new(HashMap::new()),
                listeners: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                handler: self.handler,
                devices: self.devices,
            }),
        }
    }
}

impl ConnectionManager {
    pub fn new(config: EngineConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: EngineConfig) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            config,
            handler: None,
            devices: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// A new receiver for everything the manager observes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Binds a listener for `device_id` and starts accepting analyzer connections on it.
    ///
    /// An empty `bind_address` means every interface, port `0` an ephemeral port; the
    /// address actually bound is returned. One listener per device.
    pub async fn start_server(
        &self,
        device_id: &str,
        bind_address: &str,
        port: u16,
    ) -> Result<SocketAddr> {
        self.inner.ensure_running()?;

        // held across the bind so two racing starts for one device can't both succeed
        let mut listeners = self.inner.listeners.write().await;
        if listeners.contains_key(device_id) {
            warn!("Server already running for device {}", device_id);
            return Err(Hl7Error::ListenerExists(device_id.to_string()));
        }

        let address = if bind_address.is_empty() {
            "0.0.0.0"
        } else {
            bind_address
        };
        let listener = match TcpListener::bind((address, port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    "Failed to start server for device {} on {}:{}: {}",
                    device_id, address, port, e
                );
                self.inner.events.error(device_id, "start_server", &e);
                self.inner.events.status(
                    device_id,
                    None,
                    ConnectionStatus::Error,
                    format!("Bind to {}:{} failed: {}", address, port, e),
                );
                return Err(Hl7Error::connection(format!(
                    "binding {}:{} failed: {}",
                    address, port, e
                )));
            }
        };
        let local_addr = listener.local_addr()?;

        let cancel = self.inner.shutdown.child_token();
        listeners.insert(
            device_id.to_string(),
            Listener {
                local_addr,
                cancel: cancel.clone(),
            },
        );
        drop(listeners);

        info!("HL7 server for device {} listening on {}", device_id, local_addr);
        self.inner.events.status(
            device_id,
            None,
            ConnectionStatus::Listening,
            format!("Listening on {}", local_addr),
        );

        tokio::spawn(accept_loop(
            self.inner.clone(),
            device_id.to_string(),
            listener,
            cancel,
        ));
        Ok(local_addr)
    }

    /// Stops the listener for `device_id` and closes the connections it accepted.
    /// Returns false when no listener was running.
    pub async fn stop_server(&self, device_id: &str) -> bool {
        let listener = self.inner.listeners.write().await.remove(device_id);
        let listener = match listener {
            Some(listener) => listener,
            None => {
                debug!("No server running for device {}", device_id);
                return false;
            }
        };
        listener.cancel.cancel();

        let accepted: Vec<Arc<Connection>> = self
            .inner
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.device_id() == device_id && c.role() == ConnectionRole::Inbound)
            .cloned()
            .collect();
        for connection in accepted {
            self.inner
                .teardown(&connection, ConnectionStatus::Disconnected, "Server stopped")
                .await;
        }

        info!("HL7 server for device {} on {} stopped", device_id, listener.local_addr);
        self.inner
            .events
            .status(device_id, None, ConnectionStatus::Stopped, "Server stopped");
        true
    }

    /// Opens an outbound connection to an analyzer and starts reading from it.
    pub async fn connect_as_client(
        &self,
        device_id: &str,
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<ConnectionId> {
        self.inner.ensure_running()?;

        info!("Connecting to device {} at {}:{}", device_id, host, port);
        self.inner.events.status(
            device_id,
            None,
            ConnectionStatus::Connecting,
            format!("Connecting to {}:{}", host, port),
        );

        let stream = match timeout(connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.inner.connect_failed(device_id, host, port, e)),
            Err(_) => {
                return Err(self.inner.connect_failed(
                    device_id,
                    host,
                    port,
                    format!("timed out after {:?}", connect_timeout),
                ))
            }
        };
        let peer = stream.peer_addr()?;

        let connection = self
            .inner
            .register(
                device_id,
                ConnectionRole::Outbound,
                stream,
                peer,
                self.inner.shutdown.child_token(),
            )
            .await;
        Ok(connection.id())
    }

    /// Sends `message` on an open connection and waits for the message whose MSA-2 (or,
    /// failing that, MSH-10) matches the request's control id.
    ///
    /// The waiter is registered before the first byte is written, so a reply can never
    /// arrive unobserved. `response_timeout` bounds the whole exchange, writing included.
    /// If the reply is late the waiter is removed and the connection stays up. If the
    /// write itself is still stuck at the deadline, the connection is closed, since a
    /// half-written frame leaves nothing usable behind it.
    pub async fn send_and_await_response(
        &self,
        connection_id: ConnectionId,
        message: &str,
        response_timeout: Duration,
    ) -> Result<Message> {
        let connection = self.inner.connection(connection_id).await?;
        if !connection.is_active() {
            return Err(Hl7Error::connection(format!(
                "connection {} is {}",
                connection_id,
                connection.status()
            )));
        }

        let body = codec::strip(message);
        let control_id = parse(body)?
            .control_id()
            .map(str::to_string)
            .ok_or_else(|| Hl7Error::parse("Outgoing message has no control id (MSH-10)"))?;

        let deadline = Instant::now() + response_timeout;
        let mut waiter = connection.pending().register(&control_id)?;
        let sent = match timeout_at(deadline, connection.send(body)).await {
            Ok(sent) => sent,
            Err(_) => {
                connection.pending().cancel(&control_id);
                warn!(
                    "Writing {} to device {} did not finish within {:?}",
                    control_id,
                    connection.device_id(),
                    response_timeout
                );
                self.inner.events.error(
                    connection.device_id(),
                    "send",
                    format!("timed out writing {}", control_id),
                );
                self.inner
                    .teardown(&connection, ConnectionStatus::Error, "Write timed out")
                    .await;
                return Err(Hl7Error::CorrelationTimeout {
                    control_id,
                    timeout: response_timeout,
                });
            }
        };
        if let Err(e) = sent {
            connection.pending().cancel(&control_id);
            error!(
                "Failed to send {} to device {}: {}",
                control_id,
                connection.device_id(),
                e
            );
            self.inner.events.error(connection.device_id(), "send", &e);
            return Err(e);
        }
        info!(
            "Sent message {} to device {}, awaiting response",
            control_id,
            connection.device_id()
        );

        match timeout_at(deadline, &mut waiter).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Err(Hl7Error::connection(format!(
                "connection {} closed while awaiting {}",
                connection_id, control_id
            ))),
            Err(_) => {
                if connection.pending().cancel(&control_id) {
                    warn!(
                        "No response from device {} for {} within {:?}",
                        connection.device_id(),
                        control_id,
                        response_timeout
                    );
                    self.inner.events.error(
                        connection.device_id(),
                        "send_and_await_response",
                        format!("timed out waiting for {}", control_id),
                    );
                    Err(Hl7Error::CorrelationTimeout {
                        control_id,
                        timeout: response_timeout,
                    })
                } else {
                    // answered between the deadline and the cancel
                    waiter.try_recv().unwrap_or(Err(Hl7Error::CorrelationTimeout {
                        control_id,
                        timeout: response_timeout,
                    }))
                }
            }
        }
    }

    /// Builds an ORM^O01 for `request`, sends it and waits for the analyzer's ACK. A
    /// negative ACK comes back as [`Hl7Error::ProtocolNack`].
    pub async fn send_worklist(
        &self,
        connection_id: ConnectionId,
        request: &WorklistRequest,
    ) -> Result<Message> {
        let order = build_order(request);
        let response = self
            .send_and_await_response(connection_id, &order, self.inner.config.response_timeout())
            .await?;

        if let Some(ack) = response.acknowledgment() {
            if !ack.is_accept() {
                warn!(
                    "Worklist for sample {} rejected with {}",
                    request.sample_id, ack.raw_code
                );
                return Err(Hl7Error::ProtocolNack {
                    code: ack.raw_code,
                    control_id: ack.control_id.unwrap_or_default(),
                    text: ack.text.unwrap_or_default(),
                });
            }
        }
        info!("Worklist for sample {} accepted", request.sample_id);
        Ok(response)
    }

    /// Closes one connection. Returns false when it wasn't registered.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> bool {
        let connection = self.inner.connections.read().await.get(&connection_id).cloned();
        match connection {
            Some(connection) => {
                self.inner
                    .teardown(&connection, ConnectionStatus::Disconnected, "Disconnected")
                    .await
            }
            None => false,
        }
    }

    pub async fn get_status(&self, device_id: &str) -> DeviceStatus {
        let listening_on = self
            .inner
            .listeners
            .read()
            .await
            .get(device_id)
            .map(|l| l.local_addr);
        let mut connections: Vec<ConnectionInfo> = self
            .inner
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.device_id() == device_id)
            .map(|c| c.info())
            .collect();
        connections.sort_by_key(|c| c.connected_at);

        let status = if connections
            .iter()
            .any(|c| c.status == ConnectionStatus::Connected)
        {
            ConnectionStatus::Connected
        } else if listening_on.is_some() {
            ConnectionStatus::Listening
        } else {
            ConnectionStatus::Disconnected
        };

        DeviceStatus {
            device_id: device_id.to_string(),
            status,
            listening_on,
            connections,
        }
    }

    pub async fn connection_info(&self, connection_id: ConnectionId) -> Option<ConnectionInfo> {
        self.inner
            .connections
            .read()
            .await
            .get(&connection_id)
            .map(|c| c.info())
    }

    /// Whether a request with `control_id` is still waiting on the connection.
    pub async fn is_awaiting(&self, connection_id: ConnectionId, control_id: &str) -> bool {
        self.inner
            .connections
            .read()
            .await
            .get(&connection_id)
            .map_or(false, |c| c.pending().contains(control_id))
    }

    /// Opens and immediately drops a TCP connection to see whether anything listens.
    pub async fn test_connection(&self, host: &str, port: u16, connect_timeout: Duration) -> bool {
        match timeout(connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => {
                debug!("Connection test to {}:{} succeeded", host, port);
                true
            }
            Ok(Err(e)) => {
                debug!("Connection test to {}:{} failed: {}", host, port, e);
                false
            }
            Err(_) => {
                debug!("Connection test to {}:{} timed out", host, port);
                false
            }
        }
    }

    /// Connects to a device the registry knows as a client-role analyzer.
    pub async fn connect_device(&self, device_id: &str) -> Result<ConnectionId> {
        let endpoint = self.inner.lookup(device_id)?;
        if endpoint.role != DeviceRole::Client {
            return Err(Hl7Error::config(format!(
                "device {} is configured to connect to us, not the other way round",
                device_id
            )));
        }
        self.connect_as_client(
            device_id,
            &endpoint.host,
            endpoint.port,
            self.inner.config.connect_timeout(),
        )
        .await
    }

    /// Listens for or connects to a registered device, whichever its role says.
    pub async fn start_device(&self, device_id: &str) -> Result<DeviceStarted> {
        let endpoint = self.inner.lookup(device_id)?;
        match endpoint.role {
            DeviceRole::Server => self
                .start_server(device_id, &endpoint.host, endpoint.port)
                .await
                .map(DeviceStarted::Listening),
            DeviceRole::Client => self
                .connect_as_client(
                    device_id,
                    &endpoint.host,
                    endpoint.port,
                    self.inner.config.connect_timeout(),
                )
                .await
                .map(DeviceStarted::Connected),
        }
    }

    /// Stops every listener, closes every connection and fails every pending request.
    /// The manager refuses new work afterwards.
    pub async fn shutdown(&self) {
        info!("Shutting down HL7 connection manager");
        self.inner.shutdown.cancel();

        let listeners: Vec<(String, Listener)> =
            self.inner.listeners.write().await.drain().collect();
        for (device_id, listener) in listeners {
            listener.cancel.cancel();
            self.inner
                .events
                .status(&device_id, None, ConnectionStatus::Stopped, "Engine shut down");
        }

        let connections: Vec<Arc<Connection>> =
            self.inner.connections.read().await.values().cloned().collect();
        for connection in connections {
            self.inner
                .teardown(&connection, ConnectionStatus::Disconnected, "Engine shut down")
                .await;
        }
    }
}

impl Inner {
    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Hl7Error::connection("connection manager is shut down"));
        }
        Ok(())
    }

    fn lookup(&self, device_id: &str) -> Result<DeviceEndpoint> {
        self.devices
            .as_ref()
            .and_then(|devices| devices.lookup(device_id))
            .ok_or_else(|| Hl7Error::UnknownDevice(device_id.to_string()))
    }

    async fn connection(&self, connection_id: ConnectionId) -> Result<Arc<Connection>> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .cloned()
            .ok_or_else(|| Hl7Error::connection(format!("unknown connection {}", connection_id)))
    }

    fn connect_failed(&self, device_id: &str, host: &str, port: u16, reason: impl ToString) -> Hl7Error {
        let reason = reason.to_string();
        error!(
            "Failed to connect to device {} at {}:{}: {}",
            device_id, host, port, reason
        );
        self.events.error(device_id, "connect", &reason);
        self.events.status(
            device_id,
            None,
            ConnectionStatus::Error,
            format!("Connect to {}:{} failed: {}", host, port, reason),
        );
        Hl7Error::connection(format!("connecting to {}:{} failed: {}", host, port, reason))
    }

    /// Splits the socket, records the connection and spawns its read loop.
    async fn register(
        self: &Arc<Self>,
        device_id: &str,
        role: ConnectionRole,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Arc<Connection> {
        let (read_half, write_half) = stream.into_split();
        let codec = MllpCodec::with_max_frame_len(self.config.max_frame_len);
        let reader = FramedRead::new(read_half, codec.clone());
        let writer = FramedWrite::new(write_half, codec);

        let connection = Arc::new(Connection::new(
            device_id.to_string(),
            role,
            peer,
            writer,
            cancel,
        ));
        self.connections
            .write()
            .await
            .insert(connection.id(), connection.clone());

        let reason = match role {
            ConnectionRole::Inbound => format!("Accepted connection from {}", peer),
            ConnectionRole::Outbound => format!("Connected to {}", peer),
        };
        self.events.status(
            device_id,
            Some(connection.id()),
            ConnectionStatus::Connected,
            reason,
        );

        tokio::spawn(read_loop(self.clone(), connection.clone(), reader));
        connection
    }

    /// Removes a connection from the registry and releases everything it holds. Only
    /// the first caller for a given connection does any work.
    async fn teardown(&self, connection: &Connection, status: ConnectionStatus, reason: &str) -> bool {
        if !connection.begin_close(status) {
            return false;
        }
        self.connections.write().await.remove(&connection.id());

        let failed = connection.pending().fail_all(reason);
        if failed > 0 {
            warn!(
                "Connection {} to device {} closed with {} requests unanswered",
                connection.id(),
                connection.device_id(),
                failed
            );
        }
        connection.shutdown_writer().await;

        self.events
            .status(connection.device_id(), Some(connection.id()), status, reason);
        true
    }

    async fn handle_frame(&self, connection: &Connection, frame: BytesMut) {
        connection.mark_received();
        let raw = String::from_utf8_lossy(&frame).into_owned();
        trace!("Frame from {}: {}", connection.peer(), raw);

        let message = match parse(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "Discarding unparseable message from device {}: {}",
                    connection.device_id(),
                    e
                );
                self.events.error(connection.device_id(), "parse", &e);
                if connection.role() == ConnectionRole::Inbound && salvage_control_id(&raw).is_some() {
                    let nack = build_nack(&raw, AckCode::Reject, &e.to_string());
                    self.reply(connection, &nack).await;
                }
                return;
            }
        };
        info!("Received {} from device {}", message, connection.device_id());

        match connection.role() {
            ConnectionRole::Inbound => self.handle_inbound(connection, message).await,
            ConnectionRole::Outbound => self.handle_response(connection, message),
        }
    }

    async fn handle_inbound(&self, connection: &Connection, message: Message) {
        let message = Arc::new(message);
        self.publish_message(connection, message.clone());

        let outcome = match &self.handler {
            Some(handler) => handler.handle(connection.device_id(), &message).await,
            None => Ok(()),
        };
        let (code, text) = match &outcome {
            Ok(()) => (AckCode::Accept, None),
            Err(reason) => {
                warn!("Handler refused {}: {}", message, reason);
                (AckCode::Error, Some(reason.as_str()))
            }
        };

        match build_ack(&message, code, text) {
            Ok(ack) => {
                self.reply(connection, &ack).await;
                debug!("Sent {} acknowledgment for {}", code, message);
            }
            Err(e) => {
                warn!("Cannot acknowledge {}: {}", message, e);
                self.events.error(connection.device_id(), "acknowledge", &e);
            }
        }
    }

    fn handle_response(&self, connection: &Connection, message: Message) {
        let message = Arc::new(message);
        if let Some(control_id) = message.correlation_id() {
            if connection.pending().resolve(control_id, (*message).clone()) {
                debug!("Resolved pending request {}", control_id);
            }
        }
        self.publish_message(connection, message);
    }

    fn publish_message(&self, connection: &Connection, message: Arc<Message>) {
        let lab_results: Vec<LabResult> = if message.is_type("ORU") {
            message.lab_results().collect()
        } else {
            Vec::new()
        };
        self.events.message(InboundMessage {
            device_id: connection.device_id().to_string(),
            connection_id: connection.id(),
            message,
            lab_results: lab_results.into(),
            received_at: Local::now(),
        });
    }

    async fn reply(&self, connection: &Connection, text: &str) {
        if let Err(e) = connection.send(text).await {
            warn!("Failed to reply to device {}: {}", connection.device_id(), e);
            self.events.error(connection.device_id(), "acknowledge", &e);
        }
    }
}

async fn accept_loop(
    inner: Arc<Inner>,
    device_id: String,
    listener: TcpListener,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("Device {} connected from {}", device_id, peer);
                    inner
                        .register(
                            &device_id,
                            ConnectionRole::Inbound,
                            stream,
                            peer,
                            cancel.child_token(),
                        )
                        .await;
                }
                Err(e) => {
                    error!("Error accepting connection for device {}: {}", device_id, e);
                    inner.events.error(&device_id, "accept", &e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
    debug!("Accept loop for device {} stopped", device_id);
}

async fn read_loop(
    inner: Arc<Inner>,
    connection: Arc<Connection>,
    mut reader: FramedRead<OwnedReadHalf, MllpCodec>,
) {
    let cancel = connection.cancel_token().clone();
    let (status, reason) = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break (ConnectionStatus::Disconnected, "Closed locally".to_string()),
            frame = reader.next() => frame,
        };
        match frame {
            Some(Ok(frame)) => inner.handle_frame(&connection, frame).await,
            Some(Err(e)) => {
                error!(
                    "Error reading from device {} at {}: {}",
                    connection.device_id(),
                    connection.peer(),
                    e
                );
                inner.events.error(connection.device_id(), "read", &e);
                break (ConnectionStatus::Error, e.to_string());
            }
            None => break (ConnectionStatus::Disconnected, "Peer closed the connection".to_string()),
        }
    };

    inner.teardown(&connection, status, &reason).await;
    debug!("Read loop for connection {} stopped", connection.id());
}
