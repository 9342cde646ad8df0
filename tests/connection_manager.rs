use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::codec::{Framed, FramedRead};

use hl7_mllp_engine::{
    build_ack, codec, parse, AckCode, ConnectionManager, ConnectionStatus, DeviceEndpoint,
    DeviceRole, DeviceStarted, EngineConfig, EngineEvent, Hl7Error, InboundMessage, Message,
    MessageHandler, MllpCodec, StaticDeviceRegistry, TestRequest, WorklistRequest,
};

const ORU: &str = "MSH|^~\\&|ANALYZER|LAB|LIS|HOSP|20240101120000||ORU^R01|MSG001|P|2.5\rPID|1||12345^^^MRN||DOE^JOHN||19800101|M\rOBR|1||S0001|CBC^Complete blood count\rOBX|1|NM|GLU^Glucose^LN||5.6|mmol/L|3.9-5.5|H|||F\rOBX|2|NM|K^Potassium^LN||4.1|mmol/L|3.5-5.1|N|||F";

const WAIT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn oru(control_id: &str) -> String {
    ORU.replace("MSG001", control_id)
}

async fn next_inbound(rx: &mut broadcast::Receiver<EngineEvent>) -> InboundMessage {
    loop {
        match timeout(WAIT, rx.recv()).await {
            Ok(Ok(EngineEvent::MessageReceived(inbound))) => return inbound,
            Ok(Ok(_)) => continue,
            other => panic!("Expected a received message, got {:?}", other),
        }
    }
}

async fn read_reply<R>(reader: &mut FramedRead<R, MllpCodec>) -> Message
where
    R: tokio::io::AsyncRead + Unpin,
{
    let frame = timeout(WAIT, reader.next())
        .await
        .expect("no reply in time")
        .expect("connection closed")
        .expect("bad frame");
    parse(&String::from_utf8_lossy(&frame)).unwrap()
}

/// A fake analyzer listening for worklists, answering each with `code`.
async fn analyzer(code: AckCode, text: Option<&'static str>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = Framed::new(stream, MllpCodec::new());
        while let Some(Ok(frame)) = transport.next().await {
            let order = parse(&String::from_utf8_lossy(&frame)).unwrap();
            let ack = build_ack(&order, code, text).unwrap();
            transport.send(ack.as_str()).await.unwrap();
        }
    });
    addr
}

/// A fake analyzer that reads everything and never answers.
async fn silent_analyzer() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = Framed::new(stream, MllpCodec::new());
        while let Some(Ok(_)) = transport.next().await {}
    });
    addr
}

/// A fake analyzer that accepts and then never reads, so our writes back up.
async fn deaf_analyzer() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(stream);
    });
    addr
}

/// An ORU whose OBX-5 is far bigger than any socket buffer.
fn oversized_oru(control_id: &str) -> String {
    format!(
        "MSH|^~\\&|LIS|LAB|ANALYZER|LAB|20240101120000||ORU^R01|{}|P|2.5\rOBX|1|ED|IMG^Image||{}",
        control_id,
        "x".repeat(32 * 1024 * 1024)
    )
}

#[tokio::test]
async fn inbound_results_are_published_and_acknowledged() {
    init_logging();
    let manager = ConnectionManager::new(EngineConfig::default());
    let mut events = manager.subscribe();
    let addr = manager.start_server("sysmex-1", "127.0.0.1", 0).await.unwrap();

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut replies = FramedRead::new(read_half, MllpCodec::new());

    // dribble the frame out in pieces, splitting the envelope bytes too
    let framed = codec::wrap(ORU).into_bytes();
    for chunk in &[&framed[..1], &framed[1..40], &framed[40..framed.len() - 1], &framed[framed.len() - 1..]] {
        write_half.write_all(chunk).await.unwrap();
        write_half.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let inbound = next_inbound(&mut events).await;
    assert_eq!(inbound.device_id, "sysmex-1");
    assert_eq!(inbound.message.control_id(), Some("MSG001"));
    assert_eq!(inbound.lab_results.len(), 2);
    assert_eq!(inbound.lab_results[0].test_code.as_deref(), Some("GLU"));
    assert!(inbound.lab_results[0].is_abnormal());

    let ack = read_reply(&mut replies).await;
    let msa = ack.acknowledgment().unwrap();
    assert_eq!(msa.code, Some(AckCode::Accept));
    assert_eq!(msa.control_id.as_deref(), Some("MSG001"));
    // roles swapped
    assert_eq!(ack.header().unwrap().field(3), Some("LIS"));
    assert_eq!(ack.header().unwrap().field(5), Some("ANALYZER"));

    manager.shutdown().await;
}

#[tokio::test]
async fn pipelined_messages_are_acknowledged_in_order() {
    init_logging();
    let manager = ConnectionManager::new(EngineConfig::default());
    let addr = manager.start_server("sysmex-1", "127.0.0.1", 0).await.unwrap();

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut replies = FramedRead::new(read_half, MllpCodec::new());

    let both = format!("{}{}", codec::wrap(&oru("FIRST")), codec::wrap(&oru("SECOND")));
    write_half.write_all(both.as_bytes()).await.unwrap();

    for expected in &["FIRST", "SECOND"] {
        let ack = read_reply(&mut replies).await;
        assert_eq!(ack.correlation_id(), Some(*expected));
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn misplaced_header_is_rejected_and_the_connection_survives() {
    init_logging();
    let manager = ConnectionManager::new(EngineConfig::default());
    let mut events = manager.subscribe();
    let addr = manager.start_server("sysmex-1", "127.0.0.1", 0).await.unwrap();

    let mut transport = Framed::new(TcpStream::connect(addr).await.unwrap(), MllpCodec::new());
    let misplaced = format!("PID|1||12345\r{}", oru("LATE1"));
    transport.send(misplaced.as_str()).await.unwrap();

    let frame = timeout(WAIT, transport.next()).await.unwrap().unwrap().unwrap();
    let nack = parse(&String::from_utf8_lossy(&frame)).unwrap();
    let msa = nack.acknowledgment().unwrap();
    assert_eq!(msa.code, Some(AckCode::Reject));
    assert_eq!(msa.control_id.as_deref(), Some("LATE1"));

    let reported = loop {
        match timeout(WAIT, events.recv()).await {
            Ok(Ok(EngineEvent::Error(e))) => break e,
            Ok(Ok(EngineEvent::MessageReceived(m))) => panic!("Rejected message was published: {:?}", m),
            Ok(Ok(_)) => continue,
            other => panic!("Expected an error event, got {:?}", other),
        }
    };
    assert_eq!(reported.device_id, "sysmex-1");
    assert_eq!(reported.operation, "parse");

    transport.send(ORU).await.unwrap();
    let frame = timeout(WAIT, transport.next()).await.unwrap().unwrap().unwrap();
    let ack = parse(&String::from_utf8_lossy(&frame)).unwrap();
    assert!(ack.acknowledgment().unwrap().is_accept());

    manager.shutdown().await;
}

struct RefuseEverything;

#[async_trait]
impl MessageHandler for RefuseEverything {
    async fn handle(&self, _device_id: &str, _message: &Message) -> Result<(), String> {
        Err("Unknown sample".to_string())
    }
}

#[tokio::test]
async fn handler_failure_is_acknowledged_with_an_application_error() {
    init_logging();
    let manager = ConnectionManager::builder(EngineConfig::default())
        .handler(Arc::new(RefuseEverything))
        .build();
    let addr = manager.start_server("sysmex-1", "127.0.0.1", 0).await.unwrap();

    let mut transport = Framed::new(TcpStream::connect(addr).await.unwrap(), MllpCodec::new());
    transport.send(ORU).await.unwrap();

    let frame = timeout(WAIT, transport.next()).await.unwrap().unwrap().unwrap();
    let ack = parse(&String::from_utf8_lossy(&frame)).unwrap();
    let msa = ack.acknowledgment().unwrap();
    assert_eq!(msa.code, Some(AckCode::Error));
    assert_eq!(msa.text.as_deref(), Some("Unknown sample"));
    assert!(ack.segment("ERR").is_some());

    manager.shutdown().await;
}

#[tokio::test]
async fn incomplete_frame_waits_without_error() {
    init_logging();
    let manager = ConnectionManager::new(EngineConfig::default());
    let mut events = manager.subscribe();
    let addr = manager.start_server("sysmex-1", "127.0.0.1", 0).await.unwrap();

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut replies = FramedRead::new(read_half, MllpCodec::new());

    write_half.write_all(format!("\x0B{}", ORU).as_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = manager.get_status("sysmex-1").await;
    assert_eq!(status.status, ConnectionStatus::Connected);
    assert_eq!(status.active_connections(), 1);
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::Error(e) => panic!("Unexpected error event: {:?}", e),
            EngineEvent::MessageReceived(m) => panic!("Message decoded too early: {:?}", m),
            EngineEvent::StatusChanged(_) => {}
        }
    }

    write_half.write_all(b"\x1C\x0D").await.unwrap();
    let ack = read_reply(&mut replies).await;
    assert!(ack.acknowledgment().unwrap().is_accept());

    manager.shutdown().await;
}

#[tokio::test]
async fn worklist_is_matched_with_its_acknowledgment() {
    init_logging();
    let addr = analyzer(AckCode::Accept, None).await;
    let manager = ConnectionManager::new(EngineConfig::default());
    let connection = manager
        .connect_as_client("cobas-1", "127.0.0.1", addr.port(), WAIT)
        .await
        .unwrap();

    let mut request = WorklistRequest::new("12345", "S0001")
        .with_test(TestRequest::new("GLU", "Glucose"))
        .with_test(TestRequest::new("K", "Potassium"));
    request.control_id = Some("ORD0001".to_string());

    let response = manager.send_worklist(connection, &request).await.unwrap();
    assert_eq!(response.correlation_id(), Some("ORD0001"));
    assert!(!manager.is_awaiting(connection, "ORD0001").await);

    let info = manager.connection_info(connection).await.unwrap();
    assert!(info.last_sent_at.is_some());
    assert!(info.last_received_at.is_some());
    assert_eq!(info.pending, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn negative_acknowledgment_is_a_protocol_nack() {
    init_logging();
    let addr = analyzer(AckCode::Reject, Some("Sample unknown")).await;
    let manager = ConnectionManager::new(EngineConfig::default());
    let connection = manager
        .connect_as_client("cobas-1", "127.0.0.1", addr.port(), WAIT)
        .await
        .unwrap();

    let mut request = WorklistRequest::new("12345", "S0001").with_test(TestRequest::new("GLU", "Glucose"));
    request.control_id = Some("ORD0002".to_string());

    match manager.send_worklist(connection, &request).await {
        Err(Hl7Error::ProtocolNack { code, control_id, text }) => {
            assert_eq!(code, "AR");
            assert_eq!(control_id, "ORD0002");
            assert_eq!(text, "Sample unknown");
        }
        other => panic!("Expected a protocol NACK, got {:?}", other),
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn timeout_releases_the_waiter_and_keeps_the_connection() {
    init_logging();
    let addr = silent_analyzer().await;
    let manager = ConnectionManager::new(EngineConfig::default());
    let connection = manager
        .connect_as_client("cobas-1", "127.0.0.1", addr.port(), WAIT)
        .await
        .unwrap();

    match manager
        .send_and_await_response(connection, &oru("SLOW1"), Duration::from_millis(100))
        .await
    {
        Err(Hl7Error::CorrelationTimeout { control_id, .. }) => assert_eq!(control_id, "SLOW1"),
        other => panic!("Expected a correlation timeout, got {:?}", other),
    }

    assert!(!manager.is_awaiting(connection, "SLOW1").await);
    let info = manager.connection_info(connection).await.unwrap();
    assert_eq!(info.status, ConnectionStatus::Connected);

    // the same id is free to be used again
    match manager
        .send_and_await_response(connection, &oru("SLOW1"), Duration::from_millis(50))
        .await
    {
        Err(Hl7Error::CorrelationTimeout { .. }) => {}
        other => panic!("Expected a correlation timeout, got {:?}", other),
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn stalled_write_ends_at_the_response_deadline() {
    init_logging();
    let addr = deaf_analyzer().await;
    let manager = ConnectionManager::new(EngineConfig::default());
    let connection = manager
        .connect_as_client("cobas-1", "127.0.0.1", addr.port(), WAIT)
        .await
        .unwrap();

    let sent = timeout(
        WAIT,
        manager.send_and_await_response(connection, &oversized_oru("BIG1"), Duration::from_millis(300)),
    )
    .await
    .expect("send outlived its deadline");
    match sent {
        Err(Hl7Error::CorrelationTimeout { control_id, .. }) => assert_eq!(control_id, "BIG1"),
        other => panic!("Expected a correlation timeout, got {:?}", other),
    }

    // half a frame is on the wire, so the connection is gone
    assert!(!manager.is_awaiting(connection, "BIG1").await);
    assert!(manager.connection_info(connection).await.is_none());

    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_releases_a_blocked_send() {
    init_logging();
    let addr = deaf_analyzer().await;
    let manager = ConnectionManager::new(EngineConfig::default());
    let connection = manager
        .connect_as_client("cobas-1", "127.0.0.1", addr.port(), WAIT)
        .await
        .unwrap();

    let blocked = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .send_and_await_response(connection, &oversized_oru("BIG2"), Duration::from_secs(30))
                .await
        })
    };
    wait_until_awaiting(&manager, connection, "BIG2").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    manager.shutdown().await;

    match timeout(WAIT, blocked).await.expect("send ignored shutdown").unwrap() {
        Err(Hl7Error::Connection(_)) => {}
        other => panic!("Expected a connection error, got {:?}", other),
    }
}

async fn wait_until_awaiting(manager: &ConnectionManager, connection: hl7_mllp_engine::ConnectionId, control_id: &str) {
    for _ in 0..100 {
        if manager.is_awaiting(connection, control_id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never became pending", control_id);
}

#[tokio::test]
async fn duplicate_control_id_in_flight_is_rejected() {
    init_logging();
    let addr = silent_analyzer().await;
    let manager = ConnectionManager::new(EngineConfig::default());
    let connection = manager
        .connect_as_client("cobas-1", "127.0.0.1", addr.port(), WAIT)
        .await
        .unwrap();

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.send_and_await_response(connection, &oru("DUP1"), WAIT).await })
    };
    wait_until_awaiting(&manager, connection, "DUP1").await;

    match manager.send_and_await_response(connection, &oru("DUP1"), WAIT).await {
        Err(Hl7Error::DuplicateControlId(id)) => assert_eq!(id, "DUP1"),
        other => panic!("Expected a duplicate control id error, got {:?}", other),
    }
    // the first request is still waiting
    assert!(manager.is_awaiting(connection, "DUP1").await);

    manager.shutdown().await;
    assert!(first.await.unwrap().is_err());
}

#[tokio::test]
async fn shutdown_fails_pending_requests() {
    init_logging();
    let addr = silent_analyzer().await;
    let manager = ConnectionManager::new(EngineConfig::default());
    let connection = manager
        .connect_as_client("cobas-1", "127.0.0.1", addr.port(), WAIT)
        .await
        .unwrap();

    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.send_and_await_response(connection, &oru("WAIT1"), WAIT).await })
    };
    wait_until_awaiting(&manager, connection, "WAIT1").await;

    manager.shutdown().await;

    match timeout(WAIT, pending).await.unwrap().unwrap() {
        Err(Hl7Error::Connection(_)) => {}
        other => panic!("Expected a connection error, got {:?}", other),
    }
    assert!(manager.connection_info(connection).await.is_none());
    match manager.connect_as_client("cobas-1", "127.0.0.1", addr.port(), WAIT).await {
        Err(Hl7Error::Connection(_)) => {}
        other => panic!("Expected the manager to refuse new work, got {:?}", other),
    }
}

#[tokio::test]
async fn one_listener_per_device() {
    init_logging();
    let manager = ConnectionManager::new(EngineConfig::default());
    let addr = manager.start_server("sysmex-1", "127.0.0.1", 0).await.unwrap();

    match manager.start_server("sysmex-1", "127.0.0.1", 0).await {
        Err(Hl7Error::ListenerExists(device)) => assert_eq!(device, "sysmex-1"),
        other => panic!("Expected ListenerExists, got {:?}", other),
    }
    assert_eq!(manager.get_status("sysmex-1").await.listening_on, Some(addr));

    assert!(manager.stop_server("sysmex-1").await);
    assert!(!manager.stop_server("sysmex-1").await);
    assert!(!manager.get_status("sysmex-1").await.is_listening());

    manager.start_server("sysmex-1", "127.0.0.1", 0).await.unwrap();
    manager.shutdown().await;
}

#[tokio::test]
async fn stopping_a_server_closes_its_connections() {
    init_logging();
    let manager = ConnectionManager::new(EngineConfig::default());
    let mut events = manager.subscribe();
    let addr = manager.start_server("sysmex-1", "127.0.0.1", 0).await.unwrap();

    let mut transport = Framed::new(TcpStream::connect(addr).await.unwrap(), MllpCodec::new());
    transport.send(ORU).await.unwrap();
    next_inbound(&mut events).await;
    assert!(timeout(WAIT, transport.next()).await.unwrap().is_some());

    assert!(manager.stop_server("sysmex-1").await);
    assert!(manager.get_status("sysmex-1").await.connections.is_empty());

    // end of stream once the server side hangs up
    assert!(timeout(WAIT, transport.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    init_logging();
    let addr = silent_analyzer().await;
    let manager = ConnectionManager::new(EngineConfig::default());
    let connection = manager
        .connect_as_client("cobas-1", "127.0.0.1", addr.port(), WAIT)
        .await
        .unwrap();

    assert_eq!(manager.get_status("cobas-1").await.status, ConnectionStatus::Connected);
    assert!(manager.disconnect(connection).await);
    assert!(!manager.disconnect(connection).await);
    assert_eq!(manager.get_status("cobas-1").await.status, ConnectionStatus::Disconnected);

    match manager.send_and_await_response(connection, &oru("LATE1"), WAIT).await {
        Err(Hl7Error::Connection(_)) => {}
        other => panic!("Expected a connection error, got {:?}", other),
    }
}

#[tokio::test]
async fn refused_connections_are_reported() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let manager = ConnectionManager::new(EngineConfig::default());
    assert!(manager.test_connection("127.0.0.1", port, WAIT).await);
    drop(listener);
    assert!(!manager.test_connection("127.0.0.1", port, WAIT).await);

    let mut events = manager.subscribe();
    match manager.connect_as_client("cobas-1", "127.0.0.1", port, WAIT).await {
        Err(Hl7Error::Connection(_)) => {}
        other => panic!("Expected a connection error, got {:?}", other),
    }

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::StatusChanged(change) = event {
            statuses.push(change.status);
        }
    }
    assert_eq!(statuses, vec![ConnectionStatus::Connecting, ConnectionStatus::Error]);
}

#[tokio::test]
async fn registered_devices_start_in_their_role() {
    init_logging();
    let analyzer_addr = analyzer(AckCode::Accept, None).await;

    let mut registry = StaticDeviceRegistry::new();
    registry.insert(
        "sysmex-1",
        DeviceEndpoint {
            host: "127.0.0.1".to_string(),
            port: 0,
            role: DeviceRole::Server,
        },
    );
    registry.insert(
        "cobas-1",
        DeviceEndpoint {
            host: "127.0.0.1".to_string(),
            port: analyzer_addr.port(),
            role: DeviceRole::Client,
        },
    );
    let manager = ConnectionManager::builder(EngineConfig::default())
        .device_registry(Arc::new(registry))
        .build();

    match manager.start_device("sysmex-1").await.unwrap() {
        DeviceStarted::Listening(addr) => assert_ne!(addr.port(), 0),
        other => panic!("Expected a listener, got {:?}", other),
    }
    match manager.start_device("cobas-1").await.unwrap() {
        DeviceStarted::Connected(_) => {}
        other => panic!("Expected a connection, got {:?}", other),
    }
    match manager.connect_device("sysmex-1").await {
        Err(Hl7Error::Config(_)) => {}
        other => panic!("Expected a config error, got {:?}", other),
    }
    match manager.start_device("nope").await {
        Err(Hl7Error::UnknownDevice(id)) => assert_eq!(id, "nope"),
        other => panic!("Expected an unknown device error, got {:?}", other),
    }

    manager.shutdown().await;
}
