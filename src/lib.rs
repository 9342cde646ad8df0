/*!
# An HL7 v2.x messaging engine for laboratory analyzers, speaking MLLP over TCP.

 HL7's MLLP is a simple, single-byte-text based protocol for framing HL7 messages over a TCP (or similar) transport.
 The full standard is available at [the HL7 site](https://www.hl7.org/documentcenter/private/standards/v3/V3_TRMLLP_R2_R2019.zip) (Note that they place the standards behind a free membership/login form).

 This crate grew out of a [Codec](https://docs.rs/tokio-util/latest/tokio_util/codec/index.html) implementation
 that encodes/decodes MLLP frames from a Tokio stream. That codec is still here as [`MllpCodec`], and on top of it sit:

 - a message model and parser ([`parse`], [`Message`]) with typed projections of lab results and orders,
 - builders for acknowledgments and ORM^O01 worklist orders ([`build_ack`], [`build_order`]),
 - a [`ConnectionManager`] that listens for analyzers and connects out to them at the same time, correlating
   replies with the requests that caused them,
 - a [`ReceiverService`] that takes unsolicited results on one well-known port and hands them to a [`ResultSink`].

 Logging goes through the `log` facade; nothing here installs a logger.

 ## Example
 Pushing a worklist to an analyzer that listens for us:

 ```no_run
use std::time::Duration;

use hl7_mllp_engine::{ConnectionManager, EngineConfig, TestRequest, WorklistRequest};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let manager = ConnectionManager::new(EngineConfig::default());

    let connection = manager
        .connect_as_client("cobas-1", "127.0.0.1", 5100, Duration::from_secs(5))
        .await?;

    let request = WorklistRequest::new("12345", "S0001")
        .with_test(TestRequest::new("GLU", "Glucose"));

    // wrapped in the MLLP envelope on the way out, answered with an ACK we wait for
    let ack = manager.send_worklist(connection, &request).await?;
    println!("  Analyzer accepted the order: {}", ack);

    manager.shutdown().await;
    Ok(())
}
```

 ### Codec
 The codec still works standalone with any tokio `Framed` transport:

 ```no_run
use bytes::*;
use tokio_util::codec::Framed;
use tokio::net::TcpStream;
use futures::{SinkExt, StreamExt};

use hl7_mllp_engine::MllpCodec;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let stream = TcpStream::connect("127.0.0.1:8080").await?;
    let mut transport = Framed::new(stream, MllpCodec::new());

    transport.send(BytesMut::from("MSH|^~\\&|LIS|LAB|||20240101||ADT^A04|1|P|2.5")).await?;

    if let Some(response) = transport.next().await {
        match response {
            Ok(msg) => println!("  Received response: {:?}", msg),
            Err(e) => println!("  ERROR: {:?}", e),
        }
    }

    Ok(())
}
```

 # Pipelining
 Decoding always stops at the first end block in the buffer, so a publisher that doesn't wait for an ACK before sending
 the next message still has every message decoded, one at a time, in order.
 */

pub mod builder;
pub mod codec;
pub mod config;
pub mod connection;
pub mod datetime;
pub mod error;
pub mod events;
pub mod manager;
pub mod message;
pub mod parser;
pub mod receiver;
pub mod results;

pub use builder::{build_ack, build_nack, build_order, new_control_id, TestRequest, WorklistRequest};
pub use codec::{MllpCodec, DEFAULT_MAX_FRAME_LEN};
pub use config::{
    DeviceConfig, DeviceEndpoint, DeviceRegistry, DeviceRole, EngineConfig, ReceiverConfig,
    StaticDeviceRegistry,
};
pub use connection::{ConnectionId, ConnectionInfo, ConnectionRole, ConnectionStatus};
pub use error::{Hl7Error, Result};
pub use events::{EngineEvent, ErrorEvent, InboundMessage, StatusChange};
pub use manager::{ConnectionManager, ConnectionManagerBuilder, DeviceStarted, DeviceStatus, MessageHandler};
pub use message::{AckCode, Acknowledgment, Delimiters, Field, Message, Segment};
pub use parser::parse;
pub use receiver::{ReceiverService, ResultSink, SinkError};
pub use results::{LabResult, Order, PatientContext};
