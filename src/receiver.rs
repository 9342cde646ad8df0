//! A single well-known port that any analyzer can push unsolicited results to.
//!
//! Unlike the [`ConnectionManager`](crate::ConnectionManager) there is no device
//! bookkeeping here: every accepted socket runs the same framing loop, results from
//! ORU messages go to a [`ResultSink`] and everything is acknowledged.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::builder::{build_ack, build_nack};
use crate::codec::MllpCodec;
use crate::config::{EngineConfig, ReceiverConfig};
use crate::error::{Hl7Error, Result};
use crate::message::AckCode;
use crate::parser::parse;
use crate::results::LabResult;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Why a [`ResultSink`] couldn't take a batch of results. The text goes back to the
/// analyzer in the `AE` acknowledgment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SinkError(pub String);

impl SinkError {
    pub fn new(reason: impl Into<String>) -> Self {
        SinkError(reason.into())
    }
}

/// Where received lab results end up, typically the host application's database.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn accept(&self, results: Vec<LabResult>, raw: &str) -> std::result::Result<(), SinkError>;
}

pub struct ReceiverService {
    listener: TcpListener,
    sink: Arc<dyn ResultSink>,
    max_frame_len: usize,
}

impl ReceiverService {
    /// Binds the receiver port. Port `0` picks an ephemeral one, see
    /// [`local_addr`](Self::local_addr).
    pub async fn bind(
        config: &ReceiverConfig,
        max_frame_len: usize,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((config.bind_address, config.port))
            .await
            .map_err(|e| {
                Hl7Error::connection(format!(
                    "binding receiver to {}:{} failed: {}",
                    config.bind_address, config.port, e
                ))
            })?;
        info!("HL7 receiver listening on {}", listener.local_addr()?);
        Ok(ReceiverService {
            listener,
            sink,
            max_frame_len,
        })
    }

    pub async fn from_config(config: &EngineConfig, sink: Arc<dyn ResultSink>) -> Result<Self> {
        Self::bind(&config.receiver, config.max_frame_len, sink).await
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` is cancelled. Open connections are told to
    /// stop through the same token.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("Receiver connection opened from {}", peer);
                        let sink = self.sink.clone();
                        let codec = MllpCodec::with_max_frame_len(self.max_frame_len);
                        let cancel = shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = process(stream, codec, sink, cancel).await {
                                warn!("Receiver connection from {} failed: {}", peer, e);
                            }
                            info!("Receiver connection from {} closed", peer);
                        });
                    }
                    Err(e) => {
                        error!("Error accepting receiver connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
        info!("HL7 receiver stopped");
    }
}

async fn process(
    stream: TcpStream,
    codec: MllpCodec,
    sink: Arc<dyn ResultSink>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut transport = Framed::new(stream, codec);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = transport.next() => frame,
        };
        let frame = match frame {
            Some(frame) => frame?,
            None => return Ok(()),
        };

        let raw = String::from_utf8_lossy(&frame).into_owned();
        let reply = handle_message(&raw, sink.as_ref()).await;
        // because this goes through the codec it gets wrapped in the MLLP envelope for us
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            sent = transport.send(reply.as_str()) => sent?,
        }
    }
}

/// Works out the acknowledgment for one received message, forwarding any results on
/// the way. Never fails: problems become `AE` replies.
async fn handle_message(raw: &str, sink: &dyn ResultSink) -> String {
    let message = match parse(raw) {
        Ok(message) => message,
        Err(e) => {
            warn!("Receiver got an unparseable message: {}", e);
            return build_nack(raw, AckCode::Error, &e.to_string());
        }
    };
    info!("Receiver got {}", message);

    let outcome = if message.is_type("ORU") {
        let results: Vec<LabResult> = message.lab_results().collect();
        debug!("Forwarding {} results from {}", results.len(), message);
        sink.accept(results, raw).await
    } else {
        Ok(())
    };

    let ack = match &outcome {
        Ok(()) => build_ack(&message, AckCode::Accept, Some("Message accepted")),
        Err(e) => {
            warn!("Result sink refused {}: {}", message, e);
            build_ack(&message, AckCode::Error, Some(e.0.as_str()))
        }
    };
    ack.unwrap_or_else(|e| build_nack(raw, AckCode::Error, &e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const ORU: &str = "MSH|^~\\&|ANALYZER|LAB|LIS|HOSP|20240101120000||ORU^R01|MSG001|P|2.5\rPID|1||12345^^^MRN||DOE^JOHN\rOBR|1||S1|CBC^Blood count\rOBX|1|NM|GLU^Glucose^LN||5.6|mmol/L|3.9-5.5|H|||F";

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<LabResult>>>,
        refuse: Option<String>,
    }

    #[async_trait]
    impl ResultSink for RecordingSink {
        async fn accept(&self, results: Vec<LabResult>, _raw: &str) -> std::result::Result<(), SinkError> {
            if let Some(reason) = &self.refuse {
                return Err(SinkError::new(reason.clone()));
            }
            self.batches.lock().unwrap().push(results);
            Ok(())
        }
    }

    #[tokio::test]
    async fn oru_results_reach_the_sink() {
        let sink = RecordingSink::default();
        let reply = parse(&handle_message(ORU, &sink).await).unwrap();

        let ack = reply.acknowledgment().unwrap();
        assert_eq!(ack.code, Some(AckCode::Accept));
        assert_eq!(ack.control_id.as_deref(), Some("MSG001"));
        assert_eq!(ack.text.as_deref(), Some("Message accepted"));

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].test_code.as_deref(), Some("GLU"));
    }

    #[tokio::test]
    async fn sink_failure_is_an_application_error() {
        let sink = RecordingSink {
            refuse: Some("database unavailable".into()),
            ..Default::default()
        };
        let reply = parse(&handle_message(ORU, &sink).await).unwrap();

        let ack = reply.acknowledgment().unwrap();
        assert_eq!(ack.code, Some(AckCode::Error));
        assert_eq!(ack.text.as_deref(), Some("database unavailable"));
    }

    #[tokio::test]
    async fn other_message_types_are_acknowledged_without_the_sink() {
        let sink = RecordingSink::default();
        let adt = "MSH|^~\\&|A|B|C|D|20240101||ADT^A04|ADT9|P|2.5\rPID|1||9";
        let reply = parse(&handle_message(adt, &sink).await).unwrap();

        assert!(reply.acknowledgment().unwrap().is_accept());
        assert!(sink.batches.lock().unwrap().is_empty());
    }
}
