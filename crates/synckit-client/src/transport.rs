//! Transport interface and wire message model.
//!
//! The host supplies a message-oriented full-duplex channel with
//! at-least-once delivery (a WebSocket in practice). The core only sends
//! through the [`Transport`] trait; inbound messages and connection-state
//! changes are fed to the sync manager by the host.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use synckit_crdt::{DocumentData, Operation, VectorClock};

use crate::error::{Result, SyncError};

/// Connection lifecycle states reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Initial connection attempt in progress.
    Connecting,
    /// Channel is up.
    Connected,
    /// Channel dropped; the transport is retrying.
    Reconnecting,
    /// Channel is down.
    Disconnected,
    /// The transport gave up.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Wire message types. The core emits `subscribe`, `unsubscribe`,
/// `delta`, and `sync_request`; it consumes `sync_response`, `delta`,
/// `ack`, and `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Register interest in a document.
    Subscribe,
    /// Drop interest in a document.
    Unsubscribe,
    /// A single operation.
    Delta,
    /// Receipt confirmation for a delta.
    Ack,
    /// Ask for the current server state of a document.
    SyncRequest,
    /// Server state answer for subscribe / sync-request.
    SyncResponse,
    /// Server-reported failure.
    Error,
}

/// Envelope for every transport message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Typed payload, serialized.
    pub payload: Value,
    /// Wall-clock milliseconds at send.
    pub timestamp: u64,
}

impl TransportMessage {
    /// Build a message from a typed payload.
    pub fn new(kind: MessageKind, payload: &impl Serialize) -> Result<Self> {
        Ok(Self {
            kind,
            payload: serde_json::to_value(payload)?,
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
        })
    }

    /// Decode the payload as `T`.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Payload of `subscribe` and `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribePayload {
    /// Target document.
    pub document_id: String,
}

/// Payload of `delta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaPayload {
    /// Correlates the delta with its ACK.
    pub message_id: Uuid,
    /// The transmitted operation.
    pub operation: Operation,
}

/// Payload of `ack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Id of the acknowledged delta.
    pub message_id: Uuid,
}

/// Payload of `sync_request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequestPayload {
    /// Target document.
    pub document_id: String,
}

/// Payload of `sync_response`. An attached state is merged through the
/// document's CRDT merge, never applied wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponsePayload {
    /// Target document.
    pub document_id: String,
    /// Optional full CRDT state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<DocumentData>,
    /// Optional server-side clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<VectorClock>,
}

/// Payload of `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable reason.
    pub message: String,
    /// Affected document, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
}

/// Host-supplied outbound half of the bidirectional channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message. Fails when the channel is down.
    async fn send(&self, message: TransportMessage) -> Result<()>;

    /// Current connectivity.
    fn is_connected(&self) -> bool;
}

/// In-process transport backed by a channel. Sent messages arrive on the
/// paired receiver; connectivity is toggled by the test or host.
#[derive(Debug)]
pub struct ChannelTransport {
    connected: AtomicBool,
    outbound: mpsc::UnboundedSender<TransportMessage>,
}

impl ChannelTransport {
    /// Create a transport and the receiver observing everything sent
    /// through it.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                connected: AtomicBool::new(true),
                outbound: tx,
            }),
            rx,
        )
    }

    /// Toggle connectivity.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: TransportMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(SyncError::Transport("channel is disconnected".into()));
        }
        self.outbound
            .send(message)
            .map_err(|_| SyncError::Transport("receiver dropped".into()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_round_trip() {
        let payload = SubscribePayload {
            document_id: "doc-1".into(),
        };
        let msg = TransportMessage::new(MessageKind::Subscribe, &payload).unwrap();
        assert_eq!(msg.parse_payload::<SubscribePayload>().unwrap(), payload);

        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["type"], json!("subscribe"));
    }

    #[test]
    fn test_sync_response_optional_fields() {
        let minimal: SyncResponsePayload =
            serde_json::from_value(json!({ "document_id": "doc-1" })).unwrap();
        assert!(minimal.state.is_none());
        assert!(minimal.clock.is_none());
    }

    #[tokio::test]
    async fn test_channel_transport_records_sends() {
        let (transport, mut rx) = ChannelTransport::new();
        let msg = TransportMessage::new(
            MessageKind::SyncRequest,
            &SyncRequestPayload {
                document_id: "doc-1".into(),
            },
        )
        .unwrap();

        transport.send(msg.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_channel_transport_fails_when_disconnected() {
        let (transport, _rx) = ChannelTransport::new();
        transport.set_connected(false);
        assert!(!transport.is_connected());

        let msg = TransportMessage::new(
            MessageKind::SyncRequest,
            &SyncRequestPayload {
                document_id: "doc-1".into(),
            },
        )
        .unwrap();
        assert!(matches!(
            transport.send(msg).await,
            Err(SyncError::Transport(_))
        ));
    }
}
