//! Typed, session-scoped publish/subscribe messaging between peers.
//!
//! A [`Communication`] delivers [`WrappedMessage`]s to the local subscribers
//! registered for a (session id, [`MessageType`]) pair. Two implementations
//! are provided: [`p2p::P2pCommunication`], which runs over Noise-encrypted
//! TCP links, and [`memory::MemoryCommunication`], an in-process bus used to
//! run several peers inside one test.

pub mod health;
pub mod host;
pub mod memory;
pub mod noise;
pub mod p2p;
mod subscription;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use host::{Host, StaticHost};
pub use subscription::{Subscription, Subscriptions, SUBSCRIPTION_CAPACITY};

/// Identity of a network participant.
///
/// For the p2p transport this is the lowercase hex encoding of the peer's
/// Noise static public key, so it can be checked against the key the peer
/// proved during the handshake.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the peer id of the holder of the given static public key.
    pub fn from_public_key(key: &[u8]) -> Self {
        Self(hex::encode(key))
    }

    /// Decode the public key this id was derived from.
    pub fn public_key(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerId").field(&self.0).finish()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The kind of a message carried on the bus.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Round message of a key generation process.
    TssKeyGen,
    /// Round message of a signing process.
    TssKeySign,
    /// Round message of a resharing process.
    TssReshare,
    /// Coordinator announces a session and asks peers for readiness.
    TssInitiate,
    /// Participant tells the coordinator it is ready.
    TssReady,
    /// Coordinator starts the session; carries the start parameters.
    TssStart,
    /// Coordinator aborts the session.
    TssFail,
    CoordinatorElection,
    CoordinatorAlive,
    CoordinatorSelect,
    CoordinatorPing,
    CoordinatorPingResponse,
    /// Used by health checks; nothing subscribes to it.
    Unknown,
}

/// Envelope of one bus delivery.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WrappedMessage {
    pub message_type: MessageType,
    pub session_id: String,
    #[serde(
        serialize_with = "serdect::slice::serialize_hex_lower_or_bin",
        deserialize_with = "serdect::slice::deserialize_hex_or_bin_vec"
    )]
    pub payload: Vec<u8>,
    /// The sender, as authenticated by the transport. Never read from the
    /// wire.
    #[serde(skip)]
    pub from: PeerId,
}

impl WrappedMessage {
    pub fn new(message_type: MessageType, session_id: &str, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            session_id: session_id.to_string(),
            payload,
            from: PeerId::default(),
        }
    }
}

/// Handle of a live subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    session_id: String,
    message_type: MessageType,
    id: Uuid,
}

impl SubscriptionId {
    pub fn new(session_id: &str, message_type: MessageType) -> Self {
        Self {
            session_id: session_id.to_string(),
            message_type,
            id: Uuid::new_v4(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub(crate) fn uuid(&self) -> Uuid {
        self.id
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:?}-{}", self.session_id, self.message_type, self.id)
    }
}

/// A peer could not be reached.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("failed communicating with peer {peer}: {reason}")]
pub struct CommunicationError {
    pub peer: PeerId,
    pub reason: String,
}

impl CommunicationError {
    pub fn new(peer: PeerId, reason: impl ToString) -> Self {
        Self {
            peer,
            reason: reason.to_string(),
        }
    }
}

/// A message bus between peers.
///
/// Delivery applies back-pressure: a subscriber that stops reading its sink
/// stalls the links feeding it, so subscribers either keep draining or
/// unsubscribe.
#[async_trait]
pub trait Communication: Send + Sync {
    /// Send the payload to every peer in `peers`, skipping the local peer.
    ///
    /// Every peer is attempted; the error names the first one that could not
    /// be reached. Successful deliveries are not rolled back.
    async fn broadcast(
        &self,
        peers: &[PeerId],
        payload: Vec<u8>,
        message_type: MessageType,
        session_id: &str,
    ) -> Result<(), CommunicationError>;

    /// Register `sink` for messages of the given type and session.
    ///
    /// Messages that arrive before the subscription exists are not replayed.
    /// Overlapping subscriptions on the same pair each receive a copy.
    fn subscribe(
        &self,
        session_id: &str,
        message_type: MessageType,
        sink: mpsc::Sender<WrappedMessage>,
    ) -> SubscriptionId;

    /// Remove a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: &SubscriptionId);

    /// Drop every subscription left on the session.
    fn close_session(&self, session_id: &str);
}
