//! Bus plumbing for the round messages a [`Process`](crate::Process)
//! exchanges once the session started.

use std::sync::Arc;

use comm::{Communication, MessageType, PeerId, Subscription};

use crate::{message::TssMessage, ProcessError};

/// Round messages of one session, scoped to the peers taking part in it.
///
/// The subscription is opened on construction, so create the channel before
/// the session can start to not miss early messages.
pub struct RoundChannel {
    communication: Arc<dyn Communication>,
    session_id: String,
    message_type: MessageType,
    peers: Vec<PeerId>,
    subscription: Subscription,
}

impl RoundChannel {
    pub fn new(
        communication: Arc<dyn Communication>,
        session_id: &str,
        message_type: MessageType,
        peers: Vec<PeerId>,
    ) -> Self {
        let subscription = Subscription::new(communication.clone(), session_id, message_type);
        Self {
            communication,
            session_id: session_id.to_string(),
            message_type,
            peers,
            subscription,
        }
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.peers
    }

    /// Send `msg_bytes` to `to`, or to every peer of the round when `to` is
    /// `None`.
    pub async fn send(
        &self,
        msg_bytes: Vec<u8>,
        to: Option<&[PeerId]>,
    ) -> Result<(), ProcessError> {
        let msg = TssMessage::new(msg_bytes, to.is_none());
        let payload = msg
            .to_bytes()
            .map_err(|err| ProcessError::Other(err.to_string()))?;
        let recipients = to.unwrap_or(&self.peers);
        self.communication
            .broadcast(recipients, payload, self.message_type, &self.session_id)
            .await?;
        Ok(())
    }

    /// Receive the next round message with its authenticated sender.
    ///
    /// Messages from peers outside the round are dropped. A message that
    /// does not decode blames its sender.
    pub async fn recv(&mut self) -> Result<(PeerId, TssMessage), ProcessError> {
        loop {
            let msg = self
                .subscription
                .recv()
                .await
                .ok_or_else(|| ProcessError::Other("session closed".to_string()))?;
            if !self.peers.contains(&msg.from) {
                tracing::debug!(
                    session_id = %self.session_id,
                    from = %msg.from,
                    "dropping round message from outside the round"
                );
                continue;
            }
            return match TssMessage::from_bytes(&msg.payload) {
                Ok(tss) => Ok((msg.from, tss)),
                Err(err) => Err(ProcessError::Culprits {
                    culprits: vec![msg.from],
                    reason: format!("invalid round message: {err}"),
                }),
            };
        }
    }
}
