//! In-process bus for running several peers inside one runtime.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    Communication, CommunicationError, MessageType, PeerId, SubscriptionId, Subscriptions,
    WrappedMessage,
};

type Inbox = mpsc::UnboundedSender<WrappedMessage>;

/// Registry of the peers currently reachable in memory.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inboxes: Arc<Mutex<HashMap<PeerId, Inbox>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `peer` to the network. Must be called within a tokio runtime.
    pub fn join(&self, peer: PeerId) -> MemoryCommunication {
        let (inbox, mut incoming) = mpsc::unbounded_channel::<WrappedMessage>();
        let subscriptions = Arc::new(Subscriptions::default());
        let dispatcher = tokio::spawn({
            let subscriptions = subscriptions.clone();
            async move {
                while let Some(msg) = incoming.recv().await {
                    subscriptions.dispatch(msg).await;
                }
            }
        });
        self.inboxes.lock().insert(peer.clone(), inbox.clone());
        MemoryCommunication {
            id: peer,
            network: self.clone(),
            inbox,
            subscriptions,
            dispatcher,
        }
    }

    /// Take `peer` offline; broadcasts to it fail until it joins again.
    pub fn leave(&self, peer: &PeerId) {
        self.inboxes.lock().remove(peer);
    }
}

pub struct MemoryCommunication {
    id: PeerId,
    network: MemoryNetwork,
    inbox: Inbox,
    subscriptions: Arc<Subscriptions>,
    dispatcher: JoinHandle<()>,
}

impl MemoryCommunication {
    pub fn id(&self) -> &PeerId {
        &self.id
    }
}

impl Drop for MemoryCommunication {
    fn drop(&mut self) {
        let mut inboxes = self.network.inboxes.lock();
        // The peer may have joined again with a new inbox.
        if inboxes
            .get(&self.id)
            .is_some_and(|inbox| inbox.same_channel(&self.inbox))
        {
            inboxes.remove(&self.id);
        }
        self.dispatcher.abort();
    }
}

#[async_trait]
impl Communication for MemoryCommunication {
    async fn broadcast(
        &self,
        peers: &[PeerId],
        payload: Vec<u8>,
        message_type: MessageType,
        session_id: &str,
    ) -> Result<(), CommunicationError> {
        let mut msg = WrappedMessage::new(message_type, session_id, payload);
        msg.from = self.id.clone();

        let inboxes = self.network.inboxes.lock();
        let mut first_error = None;
        for peer in peers.iter().filter(|peer| **peer != self.id) {
            let delivered = inboxes
                .get(peer)
                .is_some_and(|inbox| inbox.send(msg.clone()).is_ok());
            if !delivered {
                first_error.get_or_insert_with(|| {
                    CommunicationError::new(peer.clone(), "peer is not connected")
                });
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn subscribe(
        &self,
        session_id: &str,
        message_type: MessageType,
        sink: mpsc::Sender<WrappedMessage>,
    ) -> SubscriptionId {
        self.subscriptions.subscribe(session_id, message_type, sink)
    }

    fn unsubscribe(&self, id: &SubscriptionId) {
        self.subscriptions.unsubscribe(id)
    }

    fn close_session(&self, session_id: &str) {
        self.subscriptions.close_session(session_id)
    }
}
