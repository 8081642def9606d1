use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{Communication, MessageType, SubscriptionId, WrappedMessage};

/// Buffer size of the sink created by [`Subscription::new`].
pub const SUBSCRIPTION_CAPACITY: usize = 64;

type Sinks = HashMap<Uuid, mpsc::Sender<WrappedMessage>>;

/// Subscription registry shared by the transports.
#[derive(Default)]
pub struct Subscriptions {
    sinks: Mutex<HashMap<(String, MessageType), Sinks>>,
}

impl Subscriptions {
    pub fn subscribe(
        &self,
        session_id: &str,
        message_type: MessageType,
        sink: mpsc::Sender<WrappedMessage>,
    ) -> SubscriptionId {
        let id = SubscriptionId::new(session_id, message_type);
        self.sinks
            .lock()
            .entry((session_id.to_string(), message_type))
            .or_default()
            .insert(id.uuid(), sink);
        tracing::trace!(subscription = %id, "subscribed");
        id
    }

    pub fn unsubscribe(&self, id: &SubscriptionId) {
        let key = (id.session_id().to_string(), id.message_type());
        let mut sinks = self.sinks.lock();
        if let Some(entry) = sinks.get_mut(&key) {
            entry.remove(&id.uuid());
            if entry.is_empty() {
                sinks.remove(&key);
            }
        }
    }

    pub fn close_session(&self, session_id: &str) {
        self.sinks.lock().retain(|(session, _), _| session != session_id);
    }

    /// Deliver `msg` to every subscriber of its (session, type) pair. The
    /// order between subscribers is unspecified. Messages nobody subscribed
    /// to are dropped.
    pub async fn dispatch(&self, msg: WrappedMessage) {
        let sinks: Vec<_> = self
            .sinks
            .lock()
            .get(&(msg.session_id.clone(), msg.message_type))
            .map(|sinks| sinks.values().cloned().collect())
            .unwrap_or_default();
        if sinks.is_empty() {
            tracing::trace!(
                session_id = %msg.session_id,
                message_type = ?msg.message_type,
                from = %msg.from,
                "dropping message without subscriber"
            );
            return;
        }
        for sink in sinks {
            // A closed sink belongs to a subscriber that went away without
            // unsubscribing.
            let _ = sink.send(msg.clone()).await;
        }
    }
}

/// A subscription that is removed from the bus when dropped.
pub struct Subscription {
    communication: Arc<dyn Communication>,
    id: SubscriptionId,
    receiver: mpsc::Receiver<WrappedMessage>,
}

impl Subscription {
    pub fn new(
        communication: Arc<dyn Communication>,
        session_id: &str,
        message_type: MessageType,
    ) -> Self {
        let (sink, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let id = communication.subscribe(session_id, message_type, sink);
        Self {
            communication,
            id,
            receiver,
        }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Receive the next message. Returns `None` once the bus dropped the
    /// subscription, e.g. because the session was closed.
    pub async fn recv(&mut self) -> Option<WrappedMessage> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.communication.unsubscribe(&self.id);
    }
}
