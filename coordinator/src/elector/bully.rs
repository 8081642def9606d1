use std::{collections::HashSet, slice, sync::Arc, time::Duration};

use async_trait::async_trait;
use comm::{Communication, Host, MessageType, PeerId, Subscription};

use super::{by_priority, CoordinatorElector};
use crate::{BullyConfig, ElectionError};

/// Elects the highest-priority candidate that answers.
///
/// The peer pings every candidate ranked above itself. If none answers within
/// the ping window it takes over and announces itself with a select message.
/// Otherwise it asks the best responder to confirm with an election message
/// and follows it once it answers alive. Answers are produced by
/// [`serve_election_requests`], which has to run on every peer for as long as
/// the session lasts.
pub struct BullyElector {
    session_id: String,
    host: Arc<dyn Host>,
    communication: Arc<dyn Communication>,
    config: BullyConfig,
}

impl BullyElector {
    pub fn new(
        session_id: &str,
        host: Arc<dyn Host>,
        communication: Arc<dyn Communication>,
        config: BullyConfig,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            host,
            communication,
            config,
        }
    }

    fn subscribe(&self, message_type: MessageType) -> Subscription {
        Subscription::new(self.communication.clone(), &self.session_id, message_type)
    }

    /// Best-effort send; unreachable peers simply never answer.
    async fn send(&self, peers: &[PeerId], message_type: MessageType) {
        if let Err(err) = self
            .communication
            .broadcast(peers, Vec::new(), message_type, &self.session_id)
            .await
        {
            tracing::debug!(
                session_id = %self.session_id,
                ?message_type,
                error = %err,
                "election message not delivered"
            );
        }
    }

    async fn elect(
        &self,
        mut candidates: Vec<PeerId>,
        local: &PeerId,
    ) -> Result<PeerId, ElectionError> {
        let mut responses = self.subscribe(MessageType::CoordinatorPingResponse);
        let mut alive = self.subscribe(MessageType::CoordinatorAlive);
        loop {
            let higher = higher_priority(&candidates, local);
            let responsive = self.ping(&higher, &mut responses).await?;
            match higher.into_iter().find(|peer| responsive.contains(peer)) {
                Some(leader) => {
                    self.send(slice::from_ref(&leader), MessageType::CoordinatorElection)
                        .await;
                    if self.wait_for_alive(&leader, &mut alive).await? {
                        return Ok(leader);
                    }
                    tracing::debug!(session_id = %self.session_id, %leader, "candidate did not confirm");
                    candidates.retain(|peer| *peer != leader);
                }
                None if candidates.contains(local) => {
                    self.send(&candidates, MessageType::CoordinatorSelect).await;
                    return Ok(local.clone());
                }
                None => tracing::debug!(session_id = %self.session_id, "no candidate responded"),
            }
            if candidates.is_empty() {
                return Err(ElectionError::NoCandidates);
            }
            tokio::time::sleep(self.config.ping_back_off).await;
        }
    }

    /// Ping `peers` until the wait time is over or the first of them
    /// answered, returning the ones that answered.
    async fn ping(
        &self,
        peers: &[PeerId],
        responses: &mut Subscription,
    ) -> Result<HashSet<PeerId>, ElectionError> {
        let mut responsive = HashSet::new();
        let Some(best) = peers.first() else {
            return Ok(responsive);
        };

        let window = tokio::time::sleep(self.config.ping_wait_time);
        tokio::pin!(window);
        let mut ticker =
            tokio::time::interval(self.config.ping_interval.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = &mut window => return Ok(responsive),
                _ = ticker.tick() => {
                    let silent: Vec<PeerId> = peers
                        .iter()
                        .filter(|peer| !responsive.contains(*peer))
                        .cloned()
                        .collect();
                    self.send(&silent, MessageType::CoordinatorPing).await;
                }
                msg = responses.recv() => {
                    let msg = msg.ok_or(ElectionError::Closed)?;
                    if peers.contains(&msg.from) {
                        responsive.insert(msg.from);
                    }
                    if responsive.contains(best) {
                        return Ok(responsive);
                    }
                }
            }
        }
    }

    async fn wait_for_alive(
        &self,
        leader: &PeerId,
        alive: &mut Subscription,
    ) -> Result<bool, ElectionError> {
        let confirmation = async {
            loop {
                match alive.recv().await {
                    Some(msg) if msg.from == *leader => return Ok(()),
                    Some(_) => {}
                    None => return Err(ElectionError::Closed),
                }
            }
        };
        match tokio::time::timeout(self.config.election_wait_time, confirmation).await {
            Ok(confirmed) => confirmed.map(|()| true),
            Err(_) => Ok(false),
        }
    }
}

#[async_trait]
impl CoordinatorElector for BullyElector {
    async fn coordinator(&self, candidates: &[PeerId]) -> Result<PeerId, ElectionError> {
        let candidates = by_priority(candidates);
        if candidates.is_empty() {
            return Err(ElectionError::NoCandidates);
        }
        let local = self.host.id();

        let mut selects = self.subscribe(MessageType::CoordinatorSelect);
        let announced = wait_for_select(&mut selects, &candidates, &local);
        let election = self.elect(candidates.clone(), &local);
        let elected = tokio::time::timeout(self.config.bully_wait_time, async {
            tokio::select! {
                result = election => result,
                result = announced => result,
            }
        })
        .await
        .map_err(|_| ElectionError::Timeout(self.config.bully_wait_time))??;

        tracing::info!(session_id = %self.session_id, coordinator = %elected, "coordinator elected");
        Ok(elected)
    }
}

/// Candidates ranked above `local`; all of them if `local` is not one.
fn higher_priority(candidates: &[PeerId], local: &PeerId) -> Vec<PeerId> {
    if candidates.contains(local) {
        candidates
            .iter()
            .filter(|peer| *peer < local)
            .cloned()
            .collect()
    } else {
        candidates.to_vec()
    }
}

async fn wait_for_select(
    selects: &mut Subscription,
    candidates: &[PeerId],
    local: &PeerId,
) -> Result<PeerId, ElectionError> {
    let higher = higher_priority(candidates, local);
    loop {
        let msg = selects.recv().await.ok_or(ElectionError::Closed)?;
        if higher.contains(&msg.from) {
            return Ok(msg.from);
        }
        tracing::debug!(from = %msg.from, "ignoring select from lower priority peer");
    }
}

/// Answer pings and election requests of the session until the bus drops the
/// subscriptions.
pub async fn serve_election_requests(
    communication: Arc<dyn Communication>,
    session_id: &str,
) -> ElectionError {
    let mut pings = Subscription::new(communication.clone(), session_id, MessageType::CoordinatorPing);
    let mut elections = Subscription::new(
        communication.clone(),
        session_id,
        MessageType::CoordinatorElection,
    );
    loop {
        let (msg, reply) = tokio::select! {
            msg = pings.recv() => (msg, MessageType::CoordinatorPingResponse),
            msg = elections.recv() => (msg, MessageType::CoordinatorAlive),
        };
        let Some(msg) = msg else {
            return ElectionError::Closed;
        };
        tracing::trace!(%session_id, from = %msg.from, ?reply, "answering election request");
        if let Err(err) = communication
            .broadcast(slice::from_ref(&msg.from), Vec::new(), reply, session_id)
            .await
        {
            tracing::debug!(%session_id, error = %err, "failed to answer election request");
        }
    }
}
