//! Coordinator election.
//!
//! Candidates are ranked by peer id: the lowest id has the highest priority.
//! The static elector picks the top candidate outright; the bully elector
//! picks the top candidate that is still responsive.

mod bully;
mod static_elector;

use std::sync::Arc;

use async_trait::async_trait;
use comm::{Communication, Host, PeerId};

pub use bully::{serve_election_requests, BullyElector};
pub use static_elector::StaticElector;

use crate::{BullyConfig, ElectionError};

#[async_trait]
pub trait CoordinatorElector: Send + Sync {
    /// Pick the coordinator among `candidates`. Dropping the returned future
    /// cancels the election.
    async fn coordinator(&self, candidates: &[PeerId]) -> Result<PeerId, ElectionError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElectorKind {
    Static,
    Bully,
}

/// Builds electors bound to a session.
#[derive(Clone)]
pub struct ElectorFactory {
    host: Arc<dyn Host>,
    communication: Arc<dyn Communication>,
    config: BullyConfig,
}

impl ElectorFactory {
    pub fn new(
        host: Arc<dyn Host>,
        communication: Arc<dyn Communication>,
        config: BullyConfig,
    ) -> Self {
        Self {
            host,
            communication,
            config,
        }
    }

    pub fn elector(&self, session_id: &str, kind: ElectorKind) -> Box<dyn CoordinatorElector> {
        match kind {
            ElectorKind::Static => Box::new(StaticElector),
            ElectorKind::Bully => Box::new(BullyElector::new(
                session_id,
                self.host.clone(),
                self.communication.clone(),
                self.config.clone(),
            )),
        }
    }
}

/// `candidates` sorted from the highest to the lowest priority, without
/// duplicates.
pub(crate) fn by_priority(candidates: &[PeerId]) -> Vec<PeerId> {
    let mut sorted = candidates.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}
