use async_trait::async_trait;
use comm::PeerId;

use super::CoordinatorElector;
use crate::ElectionError;

/// Picks the highest-priority candidate without talking to anyone, so every
/// peer given the same candidates agrees on the result.
#[derive(Clone, Copy, Debug, Default)]
pub struct StaticElector;

#[async_trait]
impl CoordinatorElector for StaticElector {
    async fn coordinator(&self, candidates: &[PeerId]) -> Result<PeerId, ElectionError> {
        candidates
            .iter()
            .min()
            .cloned()
            .ok_or(ElectionError::NoCandidates)
    }
}
