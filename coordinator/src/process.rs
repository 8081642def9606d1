use async_trait::async_trait;
use comm::PeerId;
use tokio::sync::mpsc;

use crate::ProcessError;

/// Output of a finished process, e.g. a signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessResult {
    pub session_id: String,
    pub payload: Vec<u8>,
}

pub type ResultSender = mpsc::Sender<ProcessResult>;

/// A unit of cryptographic work (key generation, resharing, signing) driven
/// by the [`Coordinator`](crate::Coordinator).
#[async_trait]
pub trait Process: Send + Sync {
    /// Run the protocol until it completes. Exchanges its own messages on the
    /// bus; `params` are the bytes the coordinator produced with
    /// [`Process::start_params`].
    async fn run(
        &self,
        coordinator: bool,
        results: ResultSender,
        params: Vec<u8>,
    ) -> Result<(), ProcessError>;

    /// Release everything the process holds. Called once when the session
    /// ends, whichever way it ends.
    fn stop(&self);

    /// Whether the coordinator can start the session with `ready_peers`.
    fn ready(&self, ready_peers: &[PeerId], excluded_peers: &[PeerId])
        -> Result<bool, ProcessError>;

    /// Whether a failed attempt may be retried.
    fn retryable(&self) -> bool;

    fn start_params(&self, ready_peers: &[PeerId]) -> Vec<u8>;

    fn session_id(&self) -> &str;

    /// Peers allowed to coordinate the session.
    fn valid_coordinators(&self) -> Vec<PeerId>;
}

/// `peers` without the ones in `excluded`, keeping their order.
pub fn exclude_peers(peers: &[PeerId], excluded: &[PeerId]) -> Vec<PeerId> {
    peers
        .iter()
        .filter(|peer| !excluded.contains(peer))
        .cloned()
        .collect()
}

pub fn is_participant(peer: &PeerId, peers: &[PeerId]) -> bool {
    peers.contains(peer)
}
