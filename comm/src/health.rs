use futures::future::join_all;

use crate::{Communication, CommunicationError, MessageType, PeerId};

/// Session id used by health check messages.
pub const HEALTH_SESSION_ID: &str = "health";

/// Send an empty message to each peer on its own and collect the peers that
/// could not be reached.
pub async fn execute_comm_health_check(
    communication: &dyn Communication,
    peers: &[PeerId],
) -> Vec<CommunicationError> {
    let checks = peers.iter().map(|peer| {
        communication.broadcast(
            std::slice::from_ref(peer),
            Vec::new(),
            MessageType::Unknown,
            HEALTH_SESSION_ID,
        )
    });
    join_all(checks)
        .await
        .into_iter()
        .filter_map(Result::err)
        .collect()
}
