use crate::PeerId;

/// The local node as seen by the coordination layer.
pub trait Host: Send + Sync {
    /// The local peer id.
    fn id(&self) -> PeerId;

    /// Every known peer, excluding the local one.
    fn peers(&self) -> Vec<PeerId>;
}

/// A host with a fixed peer set.
#[derive(Clone, Debug)]
pub struct StaticHost {
    id: PeerId,
    peers: Vec<PeerId>,
}

impl StaticHost {
    /// `peers` may include `id`; it is filtered out.
    pub fn new(id: PeerId, peers: Vec<PeerId>) -> Self {
        let peers = peers.into_iter().filter(|p| *p != id).collect();
        Self { id, peers }
    }
}

impl Host for StaticHost {
    fn id(&self) -> PeerId {
        self.id.clone()
    }

    fn peers(&self) -> Vec<PeerId> {
        self.peers.clone()
    }
}
