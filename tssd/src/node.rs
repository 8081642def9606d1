use std::{error::Error, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use comm::{
    health::execute_comm_health_check, p2p::P2pCommunication, Communication, CommunicationError,
    Host, PeerId,
};
use coordinator::{BullyConfig, Coordinator, CoordinatorConfig, ElectorFactory};
use tokio::time::MissedTickBehavior;

use crate::config::Config;

/// Receives the outcome of every periodic health check.
pub trait PeerStatusTracker: Send + Sync {
    fn track_peer_status(&self, unavailable: &[PeerId], all: &[PeerId]);
}

/// A running node: the peer-to-peer bus plus the coordinator that sessions
/// are executed on.
pub struct Node {
    communication: Arc<P2pCommunication>,
    coordinator: Coordinator,
    health_check_interval: Duration,
    status: Option<Arc<dyn PeerStatusTracker>>,
}

impl Node {
    /// Start listening for peers as configured.
    pub async fn start(config: &Config) -> Result<Self, Box<dyn Error>> {
        config.validate()?;
        let host = Arc::new(config.network_host()?);
        let communication = Arc::new(
            P2pCommunication::listen(host.clone(), config.listen_addr, &config.protocol).await?,
        );

        let dyn_host: Arc<dyn Host> = host;
        let dyn_communication: Arc<dyn Communication> = communication.clone();
        let electors = ElectorFactory::new(
            dyn_host.clone(),
            dyn_communication.clone(),
            BullyConfig::from(&config.bully),
        );
        let coordinator = Coordinator::new(dyn_host, dyn_communication, electors)
            .with_config(CoordinatorConfig::from(&config.coordinator));

        Ok(Self {
            communication,
            coordinator,
            health_check_interval: config.health_check_interval(),
            status: None,
        })
    }

    /// Report the result of every health check to `status`.
    pub fn with_status_tracker(mut self, status: Arc<dyn PeerStatusTracker>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn id(&self) -> PeerId {
        self.communication.host().id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.communication.local_addr()
    }

    pub fn communication(&self) -> &Arc<P2pCommunication> {
        &self.communication
    }

    /// The coordinator embedding applications execute their processes on,
    /// wired to this node's bus and configured timeouts.
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Check every known peer once, logging the unreachable ones and
    /// reporting them to the status tracker.
    pub async fn check_peers(&self) -> Vec<CommunicationError> {
        let peers = self.communication.host().peers();
        let unavailable = execute_comm_health_check(self.communication.as_ref(), &peers).await;
        for err in &unavailable {
            tracing::warn!(peer = %err.peer, reason = %err.reason, "peer unavailable");
        }
        if let Some(status) = &self.status {
            let ids: Vec<PeerId> = unavailable.iter().map(|err| err.peer.clone()).collect();
            status.track_peer_status(&ids, &peers);
        }
        tracing::debug!(
            peers = peers.len(),
            unavailable = unavailable.len(),
            "health check done"
        );
        unavailable
    }

    /// Run the periodic health check until `shutdown` resolves.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.check_peers().await;
                }
            }
        }
        tracing::info!(peer = %self.id(), "node stopped");
    }
}

/// Run the node configured in `config` until interrupted.
pub async fn run(config: Option<String>) -> Result<(), Box<dyn Error>> {
    let config = Config::read(config)?;
    let node = Node::start(&config).await?;
    tracing::info!(
        peer = %node.id(),
        addr = %node.local_addr(),
        peers = config.peer.len(),
        "node running"
    );
    node.run_until(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
        }
    })
    .await;
    Ok(())
}
