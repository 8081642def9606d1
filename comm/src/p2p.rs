//! Bus implementation over Noise-encrypted TCP links.
//!
//! Links are one-directional. A peer dials each target once and keeps the
//! connection for sending; everything it receives arrives on connections the
//! other peers dialled. The plaintext of a link is a sequence of
//! newline-terminated JSON [`WrappedMessage`]s.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use snow::TransportState;
use tokio::{
    io::AsyncRead,
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};

use crate::{
    noise::{self, Keypair, MAX_MSG_SIZE},
    Communication, CommunicationError, Host, MessageType, PeerId, SubscriptionId, Subscriptions,
    WrappedMessage,
};

/// How long dialing and handshaking with a peer may take.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for a single envelope; larger ones close the link.
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

/// The local node: its static key and the addresses of known peers.
pub struct NetworkHost {
    keypair: Keypair,
    id: PeerId,
    peerstore: RwLock<BTreeMap<PeerId, SocketAddr>>,
}

impl NetworkHost {
    pub fn new(keypair: Keypair) -> Self {
        let id = keypair.peer_id();
        Self {
            keypair,
            id,
            peerstore: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn add_peer(&self, peer: PeerId, address: SocketAddr) {
        self.peerstore.write().insert(peer, address);
    }

    pub fn address(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.peerstore.read().get(peer).copied()
    }

    pub fn is_known(&self, peer: &PeerId) -> bool {
        self.peerstore.read().contains_key(peer)
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl Host for NetworkHost {
    fn id(&self) -> PeerId {
        self.id.clone()
    }

    fn peers(&self) -> Vec<PeerId> {
        self.peerstore
            .read()
            .keys()
            .filter(|p| **p != self.id)
            .cloned()
            .collect()
    }
}

struct Outbound {
    stream: TcpStream,
    transport: TransportState,
}

impl Outbound {
    async fn send(&mut self, line: &[u8]) -> Result<(), noise::Error> {
        noise::write_encrypted(&mut self.stream, &mut self.transport, line).await
    }
}

type OutboundSlot = Arc<tokio::sync::Mutex<Option<Outbound>>>;

pub struct P2pCommunication {
    host: Arc<NetworkHost>,
    protocol: Arc<str>,
    subscriptions: Arc<Subscriptions>,
    outbound: Mutex<HashMap<PeerId, OutboundSlot>>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl P2pCommunication {
    /// Bind `address` and start accepting links from known peers.
    ///
    /// `protocol` is bound into every handshake; peers only talk to each
    /// other if they use the same one.
    pub async fn listen(
        host: Arc<NetworkHost>,
        address: SocketAddr,
        protocol: &str,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        let protocol: Arc<str> = Arc::from(protocol);
        let subscriptions = Arc::new(Subscriptions::default());

        tracing::info!(peer = %host.id(), %local_addr, %protocol, "listening");
        let accept_task = tokio::spawn(accept_loop(
            listener,
            host.clone(),
            protocol.clone(),
            subscriptions.clone(),
        ));

        Ok(Self {
            host,
            protocol,
            subscriptions,
            outbound: Mutex::new(HashMap::new()),
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn host(&self) -> &Arc<NetworkHost> {
        &self.host
    }

    async fn connect(&self, peer: &PeerId) -> Result<Outbound, CommunicationError> {
        let address = self
            .host
            .address(peer)
            .ok_or_else(|| CommunicationError::new(peer.clone(), "no known address"))?;
        let dial = async {
            let mut stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            let (transport, remote) =
                noise::initiate(&mut stream, self.host.keypair(), &self.protocol).await?;
            if remote != *peer {
                return Err(noise::Error::UnexpectedPeer {
                    expected: peer.clone(),
                    actual: remote,
                });
            }
            Ok::<_, noise::Error>(Outbound { stream, transport })
        };
        let outbound = tokio::time::timeout(DIAL_TIMEOUT, dial)
            .await
            .map_err(|_| CommunicationError::new(peer.clone(), "dial timed out"))?
            .map_err(|err| CommunicationError::new(peer.clone(), err))?;
        tracing::debug!(%peer, %address, "connected");
        Ok(outbound)
    }

    /// Send one encoded envelope to `peer`, reusing the cached link if there
    /// is one. A failed link is dropped and redialed once.
    async fn send_to(&self, peer: &PeerId, line: &[u8]) -> Result<(), CommunicationError> {
        let slot = self.outbound.lock().entry(peer.clone()).or_default().clone();
        let mut slot = slot.lock().await;

        let (mut outbound, cached) = match slot.take() {
            Some(outbound) => (outbound, true),
            None => (self.connect(peer).await?, false),
        };
        if let Err(err) = outbound.send(line).await {
            if !cached {
                return Err(CommunicationError::new(peer.clone(), err));
            }
            tracing::debug!(%peer, error = %err, "cached link failed, redialing");
            outbound = self.connect(peer).await?;
            outbound
                .send(line)
                .await
                .map_err(|err| CommunicationError::new(peer.clone(), err))?;
        }
        *slot = Some(outbound);
        Ok(())
    }
}

impl Drop for P2pCommunication {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl Communication for P2pCommunication {
    async fn broadcast(
        &self,
        peers: &[PeerId],
        payload: Vec<u8>,
        message_type: MessageType,
        session_id: &str,
    ) -> Result<(), CommunicationError> {
        let msg = WrappedMessage::new(message_type, session_id, payload);
        let mut line = serde_json::to_vec(&msg)
            .map_err(|err| CommunicationError::new(self.host.id(), err))?;
        line.push(b'\n');

        let local = self.host.id();
        let sends = peers
            .iter()
            .filter(|peer| **peer != local)
            .map(|peer| self.send_to(peer, &line));
        let mut first_error = None;
        for result in join_all(sends).await {
            if let Err(err) = result {
                tracing::debug!(%session_id, ?message_type, error = %err, "broadcast failed");
                first_error.get_or_insert(err);
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

async fn accept_loop(
    listener: TcpListener,
    host: Arc<NetworkHost>,
    protocol: Arc<str>,
    subscriptions: Arc<Subscriptions>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, address)) => {
                tokio::spawn(handle_inbound(
                    stream,
                    address,
                    host.clone(),
                    protocol.clone(),
                    subscriptions.clone(),
                ));
            }
            Err(err) => tracing::warn!(error = %err, "failed to accept connection"),
        }
    }
}

async fn handle_inbound(
    mut stream: TcpStream,
    address: SocketAddr,
    host: Arc<NetworkHost>,
    protocol: Arc<str>,
    subscriptions: Arc<Subscriptions>,
) {
    let handshake = noise::respond(&mut stream, host.keypair(), &protocol);
    let (transport, remote) = match tokio::time::timeout(DIAL_TIMEOUT, handshake).await {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(err)) => {
            tracing::warn!(%address, error = %err, "inbound handshake failed");
            return;
        }
        Err(_) => {
            tracing::warn!(%address, "inbound handshake timed out");
            return;
        }
    };
    if !host.is_known(&remote) {
        tracing::warn!(%address, peer = %remote, "rejecting link from unknown peer");
        return;
    }

    tracing::debug!(%address, peer = %remote, "accepted link");
    match process_messages_from_stream(stream, transport, remote.clone(), &subscriptions).await {
        Ok(()) => tracing::debug!(peer = %remote, "link closed"),
        Err(err) => tracing::warn!(peer = %remote, error = %err, "link failed"),
    }
}

/// Decode envelopes from an established link until it ends, dispatching each
/// one with `remote` as its sender.
pub async fn process_messages_from_stream<R>(
    mut reader: R,
    mut transport: TransportState,
    remote: PeerId,
    subscriptions: &Subscriptions,
) -> Result<(), noise::Error>
where
    R: AsyncRead + Unpin,
{
    let mut pending = Vec::new();
    // Bytes of `pending` already known to hold no newline.
    let mut scanned = 0;
    let mut buf = vec![0u8; MAX_MSG_SIZE];
    loop {
        let frame = match noise::read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let len = transport.read_message(&frame, &mut buf)?;
        pending.extend_from_slice(&buf[..len]);

        while let Some(offset) = pending[scanned..].iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=scanned + offset).collect();
            scanned = 0;
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<WrappedMessage>(line) {
                Ok(mut msg) => {
                    msg.from = remote.clone();
                    tracing::trace!(
                        session_id = %msg.session_id,
                        message_type = ?msg.message_type,
                        from = %msg.from,
                        "received message"
                    );
                    subscriptions.dispatch(msg).await;
                }
                Err(err) => tracing::warn!(peer = %remote, error = %err, "dropping undecodable message"),
            }
        }
        scanned = pending.len();
        if pending.len() > MAX_ENVELOPE_SIZE {
            return Err(noise::Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "envelope too large",
            )));
        }
    }
}
