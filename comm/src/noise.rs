//! Noise sessions over byte streams.
//!
//! Links run a `Noise_XX` handshake so both sides learn and authenticate each
//! other's static key, which is what a [`PeerId`] is derived from. After the
//! handshake every Noise message is sent as a frame: a big-endian `u16`
//! length followed by the ciphertext.

use serde::{Deserialize, Serialize};
use snow::{HandshakeState, TransportState};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroize;

use crate::PeerId;

/// The Noise protocol used for every link.
pub const NOISE_PARAMS: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// The maximum size of a Noise message.
pub const MAX_MSG_SIZE: usize = 65535;

/// Size of the ChaChaPoly authentication tag.
const TAG_LEN: usize = 16;

/// The maximum plaintext carried by a single transport message.
pub const MAX_PLAINTEXT_SIZE: usize = MAX_MSG_SIZE - TAG_LEN;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cryptography error from snow: {0}")]
    Snow(#[from] snow::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote did not provide a static key")]
    MissingRemoteKey,
    #[error("expected peer {expected}, remote authenticated as {actual}")]
    UnexpectedPeer { expected: PeerId, actual: PeerId },
}

/// A communication private key.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Zeroize)]
#[serde(transparent)]
pub struct PrivateKey(
    #[serde(
        serialize_with = "serdect::slice::serialize_hex_lower_or_bin",
        deserialize_with = "serdect::slice::deserialize_hex_or_bin_vec"
    )]
    Vec<u8>,
);

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PrivateKey").field(&"REDACTED").finish()
    }
}

impl From<Vec<u8>> for PrivateKey {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl PrivateKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A static Noise keypair identifying the local peer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Keypair {
    pub private: PrivateKey,
    #[serde(
        serialize_with = "serdect::slice::serialize_hex_lower_or_bin",
        deserialize_with = "serdect::slice::deserialize_hex_or_bin_vec"
    )]
    pub public: Vec<u8>,
}

impl Keypair {
    pub fn generate() -> Result<Self, Error> {
        let builder = snow::Builder::new(NOISE_PARAMS.parse()?);
        let keypair = builder.generate_keypair()?;
        Ok(Self {
            private: PrivateKey(keypair.private),
            public: keypair.public,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public)
    }
}

/// Run the initiator side of the handshake, returning the transport state and
/// the authenticated remote peer.
pub async fn initiate<S>(
    stream: &mut S,
    keypair: &Keypair,
    protocol: &str,
) -> Result<(TransportState, PeerId), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = snow::Builder::new(NOISE_PARAMS.parse()?)
        .local_private_key(keypair.private.as_bytes())
        .prologue(protocol.as_bytes())
        .build_initiator()?;
    let mut buf = vec![0u8; MAX_MSG_SIZE];

    // -> e
    let len = handshake.write_message(&[], &mut buf)?;
    write_frame(stream, &buf[..len]).await?;
    // <- e, ee, s, es
    let frame = read_frame(stream).await?;
    handshake.read_message(&frame, &mut buf)?;
    // -> s, se
    let len = handshake.write_message(&[], &mut buf)?;
    write_frame(stream, &buf[..len]).await?;

    finish(handshake)
}

/// Run the responder side of the handshake.
pub async fn respond<S>(
    stream: &mut S,
    keypair: &Keypair,
    protocol: &str,
) -> Result<(TransportState, PeerId), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = snow::Builder::new(NOISE_PARAMS.parse()?)
        .local_private_key(keypair.private.as_bytes())
        .prologue(protocol.as_bytes())
        .build_responder()?;
    let mut buf = vec![0u8; MAX_MSG_SIZE];

    let frame = read_frame(stream).await?;
    handshake.read_message(&frame, &mut buf)?;
    let len = handshake.write_message(&[], &mut buf)?;
    write_frame(stream, &buf[..len]).await?;
    let frame = read_frame(stream).await?;
    handshake.read_message(&frame, &mut buf)?;

    finish(handshake)
}

fn finish(handshake: HandshakeState) -> Result<(TransportState, PeerId), Error> {
    let remote = handshake
        .get_remote_static()
        .map(PeerId::from_public_key)
        .ok_or(Error::MissingRemoteKey)?;
    Ok((handshake.into_transport_mode()?, remote))
}

/// Encrypt `plaintext` into as many frames as needed and write them.
pub async fn write_encrypted<W>(
    writer: &mut W,
    transport: &mut TransportState,
    plaintext: &[u8],
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_MSG_SIZE];
    for chunk in plaintext.chunks(MAX_PLAINTEXT_SIZE) {
        let len = transport.write_message(chunk, &mut buf)?;
        write_frame(writer, &buf[..len]).await?;
    }
    writer.flush().await?;
    Ok(())
}

pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(frame.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large")
    })?;
    writer.write_u16(len).await?;
    writer.write_all(frame).await
}

pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u16().await?;
    let mut frame = vec![0u8; usize::from(len)];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}
