//! Authenticated, encrypted request/response channel.
//!
//! Both ends hold long-term Curve25519 keys. The dispatcher knows the
//! worker's public key in advance, so the handshake is Noise `IK`: the worker
//! learns and checks the dispatcher's static key from the first message, and
//! the dispatcher only completes the handshake if the worker proves
//! possession of the expected key.
//!
//! After the handshake the channel alternates strictly: the initiator sends,
//! then receives, then sends again. Calling out of turn is an error rather
//! than a deadlock. A send or receive that fails or is cancelled part way
//! leaves the channel unusable, since the stream and the cipher state may no
//! longer agree with the peer.
//!
//! A Noise transport message carries at most 65535 bytes, so each payload is
//! split into chunks whose ciphertexts are concatenated into a single frame.

use std::net::IpAddr;

use snow::params::NoiseParams;
use snow::{Builder, HandshakeState, TransportState};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::{recv_message, send_message, FrameError};
use crate::credentials::{Keypair, PublicKey};

/// Noise protocol name used by both ends.
pub const NOISE_PARAMS: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2s";

const PROLOGUE: &[u8] = b"command-dispatch/v1";

/// Largest Noise message, ciphertext included.
const MAX_NOISE_MESSAGE: usize = 65535;

/// ChaChaPoly authentication tag.
const TAG_LEN: usize = 16;

/// Plaintext bytes per chunk, chosen so every full chunk encrypts to exactly
/// `MAX_NOISE_MESSAGE` bytes.
const MAX_CHUNK_LEN: usize = MAX_NOISE_MESSAGE - TAG_LEN;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("peer closed the channel")]
    Closed,

    #[error(transparent)]
    Frame(FrameError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection from {0} is not allowed")]
    AddressRejected(IpAddr),

    #[error("peer key {0} is not authorized")]
    UnauthorizedKey(PublicKey),

    #[error("cannot {0} now: the channel is waiting to {1}")]
    OutOfTurn(&'static str, &'static str),

    #[error("channel is unusable after an interrupted send or receive")]
    Poisoned,

    #[error("malformed encrypted frame")]
    Malformed,

    #[error("encryption error: {0}")]
    Noise(#[from] snow::Error),
}

impl From<FrameError> for ChannelError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Closed => Self::Closed,
            other => Self::Frame(other),
        }
    }
}

/// Which peers the accepting side lets in.
#[derive(Debug, Clone, Default)]
pub struct PeerPolicy {
    allowed_addresses: Vec<IpAddr>,
    authorized_keys: Vec<PublicKey>,
}

impl PeerPolicy {
    /// An empty address list admits every source address. An empty key list
    /// admits nobody.
    pub fn new(allowed_addresses: Vec<IpAddr>, authorized_keys: Vec<PublicKey>) -> Self {
        Self {
            allowed_addresses: allowed_addresses.into_iter().map(|ip| ip.to_canonical()).collect(),
            authorized_keys,
        }
    }

    pub fn allows_address(&self, ip: IpAddr) -> bool {
        self.allowed_addresses.is_empty() || self.allowed_addresses.contains(&ip.to_canonical())
    }

    pub fn authorizes(&self, key: &PublicKey) -> bool {
        self.authorized_keys.contains(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    Send,
    Receive,
    /// Set while a send or receive is in flight. Only completion clears it.
    Broken,
}

impl Turn {
    const fn verb(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Receive => "receive",
            Self::Broken => "close",
        }
    }
}

/// An established channel over stream `S`.
pub struct SecureChannel<S> {
    stream: S,
    transport: TransportState,
    turn: Turn,
    remote_key: PublicKey,
}

impl<S> std::fmt::Debug for SecureChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("turn", &self.turn)
            .field("remote_key", &self.remote_key)
            .finish_non_exhaustive()
    }
}

fn builder(local: &Keypair) -> Result<Builder<'_>, ChannelError> {
    let params: NoiseParams = NOISE_PARAMS.parse()?;
    Ok(Builder::new(params)
        .local_private_key(local.secret().as_bytes())
        .prologue(PROLOGUE))
}

fn handshake_error(err: impl std::fmt::Display) -> ChannelError {
    ChannelError::Handshake(err.to_string())
}

async fn read_handshake<S>(
    stream: &mut S,
    state: &mut HandshakeState,
) -> Result<(), ChannelError>
where
    S: AsyncRead + Unpin,
{
    let message = recv_message(stream).await.map_err(handshake_error)?;
    let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
    state.read_message(&message, &mut buf).map_err(handshake_error)?;
    Ok(())
}

async fn write_handshake<S>(
    stream: &mut S,
    state: &mut HandshakeState,
) -> Result<(), ChannelError>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
    let len = state.write_message(&[], &mut buf).map_err(handshake_error)?;
    send_message(stream, &buf[..len]).await.map_err(handshake_error)
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Open a channel to a peer whose public key is already known.
    ///
    /// Fails if the peer cannot prove it holds `remote`'s secret key or
    /// refuses our key.
    pub async fn initiate(
        mut stream: S,
        local: &Keypair,
        remote: &PublicKey,
    ) -> Result<Self, ChannelError> {
        let mut state = builder(local)?
            .remote_public_key(remote.as_bytes())
            .build_initiator()?;

        write_handshake(&mut stream, &mut state).await?;
        read_handshake(&mut stream, &mut state).await?;

        let transport = state.into_transport_mode()?;
        debug!(remote_key = %remote, "Secure channel established");
        Ok(Self {
            stream,
            transport,
            turn: Turn::Send,
            remote_key: *remote,
        })
    }

    /// Accept a channel from `peer`, checking its address before reading
    /// anything and its static key before answering the handshake.
    pub async fn accept(
        mut stream: S,
        peer: IpAddr,
        local: &Keypair,
        policy: &PeerPolicy,
    ) -> Result<Self, ChannelError> {
        if !policy.allows_address(peer) {
            warn!(%peer, "Rejected connection from disallowed address");
            return Err(ChannelError::AddressRejected(peer));
        }

        let mut state = builder(local)?.build_responder()?;
        read_handshake(&mut stream, &mut state).await?;

        let remote_key = state
            .get_remote_static()
            .and_then(PublicKey::from_slice)
            .ok_or_else(|| handshake_error("initiator sent no static key"))?;
        if !policy.authorizes(&remote_key) {
            warn!(%peer, %remote_key, "Rejected unauthorized key");
            return Err(ChannelError::UnauthorizedKey(remote_key));
        }

        write_handshake(&mut stream, &mut state).await?;

        let transport = state.into_transport_mode()?;
        debug!(%peer, %remote_key, "Secure channel accepted");
        Ok(Self {
            stream,
            transport,
            turn: Turn::Receive,
            remote_key,
        })
    }

    /// The authenticated static key of the other end.
    pub const fn remote_key(&self) -> &PublicKey {
        &self.remote_key
    }

    /// Check it is `wanted`'s turn and mark the channel busy until the
    /// operation completes.
    fn begin(&mut self, wanted: Turn) -> Result<(), ChannelError> {
        match self.turn {
            turn if turn == wanted => {
                self.turn = Turn::Broken;
                Ok(())
            }
            Turn::Broken => Err(ChannelError::Poisoned),
            turn => Err(ChannelError::OutOfTurn(wanted.verb(), turn.verb())),
        }
    }

    /// Encrypt and send one payload. Only valid when it is our turn to send.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        self.begin(Turn::Send)?;

        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(MAX_CHUNK_LEN).collect()
        };

        let mut frame = Vec::with_capacity(payload.len() + chunks.len() * TAG_LEN);
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        for chunk in chunks {
            let len = self.transport.write_message(chunk, &mut buf)?;
            frame.extend_from_slice(&buf[..len]);
        }

        send_message(&mut self.stream, &frame).await?;
        self.turn = Turn::Receive;
        Ok(())
    }

    /// Receive and decrypt one payload. Only valid after we have sent, or
    /// immediately after accepting.
    pub async fn recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        self.begin(Turn::Receive)?;

        let frame = recv_message(&mut self.stream).await?;
        if frame.is_empty() {
            return Err(ChannelError::Malformed);
        }

        let mut payload = Vec::with_capacity(frame.len());
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        for chunk in frame.chunks(MAX_NOISE_MESSAGE) {
            if chunk.len() < TAG_LEN {
                return Err(ChannelError::Malformed);
            }
            let len = self.transport.read_message(chunk, &mut buf)?;
            payload.extend_from_slice(&buf[..len]);
        }

        self.turn = Turn::Send;
        Ok(payload)
    }

    /// Shut down the write half so the peer sees a clean close.
    pub async fn close(mut self) -> Result<(), ChannelError> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| ChannelError::Frame(FrameError::Io(e)))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use tokio::io::DuplexStream;

    use super::*;
    use crate::credentials::test_support::generate_keypair;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn pair(
        client: &Keypair,
        worker: &Keypair,
        expected_worker: &PublicKey,
        policy: &PeerPolicy,
    ) -> (
        Result<SecureChannel<DuplexStream>, ChannelError>,
        Result<SecureChannel<DuplexStream>, ChannelError>,
    ) {
        let (a, b) = tokio::io::duplex(1 << 20);
        tokio::join!(
            SecureChannel::initiate(a, client, expected_worker),
            SecureChannel::accept(b, LOCALHOST, worker, policy),
        )
    }

    fn trusting(client: &Keypair) -> PeerPolicy {
        PeerPolicy::new(vec![LOCALHOST], vec![client.public])
    }

    #[tokio::test]
    async fn request_and_response_round_trip() {
        let client = generate_keypair();
        let worker = generate_keypair();
        let (c, w) = pair(&client, &worker, &worker.public, &trusting(&client)).await;
        let (mut c, mut w) = (c.unwrap(), w.unwrap());

        assert_eq!(c.remote_key(), &worker.public);
        assert_eq!(w.remote_key(), &client.public);

        c.send(b"request").await.unwrap();
        assert_eq!(w.recv().await.unwrap(), b"request");
        w.send(b"response").await.unwrap();
        assert_eq!(c.recv().await.unwrap(), b"response");

        // and again, to check the turn flips back
        c.send(b"second").await.unwrap();
        assert_eq!(w.recv().await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn large_and_empty_payloads() {
        let client = generate_keypair();
        let worker = generate_keypair();
        let (c, w) = pair(&client, &worker, &worker.public, &trusting(&client)).await;
        let (mut c, mut w) = (c.unwrap(), w.unwrap());

        let big: Vec<u8> = (0..MAX_CHUNK_LEN * 3 + 17).map(|i| (i % 251) as u8).collect();
        let (sent, received) = tokio::join!(c.send(&big), w.recv());
        sent.unwrap();
        assert_eq!(received.unwrap(), big);

        w.send(b"").await.unwrap();
        assert!(c.recv().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_turn_calls_fail_fast() {
        let client = generate_keypair();
        let worker = generate_keypair();
        let (c, w) = pair(&client, &worker, &worker.public, &trusting(&client)).await;
        let (mut c, mut w) = (c.unwrap(), w.unwrap());

        assert!(matches!(
            c.recv().await,
            Err(ChannelError::OutOfTurn("receive", "send"))
        ));
        assert!(matches!(
            w.send(b"x").await,
            Err(ChannelError::OutOfTurn("send", "receive"))
        ));

        c.send(b"one").await.unwrap();
        assert!(matches!(c.send(b"two").await, Err(ChannelError::OutOfTurn(..))));
    }

    #[tokio::test]
    async fn cancelled_receive_poisons_the_channel() {
        let client = generate_keypair();
        let worker = generate_keypair();
        let (c, w) = pair(&client, &worker, &worker.public, &trusting(&client)).await;
        let (mut c, mut w) = (c.unwrap(), w.unwrap());

        c.send(b"request").await.unwrap();
        assert_eq!(w.recv().await.unwrap(), b"request");

        let waited = tokio::time::timeout(Duration::from_millis(50), c.recv()).await;
        assert!(waited.is_err());

        // the reply arrives late and must not be taken for a later answer
        w.send(b"late reply").await.unwrap();
        assert!(matches!(c.recv().await, Err(ChannelError::Poisoned)));
        assert!(matches!(c.send(b"next").await, Err(ChannelError::Poisoned)));
    }

    #[tokio::test]
    async fn failed_receive_poisons_the_channel() {
        let client = generate_keypair();
        let worker = generate_keypair();
        let (c, w) = pair(&client, &worker, &worker.public, &trusting(&client)).await;
        let (c, mut w) = (c.unwrap(), w.unwrap());

        c.close().await.unwrap();
        assert!(matches!(w.recv().await, Err(ChannelError::Closed)));
        assert!(matches!(w.recv().await, Err(ChannelError::Poisoned)));
    }

    #[tokio::test]
    async fn unauthorized_client_key_is_rejected() {
        let client = generate_keypair();
        let stranger = generate_keypair();
        let worker = generate_keypair();
        let (c, w) = pair(&client, &worker, &worker.public, &trusting(&stranger)).await;

        assert!(matches!(w, Err(ChannelError::UnauthorizedKey(key)) if key == client.public));
        assert!(matches!(c, Err(ChannelError::Handshake(_))));
    }

    #[tokio::test]
    async fn wrong_worker_key_fails_handshake() {
        let client = generate_keypair();
        let worker = generate_keypair();
        let impostor = generate_keypair();
        let (c, w) = pair(&client, &worker, &impostor.public, &trusting(&client)).await;

        assert!(matches!(w, Err(ChannelError::Handshake(_))));
        assert!(c.is_err());
    }

    #[tokio::test]
    async fn disallowed_address_is_rejected_before_handshake() {
        let worker = generate_keypair();
        let policy = PeerPolicy::new(vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))], vec![]);
        let (_a, b) = tokio::io::duplex(1024);
        let err = SecureChannel::accept(b, LOCALHOST, &worker, &policy).await.unwrap_err();
        assert!(matches!(err, ChannelError::AddressRejected(ip) if ip == LOCALHOST));
    }

    #[tokio::test]
    async fn peer_close_is_reported() {
        let client = generate_keypair();
        let worker = generate_keypair();
        let (c, w) = pair(&client, &worker, &worker.public, &trusting(&client)).await;
        let (c, mut w) = (c.unwrap(), w.unwrap());

        c.close().await.unwrap();
        assert!(matches!(w.recv().await, Err(ChannelError::Closed)));
    }

    #[test]
    fn empty_address_list_admits_everyone() {
        let policy = PeerPolicy::new(vec![], vec![]);
        assert!(policy.allows_address(LOCALHOST));
        assert!(policy.allows_address("192.0.2.7".parse().unwrap()));
    }

    #[test]
    fn mapped_ipv6_matches_ipv4_entry() {
        let policy = PeerPolicy::new(vec![LOCALHOST], vec![]);
        assert!(policy.allows_address("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!policy.allows_address("::1".parse().unwrap()));
    }
}
