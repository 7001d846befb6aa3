//! TCP transport for Raft messages.
//!
//! Outbound: at most one connection per peer, each with a small pending
//! queue (oldest messages evicted when it overflows) and reconnect with a
//! fixed retry delay. Every connection starts with a handshake carrying the
//! protocol version, the sender's server id and its address; messages
//! follow as length-prefixed protobuf.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use protobuf::Message as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

use crate::error::{Error, Result};
use crate::wire::PROTOCOL_RAFT_UPGRADE;

/// Protocol version exchanged in the transport handshake.
pub const TRANSPORT_PROTOCOL: u64 = 1;

/// Upper bound on a peer address in the handshake.
pub const MAX_ADDRESS_LEN: usize = 256;

/// Pending sends kept per peer before older ones are evicted.
const SEND_QUEUE_DEPTH: usize = 3;

pub struct Transport {
    id: u64,
    address: String,
    incoming: mpsc::Sender<raft::eraftpb::Message>,
    retry_delay: Duration,
    peers: Mutex<HashMap<u64, Peer>>,
    closed: Arc<AtomicBool>,
}

struct Peer {
    address: String,
    queue: Arc<Mutex<VecDeque<raft::eraftpb::Message>>>,
    notify: Arc<Notify>,
}

impl Transport {
    pub fn new(
        id: u64,
        address: String,
        retry_delay: Duration,
        incoming: mpsc::Sender<raft::eraftpb::Message>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            address,
            incoming,
            retry_delay,
            peers: Mutex::new(HashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Queue a message for a peer, spawning its connection task on first
    /// use. When the queue is full the oldest message is dropped, as if its
    /// send had failed with NOCONNECTION.
    pub fn send(self: &Arc<Self>, to: u64, address: &str, message: raft::eraftpb::Message) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut peers = self.peers.lock();
        let peer = peers.entry(to).or_insert_with(|| {
            let peer = Peer {
                address: address.to_string(),
                queue: Arc::new(Mutex::new(VecDeque::new())),
                notify: Arc::new(Notify::new()),
            };
            tokio::spawn(run_peer(
                self.id,
                self.address.clone(),
                address.to_string(),
                peer.queue.clone(),
                peer.notify.clone(),
                self.retry_delay,
                self.closed.clone(),
            ));
            peer
        });
        if peer.address != address {
            // The peer moved; drop the stale connection task and redial.
            peers.remove(&to);
            drop(peers);
            return self.send(to, address, message);
        }
        let mut queue = peer.queue.lock();
        if queue.len() >= SEND_QUEUE_DEPTH {
            tracing::debug!("send queue to server {to} full, evicting oldest message");
            queue.pop_front();
        }
        queue.push_back(message);
        peer.notify.notify_one();
    }

    /// Serve an inbound connection that already consumed the Raft upgrade
    /// magic: validate the handshake, then feed decoded messages to the
    /// node until the peer hangs up.
    pub async fn handle_inbound(&self, mut stream: TcpStream) -> Result<()> {
        let (peer_id, peer_address) = read_handshake(&mut stream).await?;
        tracing::debug!("raft connection from server {peer_id} at {peer_address}");
        loop {
            let mut len_buf = [0u8; 8];
            match stream.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            let len = u64::from_le_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await?;
            let message = <raft::eraftpb::Message as protobuf::Message>::parse_from_bytes(&buf)
                .map_err(|e| Error::Corrupt(format!("malformed raft message: {e}")))?;
            if self.incoming.send(message).await.is_err() {
                return Ok(());
            }
        }
    }

    /// Close all outbound connections. In-flight reconnect attempts wind
    /// down on their next wakeup.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let peers = std::mem::take(&mut *self.peers.lock());
        for (_, peer) in peers {
            peer.notify.notify_one();
        }
    }
}

async fn read_handshake(stream: &mut TcpStream) -> Result<(u64, String)> {
    let mut preamble = [0u8; 24];
    stream.read_exact(&mut preamble).await?;
    let protocol = u64::from_le_bytes(preamble[0..8].try_into().unwrap());
    if protocol != TRANSPORT_PROTOCOL {
        return Err(Error::Proto(format!("unknown transport protocol {protocol}")));
    }
    let id = u64::from_le_bytes(preamble[8..16].try_into().unwrap());
    let address_len = u64::from_le_bytes(preamble[16..24].try_into().unwrap()) as usize;
    if address_len == 0 || address_len > MAX_ADDRESS_LEN {
        return Err(Error::Proto(format!("invalid address length {address_len}")));
    }
    let padded = address_len.next_multiple_of(8);
    let mut buf = vec![0u8; padded];
    stream.read_exact(&mut buf).await?;
    let address = std::str::from_utf8(&buf[..address_len])
        .map_err(|_| Error::Proto("invalid address encoding".into()))?
        .trim_end_matches('\0')
        .to_string();
    Ok((id, address))
}

async fn write_handshake(stream: &mut TcpStream, id: u64, address: &str) -> Result<()> {
    let address_len = address.len() + 1; // NUL terminated, like file names
    let padded = address_len.next_multiple_of(8);
    let mut buf = Vec::with_capacity(32 + padded);
    buf.extend_from_slice(&PROTOCOL_RAFT_UPGRADE.to_le_bytes());
    buf.extend_from_slice(&TRANSPORT_PROTOCOL.to_le_bytes());
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&(address_len as u64).to_le_bytes());
    buf.extend_from_slice(address.as_bytes());
    buf.resize(32 + padded, 0);
    stream.write_all(&buf).await?;
    Ok(())
}

async fn run_peer(
    id: u64,
    own_address: String,
    peer_address: String,
    queue: Arc<Mutex<VecDeque<raft::eraftpb::Message>>>,
    notify: Arc<Notify>,
    retry_delay: Duration,
    closed: Arc<AtomicBool>,
) {
    let mut stream: Option<TcpStream> = None;
    let mut backoff = Backoff::new(retry_delay);
    loop {
        if closed.load(Ordering::SeqCst) {
            tracing::debug!("connection task to {peer_address} canceled");
            return;
        }
        let message = {
            let mut queue = queue.lock();
            queue.pop_front()
        };
        let Some(message) = message else {
            notify.notified().await;
            continue;
        };

        if stream.is_none() {
            match TcpStream::connect(&peer_address).await {
                Ok(mut s) => {
                    if let Err(e) = write_handshake(&mut s, id, &own_address).await {
                        tracing::debug!("handshake with {peer_address} failed: {e}");
                        tokio::time::sleep(backoff.next()).await;
                        continue;
                    }
                    backoff.reset();
                    stream = Some(s);
                }
                Err(e) => {
                    tracing::debug!("connect to {peer_address} failed: {e}");
                    // The message is dropped; raft retransmits.
                    tokio::time::sleep(backoff.next()).await;
                    continue;
                }
            }
        }

        let bytes = match message.write_to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("failed to encode raft message: {e}");
                continue;
            }
        };
        let s = stream.as_mut().unwrap();
        let result = async {
            s.write_all(&(bytes.len() as u64).to_le_bytes()).await?;
            s.write_all(&bytes).await
        }
        .await;
        if let Err(e) = result {
            tracing::debug!("send to {peer_address} failed: {e}");
            stream = None;
            tokio::time::sleep(backoff.next()).await;
        }
    }
}

/// Reconnect delay: doubles per consecutive failure up to eight times the
/// base, with jitter so peers do not redial in lockstep.
struct Backoff {
    base: Duration,
    failures: u32,
}

impl Backoff {
    fn new(base: Duration) -> Self {
        Self { base, failures: 0 }
    }

    fn next(&mut self) -> Duration {
        let factor = 1u32 << self.failures.min(3);
        self.failures = self.failures.saturating_add(1);
        let delay = self.base * factor;
        delay + Duration::from_millis(rand::random::<u64>() % 100)
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use raft::eraftpb::{Message, MessageType};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn handshake_and_message_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (client_in_tx, _client_in_rx) = mpsc::channel(16);
        let client = Transport::new(1, "127.0.0.1:7000".into(), Duration::from_millis(10), client_in_tx);

        let (server_in_tx, mut server_in_rx) = mpsc::channel(16);
        let server = Transport::new(2, addr.clone(), Duration::from_millis(10), server_in_tx);
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Consume the upgrade magic the client prepends.
            let mut magic = [0u8; 8];
            stream.read_exact(&mut magic).await.unwrap();
            assert_eq!(u64::from_le_bytes(magic), PROTOCOL_RAFT_UPGRADE);
            server.handle_inbound(stream).await.unwrap();
        });

        let mut message = Message::default();
        message.set_msg_type(MessageType::MsgHeartbeat);
        message.set_from(1);
        message.set_to(2);
        client.send(2, &addr, message.clone());

        let received = server_in_rx.recv().await.unwrap();
        assert_eq!(received.get_msg_type(), MessageType::MsgHeartbeat);
        assert_eq!(received.get_from(), 1);

        client.close();
    }

    #[tokio::test]
    async fn queue_evicts_oldest() {
        // No listener: messages pile up in the queue.
        let (incoming_tx, _incoming_rx) = mpsc::channel(16);
        let transport = Transport::new(1, "127.0.0.1:7000".into(), Duration::from_secs(5), incoming_tx);
        for i in 0..10u64 {
            let mut message = Message::default();
            message.set_index(i);
            transport.send(2, "127.0.0.1:1", message);
        }
        let peers = transport.peers.lock();
        let queue = peers.get(&2).unwrap().queue.lock();
        assert!(queue.len() <= SEND_QUEUE_DEPTH);
        drop(queue);
        drop(peers);
        transport.close();
    }
}
