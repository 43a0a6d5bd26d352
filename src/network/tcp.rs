use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, FramedRead, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::error::RpcError;
use crate::message::{self, Envelope, RaftMessage};
use crate::node::Inbox;
use crate::traits::{Network, RpcResult};
use crate::types::MemberId;

const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

#[derive(Debug, Clone)]
pub struct TcpNetworkOptions {
    /// Messages buffered per peer before new ones are dropped.
    pub queue_capacity: usize,
    pub connect_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub max_reconnect_backoff: Duration,
}

impl Default for TcpNetworkOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            connect_timeout: Duration::from_secs(1),
            reconnect_backoff: Duration::from_millis(50),
            max_reconnect_backoff: Duration::from_secs(2),
        }
    }
}

struct Peer {
    address: String,
    queue: mpsc::Sender<Envelope>,
}

struct Inner {
    options: TcpNetworkOptions,
    addresses: RwLock<HashMap<MemberId, String>>,
    peers: Mutex<HashMap<MemberId, Peer>>,
}

/// Sends length-delimited bincode envelopes over TCP, one connection and
/// writer task per peer.
#[derive(Clone)]
pub struct TcpNetwork {
    inner: Arc<Inner>,
}

impl TcpNetwork {
    pub fn new(options: TcpNetworkOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                addresses: RwLock::new(HashMap::new()),
                peers: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn queue_for(&self, target: &MemberId) -> RpcResult<mpsc::Sender<Envelope>> {
        let address = self
            .inner
            .addresses
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| RpcError::UnknownAddress(target.clone()))?;
        let mut peers = self.inner.peers.lock();
        if let Some(peer) = peers.get(target) {
            if peer.address == address && !peer.queue.is_closed() {
                return Ok(peer.queue.clone());
            }
        }
        let (queue, rx) = mpsc::channel(self.inner.options.queue_capacity);
        tokio::spawn(run_writer(
            target.clone(),
            address.clone(),
            self.inner.options.clone(),
            rx,
        ));
        peers.insert(
            target.clone(),
            Peer {
                address,
                queue: queue.clone(),
            },
        );
        Ok(queue)
    }
}

#[async_trait]
impl Network for TcpNetwork {
    async fn send(&self, from: &MemberId, target: &MemberId, message: RaftMessage) -> RpcResult<()> {
        let queue = self.queue_for(target)?;
        let envelope = Envelope {
            from: from.clone(),
            to: target.clone(),
            message,
        };
        queue.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RpcError::QueueFull(target.clone()),
            mpsc::error::TrySendError::Closed(_) => {
                RpcError::Network(format!("writer for {} stopped", target))
            }
        })
    }

    fn register_address(&self, member: &MemberId, address: &str) {
        let mut addresses = self.inner.addresses.write();
        if addresses.get(member).map(String::as_str) != Some(address) {
            debug!("Address of {} is {}", member, address);
            addresses.insert(member.clone(), address.to_string());
        }
    }
}

async fn connect(address: &str, timeout: Duration) -> std::io::Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connect timed out",
        )),
    }
}

/// Drains one peer's queue, reconnecting with backoff. Messages that fail
/// to send are dropped; Raft resends what matters.
async fn run_writer(
    target: MemberId,
    address: String,
    options: TcpNetworkOptions,
    mut rx: mpsc::Receiver<Envelope>,
) {
    let mut backoff = options.reconnect_backoff;
    loop {
        let stream = match connect(&address, options.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Connect to {} at {} failed: {}", target, address, e);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(options.max_reconnect_backoff);
                // keep the queue from filling with stale messages
                while rx.try_recv().is_ok() {}
                if rx.is_closed() && rx.is_empty() {
                    return;
                }
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        backoff = options.reconnect_backoff;
        debug!("Connected to {} at {}", target, address);
        let mut framed = Framed::new(stream, codec());
        loop {
            let Some(envelope) = rx.recv().await else {
                return;
            };
            let frame = match message::encode(&envelope) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Failed to encode {} for {}: {}", envelope.message.name(), target, e);
                    continue;
                }
            };
            if let Err(e) = framed.send(Bytes::from(frame)).await {
                warn!("Connection to {} at {} lost: {}", target, address, e);
                break;
            }
        }
    }
}

/// Accepts peer connections on `listener` and delivers their messages to
/// `inbox`.
pub fn serve(listener: TcpListener, inbox: Inbox) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            info!("Member {} listening on {}", inbox.member(), addr);
        }
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            debug!("Accepted connection from {}", peer);
            let inbox = inbox.clone();
            tokio::spawn(async move {
                let mut frames = FramedRead::new(stream, codec());
                while let Some(frame) = frames.next().await {
                    let envelope: Envelope = match frame {
                        Ok(bytes) => match message::decode(&bytes) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                warn!("Dropping undecodable frame from {}: {}", peer, e);
                                continue;
                            }
                        },
                        Err(e) => {
                            debug!("Connection from {} closed: {}", peer, e);
                            return;
                        }
                    };
                    if envelope.to != *inbox.member() {
                        warn!(
                            "Dropping {} addressed to {} received by {}",
                            envelope.message.name(),
                            envelope.to,
                            inbox.member()
                        );
                        continue;
                    }
                    if !inbox.deliver(envelope.from, envelope.message) {
                        return;
                    }
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::VoteResponse;

    #[tokio::test]
    async fn delivers_frames_between_members() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let inbox = Inbox::for_test(MemberId::new("b"), tx);
        let _server = serve(listener, inbox);

        let network = TcpNetwork::new(TcpNetworkOptions::default());
        let message = RaftMessage::VoteResponse(VoteResponse {
            term: 3,
            vote_granted: true,
        });
        assert!(matches!(
            network
                .send(&MemberId::new("a"), &MemberId::new("b"), message.clone())
                .await,
            Err(RpcError::UnknownAddress(_))
        ));
        network.register_address(&MemberId::new("b"), &addr);
        network
            .send(&MemberId::new("a"), &MemberId::new("b"), message.clone())
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            crate::event::Event::Message { from, message: got } => {
                assert_eq!(from, MemberId::new("a"));
                assert_eq!(got, message);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
