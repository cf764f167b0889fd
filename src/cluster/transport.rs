// src/cluster/transport.rs
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::error::{RaftError, RaftResult};
use super::message::{Inbound, Message, NodeId, MAX_DATAGRAM};

/// Where decoded inbound messages go. An `Err` means the peer sent something
/// this node cannot understand and should stop.
pub type InboundSender = mpsc::Sender<RaftResult<Inbound>>;

pub trait Transport: Send + Sync + 'static {
    /// Queue a message for delivery without waiting. Best effort: a full
    /// queue reports an error and the message is dropped.
    fn send(&self, message: Message, destination: NodeId) -> RaftResult<()>;
    /// Address peers see as the sender of our messages
    fn local_addr(&self) -> NodeId;
    /// Stop the background tasks and release the endpoint
    fn shutdown(&self) -> impl Future<Output = ()> + Send;
}

fn enqueue(
    queue: &mpsc::Sender<(Message, NodeId)>,
    message: Message,
    destination: NodeId,
) -> RaftResult<()> {
    queue.try_send((message, destination)).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => {
            RaftError::Transport(format!("outbound queue full, dropped message to {}", destination))
        }
        mpsc::error::TrySendError::Closed(_) => {
            RaftError::Transport("outbound queue closed".to_string())
        }
    })
}

/// Decodes one datagram and hands it to the node. Malformed datagrams are
/// dropped; an unknown message type is forwarded as an error. Returns false
/// once the node has gone away.
async fn forward(inbound: &InboundSender, bytes: &[u8], sender: NodeId) -> bool {
    let item = match Message::decode(bytes) {
        Ok(message) => {
            trace!(from = %sender, kind = message.kind(), "received");
            Ok(Inbound { message, sender })
        }
        Err(e @ RaftError::UnknownMessageType(_)) => {
            error!(from = %sender, error = %e, "incompatible peer");
            Err(e)
        }
        Err(e) => {
            warn!(from = %sender, error = %e, "dropping malformed datagram");
            return true;
        }
    };
    inbound.send(item).await.is_ok()
}

/// JSON over UDP. One socket is used for both directions so the source
/// address of every datagram is the sending node's id.
pub struct UdpTransport {
    local_addr: NodeId,
    outbound_tx: mpsc::Sender<(Message, NodeId)>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpTransport {
    pub async fn bind(addr: NodeId, inbound: InboundSender, capacity: usize) -> RaftResult<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (tx, mut rx) = mpsc::channel::<(Message, NodeId)>(capacity);

        let send_socket = Arc::clone(&socket);
        let sender = tokio::spawn(async move {
            while let Some((message, destination)) = rx.recv().await {
                let bytes = match message.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!(error = %e, "failed to encode message");
                        continue;
                    }
                };
                if bytes.len() > MAX_DATAGRAM {
                    error!(len = bytes.len(), to = %destination, "message too large for a datagram");
                    continue;
                }
                if let Err(e) = send_socket.send_to(&bytes, destination).await {
                    debug!(to = %destination, error = %e, "send failed");
                }
            }
        });

        let receiver = tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, from)) => {
                        if !forward(&inbound, &buffer[..len], from).await {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "receive failed"),
                }
            }
        });

        debug!(addr = %local_addr, "udp transport bound");
        Ok(UdpTransport {
            local_addr,
            outbound_tx: tx,
            tasks: Mutex::new(vec![sender, receiver]),
        })
    }
}

impl Transport for UdpTransport {
    fn send(&self, message: Message, destination: NodeId) -> RaftResult<()> {
        enqueue(&self.outbound_tx, message, destination)
    }

    fn local_addr(&self) -> NodeId {
        self.local_addr
    }

    async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        debug!(addr = %self.local_addr, "udp transport closed");
    }
}

#[derive(Default)]
struct Links {
    endpoints: HashMap<NodeId, InboundSender>,
    isolated: HashSet<NodeId>,
    cut: HashSet<(NodeId, NodeId)>,
}

impl Links {
    fn is_up(&self, from: NodeId, to: NodeId) -> bool {
        !self.isolated.contains(&from) && !self.isolated.contains(&to) && !self.cut.contains(&(from, to))
    }
}

/// An in-process network for tests and simulations. Messages still go
/// through the JSON codec; links can be cut to model partitions.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    links: Arc<RwLock<Links>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        MemoryNetwork::default()
    }

    /// Registers `addr` on the network. Must be called inside a tokio runtime.
    pub fn bind(&self, addr: NodeId, inbound: InboundSender, capacity: usize) -> MemoryTransport {
        self.links.write().endpoints.insert(addr, inbound);

        let (tx, mut rx) = mpsc::channel::<(Message, NodeId)>(capacity);
        let network = self.clone();
        let sender = tokio::spawn(async move {
            while let Some((message, destination)) = rx.recv().await {
                match message.encode() {
                    Ok(bytes) => network.deliver_raw(addr, destination, &bytes).await,
                    Err(e) => error!(error = %e, "failed to encode message"),
                }
            }
        });

        MemoryTransport {
            local_addr: addr,
            network: self.clone(),
            outbound_tx: tx,
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Cuts every link to and from `node`.
    pub fn isolate(&self, node: NodeId) {
        self.links.write().isolated.insert(node);
    }

    /// Cuts the link between `a` and `b` in both directions.
    pub fn disconnect(&self, a: NodeId, b: NodeId) {
        let mut links = self.links.write();
        links.cut.insert((a, b));
        links.cut.insert((b, a));
    }

    /// Restores every link.
    pub fn heal(&self) {
        let mut links = self.links.write();
        links.isolated.clear();
        links.cut.clear();
    }

    pub fn is_connected(&self, from: NodeId, to: NodeId) -> bool {
        self.links.read().is_up(from, to)
    }

    /// Delivers undecoded bytes from `from` to `to` as if they had arrived
    /// from the wire. Dropped silently when the link is down.
    pub async fn deliver_raw(&self, from: NodeId, to: NodeId, bytes: &[u8]) {
        let endpoint = {
            let links = self.links.read();
            if !links.is_up(from, to) {
                trace!(%from, %to, "link down, dropping");
                return;
            }
            links.endpoints.get(&to).cloned()
        };
        match endpoint {
            Some(endpoint) => {
                forward(&endpoint, bytes, from).await;
            }
            None => trace!(%to, "no such endpoint, dropping"),
        }
    }

    fn unbind(&self, addr: NodeId) {
        self.links.write().endpoints.remove(&addr);
    }
}

pub struct MemoryTransport {
    local_addr: NodeId,
    network: MemoryNetwork,
    outbound_tx: mpsc::Sender<(Message, NodeId)>,
    sender: Mutex<Option<JoinHandle<()>>>,
}

impl Transport for MemoryTransport {
    fn send(&self, message: Message, destination: NodeId) -> RaftResult<()> {
        enqueue(&self.outbound_tx, message, destination)
    }

    fn local_addr(&self) -> NodeId {
        self.local_addr
    }

    async fn shutdown(&self) {
        self.network.unbind(self.local_addr);
        let sender = self.sender.lock().take();
        if let Some(task) = sender {
            task.abort();
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::message::{RequestVote, RequestVoteResponse};
    use std::net::SocketAddr;
    use tokio::time::{timeout, Duration};

    fn addr(port: u16) -> NodeId {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn vote(term: u64) -> Message {
        Message::RequestVoteResponse(RequestVoteResponse {
            term,
            vote_granted: true,
        })
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let (a_tx, _a_rx) = mpsc::channel(16);
        let (b_tx, mut b_rx) = mpsc::channel(16);
        let a = UdpTransport::bind(addr(0), a_tx, 16).await.unwrap();
        let b = UdpTransport::bind(addr(0), b_tx, 16).await.unwrap();

        let request = Message::RequestVote(RequestVote {
            term: 2,
            candidate_id: a.local_addr(),
            last_log_index: 4,
            last_log_term: 1,
        });
        a.send(request.clone(), b.local_addr()).unwrap();

        let inbound = timeout(Duration::from_secs(5), b_rx.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(inbound.message, request);
        assert_eq!(inbound.sender, a.local_addr());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_udp_unknown_type_is_reported() {
        let (tx, mut rx) = mpsc::channel(16);
        let node = UdpTransport::bind(addr(0), tx, 16).await.unwrap();
        let peer = UdpSocket::bind(addr(0)).await.unwrap();

        peer.send_to(b"not json", node.local_addr()).await.unwrap();
        peer.send_to(br#"{"type":"install_snapshot","term":1}"#, node.local_addr())
            .await
            .unwrap();

        // The garbage datagram is dropped; the unknown type comes through as an error
        let item = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(item, Err(RaftError::UnknownMessageType(ref t)) if t == "install_snapshot"));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_memory_network_delivers() {
        let network = MemoryNetwork::new();
        let (a_tx, _a_rx) = mpsc::channel(16);
        let (b_tx, mut b_rx) = mpsc::channel(16);
        let a = network.bind(addr(1), a_tx, 16);
        let _b = network.bind(addr(2), b_tx, 16);

        a.send(vote(3), addr(2)).unwrap();
        let inbound = b_rx.recv().await.unwrap().unwrap();
        assert_eq!(inbound, Inbound { message: vote(3), sender: addr(1) });
    }

    #[tokio::test]
    async fn test_memory_network_partitions() {
        let network = MemoryNetwork::new();
        let (b_tx, mut b_rx) = mpsc::channel(16);
        let (c_tx, mut c_rx) = mpsc::channel(16);
        let _b = network.bind(addr(2), b_tx, 16);
        let _c = network.bind(addr(3), c_tx, 16);
        let bytes = |term| vote(term).encode().unwrap();

        network.disconnect(addr(1), addr(2));
        assert!(!network.is_connected(addr(2), addr(1)));
        assert!(network.is_connected(addr(1), addr(3)));
        network.deliver_raw(addr(1), addr(2), &bytes(1)).await;
        network.deliver_raw(addr(1), addr(3), &bytes(1)).await;
        assert!(b_rx.try_recv().is_err());
        assert_eq!(c_rx.try_recv().unwrap().unwrap().message, vote(1));

        network.isolate(addr(1));
        network.deliver_raw(addr(1), addr(3), &bytes(2)).await;
        network.deliver_raw(addr(3), addr(1), &bytes(2)).await;
        assert!(c_rx.try_recv().is_err());
        network.deliver_raw(addr(2), addr(3), &bytes(2)).await;
        assert_eq!(c_rx.try_recv().unwrap().unwrap().sender, addr(2));

        network.heal();
        network.deliver_raw(addr(1), addr(2), &bytes(3)).await;
        assert_eq!(b_rx.try_recv().unwrap().unwrap().message, vote(3));
    }

    #[tokio::test]
    async fn test_deliver_raw_unknown_type() {
        let network = MemoryNetwork::new();
        let (tx, mut rx) = mpsc::channel(16);
        let _node = network.bind(addr(1), tx, 16);
        network
            .deliver_raw(addr(9), addr(1), br#"{"type":"gossip","term":1}"#)
            .await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            Err(RaftError::UnknownMessageType(_))
        ));
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::channel(16);
        let node = network.bind(addr(1), tx, 16);
        node.shutdown().await;
        assert!(matches!(
            node.send(vote(1), addr(2)),
            Err(RaftError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::channel(16);
        let node = network.bind(addr(1), tx, 1);
        // The sender task has not run yet on this single-threaded runtime
        node.send(vote(1), addr(2)).unwrap();
        assert!(node.send(vote(1), addr(2)).is_err());
    }
}
