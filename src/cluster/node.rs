// src/cluster/node.rs
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, info_span, Instrument};

use super::error::{RaftError, RaftResult};
use super::message::{Inbound, LogEntry, LogIndex, NodeId};
use super::state::{NodeStatus, RaftState};
use super::transport::{MemoryNetwork, Transport, UdpTransport};
use crate::config::{Config, RaftConfig};

const COMMAND_QUEUE: usize = 64;
const APPLIED_BUFFER: usize = 1024;

// Requests from a NodeHandle to the driver task
enum Command {
    Propose {
        command: Vec<u8>,
        reply: oneshot::Sender<RaftResult<LogIndex>>,
    },
    Entries {
        reply: oneshot::Sender<Vec<LogEntry>>,
    },
    Stop,
}

/// Builder for one cluster member.
#[derive(Debug, Clone)]
pub struct RaftNode {
    address: NodeId,
    peers: Vec<NodeId>,
    config: RaftConfig,
}

impl RaftNode {
    pub fn new(address: NodeId) -> Self {
        Self::with_config(address, RaftConfig::default())
    }

    pub fn with_config(address: NodeId, config: RaftConfig) -> Self {
        RaftNode {
            address,
            peers: Vec::new(),
            config,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut node = Self::with_config(config.node.address, config.raft.clone());
        for &peer in &config.node.peers {
            node.add_peer(peer);
        }
        node
    }

    pub fn add_peer(&mut self, peer: NodeId) -> &mut Self {
        if peer != self.address && !self.peers.contains(&peer) {
            self.peers.push(peer);
        }
        self
    }

    pub fn address(&self) -> NodeId {
        self.address
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    /// Binds a UDP socket at the node address and starts as a follower.
    pub async fn start(self) -> RaftResult<NodeHandle> {
        self.config.validate()?;
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_queue_capacity);
        let transport =
            UdpTransport::bind(self.address, inbound_tx, self.config.outbound_queue_capacity).await?;
        Ok(self.launch(transport, inbound_rx))
    }

    /// Joins an in-process network instead of binding a socket.
    pub fn start_in(self, network: &MemoryNetwork) -> RaftResult<NodeHandle> {
        self.config.validate()?;
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_queue_capacity);
        let transport = network.bind(self.address, inbound_tx, self.config.outbound_queue_capacity);
        Ok(self.launch(transport, inbound_rx))
    }

    fn launch<T: Transport>(
        self,
        transport: T,
        inbound: mpsc::Receiver<RaftResult<Inbound>>,
    ) -> NodeHandle {
        // Port 0 is resolved by the bind; peers know us by the real address
        let id = transport.local_addr();
        let state = RaftState::new(id, self.peers, self.config);

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (status_tx, status_rx) = watch::channel(state.status());
        let (applied_tx, _) = broadcast::channel(APPLIED_BUFFER);

        let driver = Driver {
            state,
            transport,
            inbound,
            commands: command_rx,
            status: status_tx,
            applied: applied_tx.clone(),
        };
        let task = tokio::spawn(driver.run().instrument(info_span!("raft", node = %id)));

        NodeHandle {
            id,
            commands: command_tx,
            status: status_rx,
            applied: applied_tx,
            driver: task,
        }
    }
}

/// Owns the state machine and runs every handler and timer on one task.
struct Driver<T: Transport> {
    state: RaftState,
    transport: T,
    inbound: mpsc::Receiver<RaftResult<Inbound>>,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<NodeStatus>,
    applied: broadcast::Sender<LogEntry>,
}

impl<T: Transport> Driver<T> {
    async fn run(mut self) -> RaftResult<()> {
        self.state.start(Instant::now());

        let result = loop {
            self.flush();
            let deadline = self.state.next_deadline();

            tokio::select! {
                item = self.inbound.recv() => match item {
                    Some(Ok(Inbound { message, sender })) => {
                        self.state.handle(message, sender, Instant::now());
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "fatal inbound error, halting");
                        break Err(e);
                    }
                    None => break Err(RaftError::Shutdown("transport closed".to_string())),
                },
                command = self.commands.recv() => match command {
                    Some(Command::Propose { command, reply }) => {
                        let _ = reply.send(self.state.propose(command));
                    }
                    Some(Command::Entries { reply }) => {
                        let _ = reply.send(self.state.log().entries().to_vec());
                    }
                    Some(Command::Stop) | None => break Ok(()),
                },
                _ = wait_for(deadline) => self.state.tick(Instant::now()),
            }
        };

        self.state.stop();
        self.flush_status();
        self.transport.shutdown().await;
        result
    }

    fn flush(&mut self) {
        for (message, destination) in self.state.take_outbox() {
            if let Err(e) = self.transport.send(message, destination) {
                debug!(error = %e, "message dropped");
            }
        }
        for entry in self.state.take_committed() {
            // Nobody listening is fine
            let _ = self.applied.send(entry);
        }
        self.flush_status();
    }

    fn flush_status(&self) {
        let status = self.state.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Control surface of a running node.
pub struct NodeHandle {
    id: NodeId,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<NodeStatus>,
    applied: broadcast::Sender<LogEntry>,
    driver: JoinHandle<RaftResult<()>>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    /// A receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    /// Committed entries in log order, from the moment of subscribing.
    pub fn subscribe_applied(&self) -> broadcast::Receiver<LogEntry> {
        self.applied.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.driver.is_finished()
    }

    /// Appends a command if this node leads. Returns the entry's log index;
    /// the entry is applied once it shows up on `subscribe_applied`.
    pub async fn propose(&self, command: Vec<u8>) -> RaftResult<LogIndex> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Propose { command, reply }).await?;
        rx.await.map_err(|_| not_running())?
    }

    /// A copy of the local log.
    pub async fn entries(&self) -> RaftResult<Vec<LogEntry>> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Entries { reply }).await?;
        rx.await.map_err(|_| not_running())
    }

    /// Stops the node and reports why its driver ended.
    pub async fn stop(self) -> RaftResult<()> {
        let _ = self.commands.send(Command::Stop).await;
        let result = self
            .driver
            .await
            .map_err(|e| RaftError::Shutdown(e.to_string()))?;
        info!(node = %self.id, "node halted");
        result
    }

    async fn request(&self, command: Command) -> RaftResult<()> {
        self.commands.send(command).await.map_err(|_| not_running())
    }
}

fn not_running() -> RaftError {
    RaftError::Shutdown("node is not running".to_string())
}
