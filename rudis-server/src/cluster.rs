//! # Cluster Gossip
//!
//! Purpose: Maintain a registry of peer nodes on a dedicated port
//! (command + 20000), exchange heartbeats, walk peers through the
//! online → suspect → offline ladder, and carry the failover message
//! protocol. Promotion itself is driven by an operator (or by the offline
//! transition of the master) — there is no election.
//!
//! Messages are single JSON documents, one per line, sent over a short-lived
//! TCP connection: 3 s connect timeout, three attempts, 500 ms backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::RwLock;
use rudis_common::{Config, NodeRole, RudisError, RudisResult};
use rudis_engine::now_ms;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};

use crate::replication::ReplicationState;

/// Offset from a peer's command port to its gossip port.
const GOSSIP_PORT_OFFSET: u16 = 20000;
/// Socket policy for inter-node sends.
const SEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const SEND_ATTEMPTS: u32 = 3;
const SEND_BACKOFF: Duration = Duration::from_millis(500);

/// Kinds of gossip messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Heartbeat,
    Ping,
    Pong,
    NodeAdded,
    NodeRemoved,
    FailoverStart,
    FailoverEnd,
    SyncRequest,
    SyncResponse,
}

/// One gossip message; `receiver` is absent for broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    pub timestamp: u64,
}

/// Liveness ladder of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Suspect,
    /// Known from config but never heard from yet.
    Handshake,
}

/// One registry entry.
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub id: String,
    pub host: String,
    /// Command port; the gossip port is derived.
    pub port: u16,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub master_id: Option<String>,
    pub last_heartbeat: u64,
}

impl NodeDescriptor {
    fn gossip_port(&self) -> u16 {
        self.port.wrapping_add(GOSSIP_PORT_OFFSET)
    }
}

/// Identity block carried inside heartbeats and NODE_ADDED payloads, so
/// peers learned only via gossip still have an address and role.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeInfo {
    id: String,
    host: String,
    port: u16,
    role: NodeRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    master_id: Option<String>,
}

/// FAILOVER_START payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FailoverNotice {
    failed: String,
    new_master: String,
}

/// The gossip service for one node.
pub struct ClusterService {
    node_id: String,
    host: String,
    port: u16,
    registry: RwLock<HashMap<String, NodeDescriptor>>,
    replication: Arc<ReplicationState>,
    heartbeat_interval: Duration,
    status_interval: Duration,
    node_timeout_ms: u64,
    failover_running: AtomicBool,
}

impl ClusterService {
    pub fn new(config: &Config, replication: Arc<ReplicationState>) -> Self {
        let mut registry = HashMap::new();
        let now = now_ms();
        for peer in config.peers() {
            registry.insert(
                peer.id.clone(),
                NodeDescriptor {
                    id: peer.id,
                    host: peer.host,
                    port: peer.port,
                    role: NodeRole::Slave,
                    status: NodeStatus::Handshake,
                    master_id: Some(config.master_id.clone()),
                    last_heartbeat: now,
                },
            );
        }
        if config.node_role == NodeRole::Slave {
            registry.insert(
                config.master_id.clone(),
                NodeDescriptor {
                    id: config.master_id.clone(),
                    host: config.master_host.clone(),
                    port: config.master_port,
                    role: NodeRole::Master,
                    status: NodeStatus::Handshake,
                    master_id: None,
                    last_heartbeat: now,
                },
            );
        }
        // This node never tracks itself.
        registry.remove(&config.node_id);

        ClusterService {
            node_id: config.node_id.clone(),
            host: config.host.clone(),
            port: config.port,
            registry: RwLock::new(registry),
            replication,
            heartbeat_interval: config.heartbeat_interval_duration(),
            status_interval: config.node_status_interval_duration(),
            node_timeout_ms: config.node_timeout_duration().as_millis() as u64,
            failover_running: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Snapshot of the registry, for `INFO` and tests.
    pub fn nodes(&self) -> Vec<NodeDescriptor> {
        let mut nodes: Vec<NodeDescriptor> = self.registry.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Starts the gossip listener and the two timers.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let service = Arc::clone(self);
        let mut listener_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let addr = (service.host.clone(), service.port.wrapping_add(GOSSIP_PORT_OFFSET));
            let listener = match TcpListener::bind(addr.clone()).await {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::error!(port = addr.1, error = %err, "gossip listener failed to bind");
                    return;
                }
            };
            tracing::info!(port = addr.1, "gossip listener ready");
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        let service = Arc::clone(&service);
                        tokio::spawn(async move {
                            service.read_messages(stream).await;
                        });
                    }
                    _ = listener_shutdown.changed() => break,
                }
            }
        }));

        let service = Arc::clone(self);
        let mut heartbeat_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = interval(service.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => service.heartbeat_tick().await,
                    _ = heartbeat_shutdown.changed() => break,
                }
            }
        }));

        let service = Arc::clone(self);
        let mut status_shutdown = shutdown;
        tasks.push(tokio::spawn(async move {
            let mut tick = interval(service.status_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => service.status_tick().await,
                    _ = status_shutdown.changed() => break,
                }
            }
        }));

        tasks
    }

    async fn read_messages(self: Arc<Self>, stream: TcpStream) {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<ClusterMessage>(trimmed) {
                Ok(message) => self.handle_message(message).await,
                Err(err) => tracing::warn!(error = %err, "undecodable gossip message"),
            }
        }
    }

    /// Applies one inbound gossip message.
    pub async fn handle_message(&self, message: ClusterMessage) {
        match message.kind {
            MessageType::Heartbeat | MessageType::Pong => {
                self.learn_sender(&message);
                self.mark_online(&message.sender, now_ms());
            }
            MessageType::Ping => {
                self.learn_sender(&message);
                self.mark_online(&message.sender, now_ms());
                if let Some(peer) = self.lookup(&message.sender) {
                    let pong = self.message(MessageType::Pong, Some(peer.id.clone()), None);
                    self.send(&peer, &pong).await;
                }
            }
            MessageType::NodeAdded => {
                if let Some(info) = decode_payload::<NodeInfo>(&message) {
                    self.add_node(info);
                }
            }
            MessageType::NodeRemoved => {
                if let Some(id) = message.payload {
                    self.registry.write().remove(&id);
                    tracing::info!(node = %id, "peer removed from registry");
                }
            }
            MessageType::FailoverStart => {
                if let Some(notice) = decode_payload::<FailoverNotice>(&message) {
                    self.apply_failover(&notice.failed, &notice.new_master);
                }
            }
            MessageType::FailoverEnd => {
                tracing::info!(sender = %message.sender, "failover completed");
                self.failover_running.store(false, Ordering::SeqCst);
            }
            MessageType::SyncRequest => {
                if let Some(peer) = self.lookup(&message.sender) {
                    let roster: Vec<NodeInfo> =
                        self.nodes().iter().map(node_info).collect();
                    let payload = serde_json::to_string(&roster).ok();
                    let response =
                        self.message(MessageType::SyncResponse, Some(peer.id.clone()), payload);
                    self.send(&peer, &response).await;
                }
            }
            MessageType::SyncResponse => {
                if let Some(roster) = decode_payload::<Vec<NodeInfo>>(&message) {
                    for info in roster {
                        self.add_node(info);
                    }
                }
            }
        }
    }

    /// Broadcast a heartbeat, then demote peers that went quiet.
    pub async fn heartbeat_tick(&self) {
        let heartbeat = self.message(
            MessageType::Heartbeat,
            None,
            serde_json::to_string(&self.self_info()).ok(),
        );
        self.broadcast(&heartbeat).await;

        for id in self.sweep_suspects(now_ms()) {
            tracing::warn!(node = %id, "peer heartbeat overdue, now suspect");
        }
    }

    /// Ping suspects and push long-silent ones to offline; an offline master
    /// triggers the failover protocol.
    pub async fn status_tick(&self) {
        let suspects: Vec<NodeDescriptor> = {
            let registry = self.registry.read();
            registry
                .values()
                .filter(|node| node.status == NodeStatus::Suspect)
                .cloned()
                .collect()
        };
        for peer in &suspects {
            let ping = self.message(MessageType::Ping, Some(peer.id.clone()), None);
            self.send(peer, &ping).await;
        }

        for id in self.sweep_offline(now_ms()) {
            tracing::warn!(node = %id, "peer offline");
            let our_master = self.replication.master().and_then(|link| link.id);
            if our_master.as_deref() == Some(id.as_str()) {
                if let Err(err) = self.initiate_failover(None).await {
                    tracing::error!(error = %err, "failover after master loss failed");
                }
            }
        }
    }

    /// Online peers whose heartbeat is older than the node timeout become
    /// suspect. Returns the ids that transitioned.
    pub fn sweep_suspects(&self, now: u64) -> Vec<String> {
        let mut transitioned = Vec::new();
        let mut registry = self.registry.write();
        for node in registry.values_mut() {
            if node.status == NodeStatus::Online
                && now.saturating_sub(node.last_heartbeat) > self.node_timeout_ms
            {
                node.status = NodeStatus::Suspect;
                transitioned.push(node.id.clone());
            }
        }
        transitioned
    }

    /// Suspect peers silent for twice the node timeout become offline.
    pub fn sweep_offline(&self, now: u64) -> Vec<String> {
        let mut transitioned = Vec::new();
        let mut registry = self.registry.write();
        for node in registry.values_mut() {
            if node.status == NodeStatus::Suspect
                && now.saturating_sub(node.last_heartbeat) > 2 * self.node_timeout_ms
            {
                node.status = NodeStatus::Offline;
                transitioned.push(node.id.clone());
            }
        }
        transitioned
    }

    /// Picks the replacement master: the online slave of `failed` with the
    /// most recent heartbeat.
    pub fn choose_new_master(&self, failed: &str) -> Option<String> {
        let registry = self.registry.read();
        registry
            .values()
            .filter(|node| {
                node.status == NodeStatus::Online
                    && node.role == NodeRole::Slave
                    && node.master_id.as_deref() == Some(failed)
            })
            .max_by_key(|node| node.last_heartbeat)
            .map(|node| node.id.clone())
    }

    /// Runs the failover protocol: FAILOVER_START broadcast, local registry
    /// and role updates, FAILOVER_END broadcast.
    pub async fn initiate_failover(&self, preferred: Option<String>) -> RudisResult<()> {
        if self.failover_running.swap(true, Ordering::SeqCst) {
            return Err(RudisError::Replication("failover already running".to_string()));
        }

        let failed = match self.replication.master().and_then(|link| link.id) {
            Some(id) => id,
            // A master handing off names itself as the failed node.
            None => self.node_id.clone(),
        };
        let candidate = preferred
            .or_else(|| self.choose_new_master(&failed))
            .or_else(|| {
                // This node is always an implicit candidate for its own master.
                self.replication.is_slave().then(|| self.node_id.clone())
            });
        let Some(new_master) = candidate else {
            self.failover_running.store(false, Ordering::SeqCst);
            return Err(RudisError::Replication("no failover candidate".to_string()));
        };

        tracing::info!(failed = %failed, new_master = %new_master, "starting failover");
        let notice = FailoverNotice {
            failed: failed.clone(),
            new_master: new_master.clone(),
        };
        let start = self.message(
            MessageType::FailoverStart,
            None,
            serde_json::to_string(&notice).ok(),
        );
        self.broadcast(&start).await;

        self.apply_failover(&failed, &new_master);

        let end = self.message(MessageType::FailoverEnd, None, None);
        self.broadcast(&end).await;
        self.failover_running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Registry and role updates shared by the initiator and the receivers
    /// of FAILOVER_START.
    pub fn apply_failover(&self, failed: &str, new_master: &str) {
        {
            let mut registry = self.registry.write();
            if let Some(node) = registry.get_mut(failed) {
                node.status = NodeStatus::Offline;
            }
            for node in registry.values_mut() {
                if node.id == new_master {
                    node.role = NodeRole::Master;
                    node.master_id = None;
                } else if node.master_id.as_deref() == Some(failed) {
                    node.master_id = Some(new_master.to_string());
                }
            }
        }

        if self.node_id == new_master {
            self.replication.promote_to_master();
            tracing::info!("promoted to master");
            return;
        }

        let our_master = self.replication.master().and_then(|link| link.id);
        if our_master.as_deref() == Some(failed) {
            if let Some(node) = self.lookup(new_master) {
                self.replication
                    .set_master(node.host.clone(), node.port, Some(node.id.clone()));
                tracing::info!(master = %node.id, "rebound to new master");
            } else {
                tracing::warn!(master = %new_master, "new master unknown to registry");
            }
        }
    }

    fn learn_sender(&self, message: &ClusterMessage) {
        if let Some(info) = decode_payload::<NodeInfo>(message) {
            self.add_node(info);
        }
    }

    fn add_node(&self, info: NodeInfo) {
        if info.id == self.node_id {
            return;
        }
        let mut registry = self.registry.write();
        registry.entry(info.id.clone()).or_insert_with(|| {
            tracing::info!(node = %info.id, "peer added to registry");
            NodeDescriptor {
                id: info.id.clone(),
                host: info.host.clone(),
                port: info.port,
                role: info.role,
                status: NodeStatus::Handshake,
                master_id: info.master_id.clone(),
                last_heartbeat: now_ms(),
            }
        });
    }

    /// Receipt of HEARTBEAT or PONG forces the sender online.
    pub fn mark_online(&self, id: &str, now: u64) {
        let mut registry = self.registry.write();
        if let Some(node) = registry.get_mut(id) {
            node.status = NodeStatus::Online;
            node.last_heartbeat = now;
        }
    }

    fn lookup(&self, id: &str) -> Option<NodeDescriptor> {
        self.registry.read().get(id).cloned()
    }

    fn self_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.node_id.clone(),
            host: self.host.clone(),
            port: self.port,
            role: self.replication.role(),
            master_id: self.replication.master().and_then(|link| link.id),
        }
    }

    fn message(
        &self,
        kind: MessageType,
        receiver: Option<String>,
        payload: Option<String>,
    ) -> ClusterMessage {
        ClusterMessage {
            kind,
            sender: self.node_id.clone(),
            receiver,
            payload,
            timestamp: now_ms(),
        }
    }

    async fn broadcast(&self, message: &ClusterMessage) {
        let peers = self.nodes();
        for peer in peers {
            self.send(&peer, message).await;
        }
    }

    /// One-shot send: connect, write one JSON line, close. Three attempts
    /// with a fixed backoff.
    async fn send(&self, peer: &NodeDescriptor, message: &ClusterMessage) {
        let Ok(mut line) = serde_json::to_string(message) else {
            return;
        };
        line.push('\n');
        let addr = (peer.host.clone(), peer.gossip_port());

        for attempt in 1..=SEND_ATTEMPTS {
            let connected = timeout(SEND_CONNECT_TIMEOUT, TcpStream::connect(addr.clone())).await;
            match connected {
                Ok(Ok(mut stream)) => {
                    if stream.write_all(line.as_bytes()).await.is_ok() {
                        return;
                    }
                }
                Ok(Err(_)) | Err(_) => {}
            }
            if attempt < SEND_ATTEMPTS {
                tokio::time::sleep(SEND_BACKOFF).await;
            }
        }
        tracing::debug!(peer = %peer.id, kind = ?message.kind, "gossip send failed");
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(message: &ClusterMessage) -> Option<T> {
    message
        .payload
        .as_deref()
        .and_then(|payload| serde_json::from_str(payload).ok())
}

fn node_info(node: &NodeDescriptor) -> NodeInfo {
    NodeInfo {
        id: node.id.clone(),
        host: node.host.clone(),
        port: node.port,
        role: node.role,
        master_id: node.master_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(role: NodeRole) -> ClusterService {
        let config = Config {
            node_id: "node1".to_string(),
            node_role: role,
            master_id: "m1".to_string(),
            master_host: "127.0.0.1".to_string(),
            master_port: 7000,
            slave_nodes: vec![
                "node2:127.0.0.1:7002".to_string(),
                "node3:127.0.0.1:7003".to_string(),
            ],
            node_timeout: 30,
            ..Config::default()
        };
        let replication = Arc::new(ReplicationState::from_config(&config));
        ClusterService::new(&config, replication)
    }

    #[test]
    fn messages_roundtrip_as_json() {
        let message = ClusterMessage {
            kind: MessageType::FailoverStart,
            sender: "node1".to_string(),
            receiver: None,
            payload: Some("{\"failed\":\"m1\",\"new_master\":\"node2\"}".to_string()),
            timestamp: 42,
        };
        let encoded = serde_json::to_string(&message).expect("encode");
        assert!(encoded.contains("\"FAILOVER_START\""));
        let decoded: ClusterMessage = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded.kind, MessageType::FailoverStart);
        assert_eq!(decoded.sender, "node1");
        assert!(decoded.receiver.is_none());
    }

    #[test]
    fn registry_seeds_from_config() {
        let cluster = service(NodeRole::Slave);
        let ids: Vec<String> = cluster.nodes().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["m1", "node2", "node3"]);
    }

    #[test]
    fn heartbeat_silence_walks_the_status_ladder() {
        let cluster = service(NodeRole::Slave);
        let now = now_ms();
        cluster.mark_online("node2", now);

        // Fresh heartbeat: stays online.
        assert!(cluster.sweep_suspects(now + 1000).is_empty());

        // Past the timeout: online -> suspect.
        let later = now + 31_000;
        assert_eq!(cluster.sweep_suspects(later), vec!["node2"]);

        // Not yet past twice the timeout: stays suspect.
        assert!(cluster.sweep_offline(later).is_empty());

        // Past twice the timeout: suspect -> offline.
        let much_later = now + 61_000;
        assert_eq!(cluster.sweep_offline(much_later), vec!["node2"]);
    }

    #[test]
    fn heartbeat_receipt_forces_online() {
        let cluster = service(NodeRole::Slave);
        let now = now_ms();
        cluster.mark_online("node2", now);
        cluster.sweep_suspects(now + 31_000);

        cluster.mark_online("node2", now + 32_000);
        let node = cluster
            .nodes()
            .into_iter()
            .find(|n| n.id == "node2")
            .expect("node2");
        assert_eq!(node.status, NodeStatus::Online);
    }

    #[test]
    fn new_master_choice_prefers_freshest_online_slave() {
        let cluster = service(NodeRole::Slave);
        let now = now_ms();
        cluster.mark_online("node2", now - 5000);
        cluster.mark_online("node3", now - 1000);

        assert_eq!(cluster.choose_new_master("m1"), Some("node3".to_string()));

        // Offline candidates are skipped.
        cluster.sweep_suspects(now + 31_000);
        cluster.sweep_offline(now + 61_000);
        assert_eq!(cluster.choose_new_master("m1"), None);
    }

    #[test]
    fn failover_promotes_self_when_chosen() {
        let cluster = service(NodeRole::Slave);
        assert!(cluster.replication.is_slave());

        cluster.apply_failover("m1", "node1");
        assert_eq!(cluster.replication.role(), NodeRole::Master);
        assert!(cluster.replication.master().is_none());
    }

    #[test]
    fn failover_rebinds_slaves_of_the_failed_master() {
        let cluster = service(NodeRole::Slave);
        cluster.apply_failover("m1", "node2");

        assert!(cluster.replication.is_slave());
        let link = cluster.replication.master().expect("link");
        assert_eq!(link.id.as_deref(), Some("node2"));
        assert_eq!(link.port, 7002);

        // The other slave's descriptor now follows the new master.
        let node3 = cluster
            .nodes()
            .into_iter()
            .find(|n| n.id == "node3")
            .expect("node3");
        assert_eq!(node3.master_id.as_deref(), Some("node2"));
    }
}
