//! # Snapshot Replication
//!
//! Purpose: Keep a slave's shard vector approximately current by pulling a
//! full serialized image of the master's shards over a dedicated port.
//! There is no streaming and no delta — one request, one full snapshot.
//!
//! Wire format: length-prefixed frames (`u32` big-endian length + body).
//! Request body: node id (length-prefixed) + `i64` last-sync timestamp
//! (advisory only). Response body: payload (length-prefixed) + `i64` server
//! timestamp, where the payload is `i32 N` followed by N shard records in
//! the engine codec. Lifecycle handles never travel; the slave's event
//! subscribers stay bound because contents are replaced in place.
//!
//! ## Design Principles
//! 1. **Skip, Don't Queue**: A tick that finds a pull in flight does nothing.
//! 2. **Rate-Limited Noise**: After 10 consecutive failures only every 10th
//!    is logged; the loop keeps trying forever.
//! 3. **Fallback Port**: Bind and connect try command+11000 first, then
//!    command+11001.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use rudis_common::{Config, NodeRole, RudisError, RudisResult};
use rudis_engine::codec;
use rudis_engine::value::{now_ms, Entry};
use rudis_engine::{DbManager, Shard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};

/// Upper bound on a single replication frame.
const MAX_FRAME_BYTES: u32 = 512 * 1024 * 1024;
/// Pause between the primary and fallback connect attempts.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);
/// Failure count after which logging is rate-limited.
const FAILURE_LOG_THRESHOLD: u64 = 10;

/// Where a slave pulls from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterLink {
    pub id: Option<String>,
    pub host: String,
    pub port: u16,
}

impl MasterLink {
    pub fn replication_port(&self) -> u16 {
        self.port.wrapping_add(rudis_common::config::REPLICATION_PORT_OFFSET)
    }

    pub fn replication_fallback_port(&self) -> u16 {
        self.port.wrapping_add(rudis_common::config::REPLICATION_FALLBACK_OFFSET)
    }
}

/// Runtime replication topology: the configured role plus the master binding
/// a slave follows. Mutable at runtime through `SLAVEOF` and failover.
pub struct ReplicationState {
    role: RwLock<NodeRole>,
    master: RwLock<Option<MasterLink>>,
}

impl ReplicationState {
    pub fn from_config(config: &Config) -> Self {
        let master = match config.node_role {
            NodeRole::Slave => Some(MasterLink {
                id: Some(config.master_id.clone()),
                host: config.master_host.clone(),
                port: config.master_port,
            }),
            NodeRole::Master => None,
        };
        ReplicationState {
            role: RwLock::new(config.node_role),
            master: RwLock::new(master),
        }
    }

    pub fn role(&self) -> NodeRole {
        *self.role.read()
    }

    pub fn is_slave(&self) -> bool {
        self.role() == NodeRole::Slave
    }

    pub fn master(&self) -> Option<MasterLink> {
        self.master.read().clone()
    }

    /// Rebinds this node as a slave of the given master.
    pub fn set_master(&self, host: String, port: u16, id: Option<String>) {
        *self.role.write() = NodeRole::Slave;
        *self.master.write() = Some(MasterLink { id, host, port });
    }

    /// Promotes this node to master, dropping the master binding.
    pub fn promote_to_master(&self) {
        *self.role.write() = NodeRole::Master;
        *self.master.write() = None;
    }
}

/// Pull request sent slave → master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub node_id: String,
    /// Advisory; the master always replies with a full snapshot.
    pub last_sync_ms: i64,
}

impl SyncRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::put_bytes(&mut buf, self.node_id.as_bytes());
        buf.extend_from_slice(&self.last_sync_ms.to_be_bytes());
        buf
    }

    pub fn decode(mut buf: &[u8]) -> RudisResult<Self> {
        let node_id = codec::take_bytes(&mut buf)?;
        let last_sync_ms = codec::take_i64(&mut buf)?;
        Ok(SyncRequest {
            node_id: String::from_utf8_lossy(&node_id).into_owned(),
            last_sync_ms,
        })
    }
}

/// Serializes every shard: `i32 N`, then per shard `i32 index`, `i32 count`
/// and the entries in the engine codec.
pub fn encode_shards(shards: &[Arc<Shard>]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(shards.len() as i32).to_be_bytes());
    for shard in shards {
        let entries = shard.snapshot_entries();
        buf.extend_from_slice(&(shard.index() as i32).to_be_bytes());
        buf.extend_from_slice(&(entries.len() as i32).to_be_bytes());
        for (key, entry) in entries {
            codec::put_bytes(&mut buf, &key);
            codec::encode_entry(&mut buf, &entry);
        }
    }
    buf
}

/// Decodes a shard payload into `(index, contents)` records.
pub fn decode_shards(mut buf: &[u8]) -> RudisResult<Vec<(usize, Vec<(Bytes, Entry)>)>> {
    let shard_count = codec::take_i32(&mut buf)?;
    if !(0..=100).contains(&shard_count) {
        return Err(RudisError::Replication(format!(
            "implausible shard count {shard_count}"
        )));
    }
    let mut shards = Vec::with_capacity(shard_count as usize);
    for _ in 0..shard_count {
        let index = codec::take_i32(&mut buf)?;
        let entry_count = codec::take_i32(&mut buf)?;
        if index < 0 || entry_count < 0 {
            return Err(RudisError::Replication("negative shard framing".to_string()));
        }
        let mut contents = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let key = codec::take_bytes(&mut buf)?;
            let entry = codec::decode_entry(&mut buf)?;
            contents.push((key, entry));
        }
        shards.push((index as usize, contents));
    }
    Ok(shards)
}

async fn write_frame(stream: &mut TcpStream, body: &[u8]) -> RudisResult<()> {
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> RudisResult<Vec<u8>> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME_BYTES {
        return Err(RudisError::Replication(format!("frame of {len} bytes refused")));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// Binds the replication listener, falling back to the secondary port.
async fn bind_with_fallback(host: &str, primary: u16, fallback: u16) -> RudisResult<TcpListener> {
    match TcpListener::bind((host, primary)).await {
        Ok(listener) => Ok(listener),
        Err(err) => {
            tracing::warn!(port = primary, error = %err, "replication port busy, trying fallback");
            Ok(TcpListener::bind((host, fallback)).await?)
        }
    }
}

/// Master side: serve full-snapshot pulls until shutdown.
pub fn spawn_server(
    manager: Arc<DbManager>,
    config: &Config,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let host = config.host.clone();
    let primary = config.replication_port();
    let fallback = config.replication_fallback_port();

    tokio::spawn(async move {
        let listener = match bind_with_fallback(&host, primary, fallback).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(error = %err, "replication listener failed to bind");
                return;
            }
        };
        tracing::info!(port = listener.local_addr().map(|a| a.port()).unwrap_or(0),
            "replication listener ready");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(error = %err, "replication accept failed");
                            continue;
                        }
                    };
                    let manager = Arc::clone(&manager);
                    tokio::spawn(async move {
                        if let Err(err) = serve_pull(stream, &manager).await {
                            tracing::warn!(%peer, error = %err, "replication pull failed");
                        }
                    });
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

async fn serve_pull(mut stream: TcpStream, manager: &DbManager) -> RudisResult<()> {
    let request = SyncRequest::decode(&read_frame(&mut stream).await?)?;
    tracing::debug!(slave = %request.node_id, last_sync = request.last_sync_ms, "serving snapshot pull");

    let payload = encode_shards(manager.shards());
    let mut body = Vec::with_capacity(payload.len() + 16);
    codec::put_bytes(&mut body, &payload);
    body.extend_from_slice(&(now_ms() as i64).to_be_bytes());
    write_frame(&mut stream, &body).await
}

/// Slave side: the periodic full-snapshot pull loop.
pub struct ReplicationPuller {
    manager: Arc<DbManager>,
    state: Arc<ReplicationState>,
    node_id: String,
    connect_timeout: Duration,
    read_timeout: Duration,
    in_progress: AtomicBool,
    consecutive_failures: AtomicU64,
    last_sync_ms: AtomicI64,
}

impl ReplicationPuller {
    pub fn new(manager: Arc<DbManager>, state: Arc<ReplicationState>, config: &Config) -> Self {
        ReplicationPuller {
            manager,
            state,
            node_id: config.node_id.clone(),
            connect_timeout: config.sync_connect_timeout(),
            read_timeout: config.sync_read_timeout(),
            in_progress: AtomicBool::new(false),
            consecutive_failures: AtomicU64::new(0),
            last_sync_ms: AtomicI64::new(0),
        }
    }

    /// Spawns the pull loop. It only acts while the node's role is slave, so
    /// a runtime `SLAVEOF`/failover flips pulling on and off.
    pub fn spawn(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(period);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if self.state.is_slave() {
                            self.tick().await;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// One pull attempt with the skip-if-busy and failure-accounting rules.
    pub async fn tick(&self) {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            // A previous pull is still running; never queue a second one.
            return;
        }
        let result = self.pull().await;
        self.in_progress.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            Err(err) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures <= FAILURE_LOG_THRESHOLD || failures % FAILURE_LOG_THRESHOLD == 0 {
                    tracing::warn!(failures, error = %err, "replication pull failed");
                }
            }
        }
    }

    async fn pull(&self) -> RudisResult<()> {
        let Some(master) = self.state.master() else {
            return Ok(());
        };

        let mut stream = self.connect(&master).await?;
        let request = SyncRequest {
            node_id: self.node_id.clone(),
            last_sync_ms: self.last_sync_ms.load(Ordering::SeqCst),
        };
        write_frame(&mut stream, &request.encode()).await?;

        let body = timeout(self.read_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| RudisError::Replication("read timed out".to_string()))??;
        let mut body_slice = body.as_slice();
        let payload = codec::take_bytes(&mut body_slice)?;
        let server_ts = codec::take_i64(&mut body_slice)?;

        let shards = decode_shards(&payload)?;
        let local = self.manager.shards();
        for (index, contents) in shards {
            match local.get(index) {
                Some(shard) => shard.replace_contents(contents),
                None => tracing::warn!(index, "master sent unknown shard index"),
            }
        }
        self.last_sync_ms.store(server_ts, Ordering::SeqCst);

        // Persist the pulled image so the reload loop re-reads fresh state.
        if let Err(err) = self.manager.save() {
            tracing::warn!(error = %err, "persisting pulled snapshot failed");
        }
        tracing::debug!(master = %master.host, "snapshot pull applied");
        Ok(())
    }

    async fn connect(&self, master: &MasterLink) -> RudisResult<TcpStream> {
        let primary = (master.host.clone(), master.replication_port());
        match self.try_connect(&primary.0, primary.1).await {
            Ok(stream) => Ok(stream),
            Err(first) => {
                tokio::time::sleep(RETRY_BACKOFF).await;
                self.try_connect(&master.host, master.replication_fallback_port())
                    .await
                    .map_err(|_| first)
            }
        }
    }

    async fn try_connect(&self, host: &str, port: u16) -> RudisResult<TcpStream> {
        let stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| RudisError::Replication(format!("connect to {host}:{port} timed out")))??;
        Ok(stream)
    }
}
