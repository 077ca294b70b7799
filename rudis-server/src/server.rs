//! # TCP Server
//!
//! Accept line-oriented command connections, dispatch them against the
//! keyspace, and host the background services: replication listener, pull
//! loop, and — when enabled — cluster gossip.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use rudis_common::{Config, RudisResult};
use rudis_engine::DbManager;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cluster::ClusterService;
use crate::dispatch::{self, ConnState, ServerContext};
use crate::replication::{self, ReplicationPuller};
use crate::resp;

/// Greeting written to every new connection, kept bit-exact for wire
/// compatibility with existing deployments.
const GREETING: &[u8] = b"+OK Welcome to Java-Redis Server\n";

/// A bound server with its background services running.
pub struct Server {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    shutdown_tx: watch::Sender<bool>,
    background: Vec<JoinHandle<()>>,
}

impl Server {
    /// Builds the manager, starts its schedulers, binds every listener, and
    /// spawns the replication and gossip services.
    pub async fn bind(config: Config) -> RudisResult<Server> {
        config.validate()?;
        let manager = DbManager::new(config.clone())?;
        for shard in manager.shards() {
            shard.subscribe(Arc::new(|event: &rudis_engine::KeyspaceEvent| {
                tracing::debug!(shard = event.shard, kind = ?event.kind, key = %String::from_utf8_lossy(&event.key), "keyspace event");
            }));
        }
        manager.start();

        let ctx = Arc::new(ServerContext::new(config.clone(), Arc::clone(&manager)));
        let (shutdown_tx, _) = watch::channel(false);
        let mut background = Vec::new();

        background.push(replication::spawn_server(
            Arc::clone(&manager),
            &config,
            shutdown_tx.subscribe(),
        ));

        let puller = Arc::new(ReplicationPuller::new(
            Arc::clone(&manager),
            Arc::clone(&ctx.replication),
            &config,
        ));
        background.push(puller.spawn(config.sync_interval_duration(), shutdown_tx.subscribe()));

        if config.cluster_enabled {
            let cluster = Arc::new(ClusterService::new(&config, Arc::clone(&ctx.replication)));
            background.extend(cluster.spawn(shutdown_tx.subscribe()));
            *ctx.cluster.write() = Some(cluster);
        }

        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        tracing::info!(addr = %listener.local_addr()?, "command listener ready");

        Ok(Server {
            ctx,
            listener,
            shutdown_tx,
            background,
        })
    }

    pub fn local_addr(&self) -> RudisResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Serves connections until `signal` resolves, then shuts down: stop the
    /// background services, drain the manager, final persistence.
    pub async fn run_until<F>(self, signal: F) -> RudisResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(signal);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(ctx, stream).await {
                            tracing::debug!(%peer, error = %err, "connection closed with error");
                        }
                    });
                }
                _ = &mut signal => break,
            }
        }

        tracing::info!("shutting down");
        let _ = self.shutdown_tx.send(true);
        for task in self.background {
            task.abort();
        }
        self.ctx.manager.shutdown().await;
        Ok(())
    }
}

async fn handle_connection(ctx: Arc<ServerContext>, stream: TcpStream) -> std::io::Result<()> {
    ctx.stats.connection_opened();
    let result = serve_commands(&ctx, stream).await;
    ctx.stats.connection_closed();
    result
}

async fn serve_commands(ctx: &ServerContext, stream: TcpStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    write_half.write_all(GREETING).await?;

    let mut conn = ConnState::default();
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
            line.pop();
        }

        let reply = match resp::tokenize(&line) {
            Ok(tokens) if tokens.is_empty() => continue,
            Ok(tokens) => dispatch::dispatch(ctx, &mut conn, &tokens),
            Err(err) => {
                ctx.stats.error_replied();
                resp::error(&err.wire_message())
            }
        };
        write_half.write_all(&reply).await?;
    }
    Ok(())
}
