//! # Database Manager
//!
//! Purpose: Own the fixed shard vector for the lifetime of the process,
//! run persistence load at startup, and drive the periodic machinery —
//! per-shard expiration reapers, snapshot saves or append-log flushes, and
//! the slave reload loop.
//!
//! ## Design Principles
//! 1. **Explicit Ownership**: The manager is constructed and passed around;
//!    there is no process-wide singleton.
//! 2. **Cooperative Shutdown**: Every periodic task watches one shutdown
//!    channel; shutdown drains them within a bounded window, then aborts.
//! 3. **Background Failures Stay Background**: A failed save or flush is
//!    logged and the task loop keeps ticking.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rudis_common::{AofFsync, Config, NodeRole, PersistenceMode, RudisError, RudisResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant};

use crate::aof::AppendLog;
use crate::shard::Shard;
use crate::snapshot::SnapshotStore;
use crate::value::now_ms;

/// Period of the per-shard expiration reaper.
const REAPER_PERIOD: Duration = Duration::from_secs(1);
/// Period of the append-log maintenance task (flush + rewrite check).
const AOF_MAINTENANCE_PERIOD: Duration = Duration::from_secs(1);
/// Bound on the shutdown drain window.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Owner of the shard vector and the persistence schedulers.
pub struct DbManager {
    shards: Vec<Arc<Shard>>,
    snapshot: SnapshotStore,
    append_log: Option<Arc<AppendLog>>,
    config: Config,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DbManager {
    /// Allocates the shard vector and runs persistence load for the
    /// configured mode.
    pub fn new(config: Config) -> RudisResult<Arc<Self>> {
        let shards: Vec<Arc<Shard>> = (0..config.database_count)
            .map(|i| Arc::new(Shard::new(i)))
            .collect();
        let snapshot = SnapshotStore::new(config.rdb_path(), config.rdb_compression);
        let append_log = match config.persistence_mode {
            PersistenceMode::Aof => Some(Arc::new(AppendLog::new(
                config.aof_path(),
                config.aof_fsync,
            )?)),
            PersistenceMode::Rdb => None,
        };

        let (shutdown_tx, _) = watch::channel(false);
        let manager = Arc::new(DbManager {
            shards,
            snapshot,
            append_log,
            config,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });
        manager.load()?;
        Ok(manager)
    }

    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    pub fn database_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard lookup with the bounds check every `SELECT` goes through.
    pub fn shard(&self, index: usize) -> RudisResult<&Arc<Shard>> {
        self.shards.get(index).ok_or(RudisError::UnknownShard)
    }

    pub fn append_log(&self) -> Option<&Arc<AppendLog>> {
        self.append_log.as_ref()
    }

    pub fn persistence_mode(&self) -> PersistenceMode {
        self.config.persistence_mode
    }

    /// Runs persistence load for the configured mode against the current
    /// shard vector. Also the body of the slave reload loop.
    pub fn load(&self) -> RudisResult<()> {
        match self.config.persistence_mode {
            PersistenceMode::Rdb => self.snapshot.load(&self.shards),
            PersistenceMode::Aof => {
                // Replay always starts from a clean slate; repeated reloads
                // must not double-apply list pushes.
                for shard in &self.shards {
                    shard.replace_contents(Vec::new());
                }
                match self.append_log.as_ref() {
                    Some(log) => log.load(&self.shards),
                    None => Ok(()),
                }
            }
        }
    }

    /// Saves the current keyspace with the configured strategy.
    pub fn save(&self) -> RudisResult<()> {
        match self.config.persistence_mode {
            PersistenceMode::Rdb => self.snapshot.save(&self.shards),
            PersistenceMode::Aof => match self.append_log.as_ref() {
                Some(log) => log.rewrite(&self.shards),
                None => Ok(()),
            },
        }
    }

    /// Spawns the periodic machinery: reapers, the persistence timer, and —
    /// on a slave — the reload loop.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        for shard in &self.shards {
            let shard = Arc::clone(shard);
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut tick = interval(REAPER_PERIOD);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            let removed = shard.purge_expired(now_ms());
                            if removed > 0 {
                                tracing::debug!(shard = shard.index(), removed, "reaper removed expired keys");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        match self.config.persistence_mode {
            PersistenceMode::Rdb => {
                let manager = Arc::clone(self);
                let mut shutdown = self.shutdown_tx.subscribe();
                let period = Duration::from_secs(self.config.rdb_save_interval.max(1));
                tasks.push(tokio::spawn(async move {
                    let mut tick = interval(period);
                    tick.tick().await; // skip the immediate first tick
                    loop {
                        tokio::select! {
                            _ = tick.tick() => {
                                if let Err(err) = manager.snapshot.save(&manager.shards) {
                                    tracing::error!(error = %err, "periodic snapshot save failed");
                                }
                            }
                            _ = shutdown.changed() => break,
                        }
                    }
                }));
            }
            PersistenceMode::Aof => {
                if let Some(log) = self.append_log.clone() {
                    let manager = Arc::clone(self);
                    let mut shutdown = self.shutdown_tx.subscribe();
                    let everysec = self.config.aof_fsync == AofFsync::Everysec;
                    let rewrite_size = self.config.aof_rewrite_size;
                    tasks.push(tokio::spawn(async move {
                        let mut tick = interval(AOF_MAINTENANCE_PERIOD);
                        loop {
                            tokio::select! {
                                _ = tick.tick() => {
                                    if everysec {
                                        if let Err(err) = log.flush() {
                                            tracing::error!(error = %err, "append-log flush failed");
                                        }
                                    }
                                    if rewrite_size > 0 && log.size() > rewrite_size {
                                        if let Err(err) = log.rewrite(&manager.shards) {
                                            tracing::error!(error = %err, "append-log rewrite failed");
                                        }
                                    }
                                }
                                _ = shutdown.changed() => break,
                            }
                        }
                    }));
                }
            }
        }

        if self.config.node_role == NodeRole::Slave {
            let manager = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            let period = self.config.sync_interval_duration();
            tasks.push(tokio::spawn(async move {
                let mut tick = interval(period);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(err) = manager.load() {
                                tracing::warn!(error = %err, "slave persistence reload failed");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }
    }

    /// Stops the schedulers (bounded drain, then abort) and performs the
    /// final persistence step for the configured mode.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        for mut task in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if timeout(remaining, &mut task).await.is_err() {
                task.abort();
            }
        }

        let result = match self.config.persistence_mode {
            PersistenceMode::Rdb => self.snapshot.save(&self.shards),
            PersistenceMode::Aof => match self.append_log.as_ref() {
                Some(log) => log.close(),
                None => Ok(()),
            },
        };
        if let Err(err) = result {
            tracing::error!(error = %err, "final persistence step failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::value::Value;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn config_in(dir: &tempfile::TempDir) -> Config {
        Config {
            data_dir: dir.path().to_path_buf(),
            database_count: 4,
            ..Config::default()
        }
    }

    #[test]
    fn new_allocates_shards_and_materializes_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = DbManager::new(config_in(&dir)).expect("manager");
        assert_eq!(manager.database_count(), 4);
        assert!(manager.shard(3).is_ok());
        assert!(matches!(manager.shard(4), Err(RudisError::UnknownShard)));
        assert!(dir.path().join("dump.rdb").exists());
    }

    #[test]
    fn state_survives_restart_in_rdb_mode() {
        let dir = tempfile::tempdir().expect("tempdir");

        let manager = DbManager::new(config_in(&dir)).expect("manager");
        manager.shard(0).unwrap().set(b("k"), Value::Str(b("v")));
        manager.save().expect("save");

        let reborn = DbManager::new(config_in(&dir)).expect("manager");
        match reborn.shard(0).unwrap().get(b"k") {
            Some(Value::Str(data)) => assert_eq!(data, b("v")),
            other => panic!("wrong value: {other:?}"),
        }
    }

    #[test]
    fn state_survives_restart_in_aof_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            persistence_mode: PersistenceMode::Aof,
            aof_fsync: AofFsync::Always,
            ..config_in(&dir)
        };

        let manager = DbManager::new(config.clone()).expect("manager");
        let log = manager.append_log().expect("log").clone();
        manager.shard(1).unwrap().set(b("k"), Value::Str(b("v")));
        log.append(1, &[b"SET", b"k", b"v"]);

        let reborn = DbManager::new(config).expect("manager");
        assert!(reborn.shard(1).unwrap().exists(b"k"));
        assert!(reborn.shard(0).unwrap().is_empty());
    }

    #[test]
    fn aof_reload_does_not_double_apply() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            persistence_mode: PersistenceMode::Aof,
            aof_fsync: AofFsync::Always,
            ..config_in(&dir)
        };

        let manager = DbManager::new(config).expect("manager");
        let log = manager.append_log().expect("log").clone();
        log.append(0, &[b"RPUSH", b"l", b"x"]);
        manager.load().expect("first load");
        manager.load().expect("second load");

        let len = manager
            .shard(0)
            .unwrap()
            .read(b"l", |value| match value {
                Value::List(items) => items.len(),
                _ => 0,
            })
            .unwrap_or(0);
        assert_eq!(len, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reaper_reclaims_expired_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = DbManager::new(config_in(&dir)).expect("manager");
        manager.start();

        let shard = manager.shard(0).unwrap();
        shard.set(b("dying"), Value::Str(b("v")));
        shard.expire(b"dying", 50);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        // The reaper removed it even though nothing read the key.
        assert_eq!(shard.len(), 0);

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_performs_final_save() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = DbManager::new(config_in(&dir)).expect("manager");
        manager.start();
        manager.shard(0).unwrap().set(b("k"), Value::Str(b("v")));
        manager.shutdown().await;

        let reborn = DbManager::new(config_in(&dir)).expect("manager");
        assert!(reborn.shard(0).unwrap().exists(b"k"));
    }
}
