//! Master/slave replication over loopback: a slave pull replaces the local
//! shard vector with the master's state.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rudis_common::{Config, NodeRole};
use rudis_engine::{DbManager, Value};
use rudis_server::replication::{spawn_server, ReplicationPuller, ReplicationState};
use tokio::sync::watch;

fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

#[tokio::test(flavor = "multi_thread")]
async fn slave_pull_converges_to_master_state() {
    let master_port = 17821;

    let master_dir = tempfile::tempdir().expect("tempdir");
    let master_config = Config {
        port: master_port,
        data_dir: master_dir.path().to_path_buf(),
        ..Config::default()
    };
    let master = DbManager::new(master_config.clone()).expect("master manager");
    master.shard(0).unwrap().set(b("k"), Value::Str(b("from-master")));
    master.shard(2).unwrap().set(b("other"), Value::Str(b("shard-2")));
    master.shard(0).unwrap().set(b("expiring"), Value::Str(b("v")));
    master.shard(0).unwrap().expire(b"expiring", 60_000);

    let (shutdown_tx, _) = watch::channel(false);
    let listener = spawn_server(Arc::clone(&master), &master_config, shutdown_tx.subscribe());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let slave_dir = tempfile::tempdir().expect("tempdir");
    let slave_config = Config {
        port: 17822,
        data_dir: slave_dir.path().to_path_buf(),
        node_id: "slave1".to_string(),
        node_role: NodeRole::Slave,
        master_host: "127.0.0.1".to_string(),
        master_port,
        sync_connect_timeout_ms: 2000,
        sync_read_timeout_ms: 5000,
        ..Config::default()
    };
    let slave = DbManager::new(slave_config.clone()).expect("slave manager");
    let state = Arc::new(ReplicationState::from_config(&slave_config));
    let puller = ReplicationPuller::new(Arc::clone(&slave), state, &slave_config);

    // Stale local state must be replaced wholesale by the pull.
    slave.shard(0).unwrap().set(b("stale"), Value::Str(b("old")));

    puller.tick().await;

    assert_eq!(
        slave
            .shard(0)
            .unwrap()
            .read(b"k", |value| match value {
                Value::Str(data) => data.clone(),
                _ => Bytes::new(),
            })
            .expect("key replicated"),
        b("from-master")
    );
    assert!(slave.shard(2).unwrap().exists(b"other"));
    assert!(!slave.shard(0).unwrap().exists(b"stale"));

    // Expirations travel with the snapshot.
    let ttl = slave.shard(0).unwrap().ttl_ms(b"expiring");
    assert!(ttl > 0 && ttl <= 60_000, "ttl replicated: {ttl}");

    // The pulled image was persisted, so a reload keeps the master's state.
    slave.load().expect("reload");
    assert!(slave.shard(0).unwrap().exists(b"k"));

    let _ = shutdown_tx.send(true);
    listener.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn pull_failure_leaves_local_state_intact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Config {
        port: 17831,
        data_dir: dir.path().to_path_buf(),
        node_id: "slave1".to_string(),
        node_role: NodeRole::Slave,
        master_host: "127.0.0.1".to_string(),
        // Nothing listens on the derived replication ports.
        master_port: 3,
        sync_connect_timeout_ms: 300,
        sync_read_timeout_ms: 500,
        ..Config::default()
    };
    let manager = DbManager::new(config.clone()).expect("manager");
    manager.shard(0).unwrap().set(b("local"), Value::Str(b("kept")));

    let state = Arc::new(ReplicationState::from_config(&config));
    let puller = ReplicationPuller::new(Arc::clone(&manager), state, &config);

    // Several failing ticks: state resets to idle and data stays put.
    for _ in 0..3 {
        puller.tick().await;
    }
    assert!(manager.shard(0).unwrap().exists(b"local"));
}
