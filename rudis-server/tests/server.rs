//! Full-stack tests: a bound server driven through the sync client.

use std::time::Duration;

use rudis_client::{ClientConfig, ClientError, KVClient};
use rudis_common::Config;
use rudis_server::Server;
use tokio::sync::oneshot;

fn client_for(port: u16) -> KVClient {
    KVClient::with_config(ClientConfig {
        addr: format!("127.0.0.1:{port}"),
        max_idle: 1,
        max_total: 2,
        read_timeout: Some(Duration::from_secs(2)),
        write_timeout: Some(Duration::from_secs(2)),
        connect_timeout: Some(Duration::from_secs(2)),
    })
    .expect("client")
}

async fn start_server(config: Config) -> (oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let server = Server::bind(config).await.expect("bind");
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        server
            .run_until(async {
                let _ = stop_rx.await;
            })
            .await
            .expect("run");
    });
    // Give the accept loop a beat before clients connect.
    tokio::time::sleep(Duration::from_millis(100)).await;
    (stop_tx, handle)
}

#[tokio::test(flavor = "multi_thread")]
async fn serves_commands_over_tcp() {
    let dir = tempfile::tempdir().expect("tempdir");
    let port = 17801;
    let config = Config {
        port,
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let (stop, handle) = start_server(config).await;

    let checks = tokio::task::spawn_blocking(move || {
        let client = client_for(port);

        assert_eq!(client.ping(None).expect("ping"), b"PONG".to_vec());
        client.set(b"k", b"v").expect("set");
        assert_eq!(client.get(b"k").expect("get"), Some(b"v".to_vec()));
        assert_eq!(client.get(b"missing").expect("get"), None);

        client.lpush(b"l", &[b"a", b"b"]).expect("lpush");
        assert_eq!(
            client.lrange(b"l", 0, -1).expect("lrange"),
            vec![b"b".to_vec(), b"a".to_vec()]
        );

        let info = client.info().expect("info");
        let info = String::from_utf8_lossy(&info).into_owned();
        assert!(info.contains("role:master"), "info was: {info}");

        // A command error keeps the connection usable.
        match client.command(&[b"LPUSH", b"k", b"x"]).expect("command") {
            rudis_client::RespValue::Error(message) => {
                assert!(message.starts_with(b"WRONGTYPE"));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(client.get(b"k").expect("get"), Some(b"v".to_vec()));
    });
    checks.await.expect("client checks");

    let _ = stop.send(());
    handle.await.expect("server task");
}

#[tokio::test(flavor = "multi_thread")]
async fn slave_rejects_writes_over_tcp() {
    let dir = tempfile::tempdir().expect("tempdir");
    let port = 17805;
    let config = Config {
        port,
        data_dir: dir.path().to_path_buf(),
        node_role: rudis_common::NodeRole::Slave,
        master_host: "127.0.0.1".to_string(),
        // Nothing is listening there; the puller just fails quietly.
        master_port: 1,
        ..Config::default()
    };
    let (stop, handle) = start_server(config).await;

    let checks = tokio::task::spawn_blocking(move || {
        let client = client_for(port);
        match client.set(b"k", b"v") {
            Err(ClientError::Server { message }) => {
                assert!(message.starts_with(b"READONLY"), "got {message:?}");
            }
            other => panic!("expected READONLY rejection, got {other:?}"),
        }
        assert_eq!(client.get(b"k").expect("get"), None);
    });
    checks.await.expect("client checks");

    let _ = stop.send(());
    handle.await.expect("server task");
}
